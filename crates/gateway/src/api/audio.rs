//! Audio endpoints: multipart transcription and streamed speech.

use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::extract::{Multipart, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use lmn_domain::model::ModelType;
use lmn_domain::Error;
use lmn_engines::Operation;

use crate::api::error::ApiResult;
use crate::autoload;
use crate::state::AppState;

/// POST /audio/transcriptions (multipart). The upload is staged to a temp
/// file; the ASR adapter re-posts it to the engine.
pub async fn transcriptions(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut audio: Option<(String, Bytes)> = None;
    let mut fields: HashMap<String, String> = HashMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidRequest(format!("bad multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field
                .file_name()
                .unwrap_or("audio.wav")
                .to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| Error::InvalidRequest(format!("reading upload: {e}")))?;
            audio = Some((file_name, bytes));
        } else {
            let text = field
                .text()
                .await
                .map_err(|e| Error::InvalidRequest(format!("reading field {name}: {e}")))?;
            fields.insert(name, text);
        }
    }

    let (file_name, bytes) =
        audio.ok_or_else(|| Error::InvalidRequest("a file part is required".into()))?;
    let model = fields
        .remove("model")
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::InvalidRequest("the model field is required".into()))?;

    autoload::ensure_loaded(&state, &model, ModelType::Audio).await?;

    // Stage to disk with the original extension so the engine can sniff
    // the container format.
    let suffix = std::path::Path::new(&file_name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_else(|| ".wav".into());
    let staged = tempfile::Builder::new()
        .prefix("lemonade-audio-")
        .suffix(&suffix)
        .tempfile()
        .map_err(Error::Io)?;
    tokio::fs::write(staged.path(), &bytes).await?;

    let reply = state
        .scheduler
        .transcribe(&model, staged.path(), &fields)
        .await?;
    Ok(Json(reply))
}

/// POST /audio/speech. Always proxied as a byte stream; the engine
/// decides between raw PCM (`stream=true`) and an encoded container.
pub async fn speech(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("request body is not JSON: {e}")))?;
    let model = parsed
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::InvalidRequest("the model field is required".into()))?
        .to_string();
    let streaming = parsed
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    autoload::ensure_loaded(&state, &model, ModelType::Audio).await?;

    let stream = state
        .scheduler
        .forward_stream(Operation::AudioSpeech, body.to_vec())
        .await?;

    let content_type = if streaming { "audio/pcm" } else { "audio/mpeg" };
    let response = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
        .map_err(|e| Error::Engine(format!("building audio response: {e}")))?;
    Ok(response.into_response())
}
