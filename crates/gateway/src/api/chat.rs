//! OpenAI-style inference endpoints: chat, completions, responses,
//! embeddings, reranking.
//!
//! The gateway is a transparent proxy: request JSON goes to the engine
//! unmodified (after auto-load), and SSE streams come back byte for byte.

use axum::body::{Body, Bytes};
use axum::extract::State;
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

pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    infer(state, Operation::ChatCompletion, ModelType::Llm, body, true).await
}

pub async fn completions(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    infer(state, Operation::Completion, ModelType::Llm, body, true).await
}

pub async fn responses(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    infer(state, Operation::Responses, ModelType::Llm, body, true).await
}

pub async fn embeddings(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    infer(state, Operation::Embeddings, ModelType::Embedding, body, false).await
}

pub async fn reranking(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    infer(state, Operation::Reranking, ModelType::Reranking, body, false).await
}

/// Shared flow: parse, auto-load with a type check, then forward either
/// as JSON or as a pass-through SSE stream.
async fn infer(
    state: AppState,
    op: Operation,
    required: ModelType,
    body: Bytes,
    streamable: bool,
) -> ApiResult<Response> {
    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("request body is not JSON: {e}")))?;
    let model = parsed
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::InvalidRequest("the model field is required".into()))?
        .to_string();

    autoload::ensure_loaded(&state, &model, required).await?;

    let wants_stream = streamable
        && parsed
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);

    if wants_stream {
        let stream = state.scheduler.forward_stream(op, body.to_vec()).await?;
        let response = Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .map_err(|e| Error::Engine(format!("building stream response: {e}")))?;
        return Ok(response);
    }

    let reply = state.scheduler.forward_json(op, parsed).await?;
    Ok(Json(reply).into_response())
}
