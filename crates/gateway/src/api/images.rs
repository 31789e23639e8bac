//! Image generation endpoint.

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde_json::Value;

use lmn_domain::model::ModelType;
use lmn_domain::Error;
use lmn_engines::Operation;

use crate::api::error::ApiResult;
use crate::autoload;
use crate::state::AppState;

pub async fn generations(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("request body is not JSON: {e}")))?;
    let model = parsed
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::InvalidRequest("the model field is required".into()))?
        .to_string();

    autoload::ensure_loaded(&state, &model, ModelType::Image).await?;
    let reply = state
        .scheduler
        .forward_json(Operation::ImageGenerations, parsed)
        .await?;
    Ok(Json(reply))
}
