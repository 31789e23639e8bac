//! Model catalog endpoints.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use lmn_domain::model::ModelEntry;

use crate::api::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub show_all: bool,
}

/// OpenAI-style model list. Without `show_all=true` only downloaded
/// models appear.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let data: Vec<Value> = state
        .catalog
        .list(query.show_all)
        .values()
        .map(model_json)
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let entry = state.catalog.lookup(&id)?;
    Ok(Json(model_json(&entry)))
}

pub(crate) fn model_json(entry: &ModelEntry) -> Value {
    let mut value = json!({
        "id": entry.name,
        "object": "model",
        "created": chrono::Utc::now().timestamp(),
        "owned_by": "lemonade",
        "checkpoint": entry.main_checkpoint(),
        "recipe": entry.recipe,
        "downloaded": entry.downloaded,
        "suggested": entry.suggested,
        "labels": entry.labels,
        "recipe_options": entry.recipe_options,
    });
    if entry.size_gb > 0.0 {
        value["size"] = json!(entry.size_gb);
    }
    if let Some(defaults) = &entry.image_defaults {
        value["image_defaults"] = json!(defaults);
    }
    value
}
