//! Model management: pull (with SSE progress), load, unload, delete.

use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use lmn_artifacts::flm::FlmRunner;
use lmn_artifacts::progress::NullSink;
use lmn_artifacts::{CancelToken, DownloadEvent, ProgressSink};
use lmn_catalog::UserModelSpec;
use lmn_domain::model::{ModelEntry, ModelSource, Recipe};
use lmn_domain::options::RecipeOptions;
use lmn_domain::{Error, Result};
use lmn_engines::install;

use crate::api::error::{unprocessable, ApiResult};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /pull
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct PullRequest {
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    /// Fast path: the files are already under the hub cache, just resolve
    /// and register.
    #[serde(default)]
    pub local_import: bool,
    /// Hub-cache-relative directory for `local_import`.
    #[serde(default)]
    pub path: Option<String>,
    /// Recipe for newly registered local imports.
    #[serde(default)]
    pub recipe: Option<Recipe>,
}

pub async fn pull(
    State(state): State<AppState>,
    Json(request): Json<PullRequest>,
) -> ApiResult<Response> {
    if request.local_import {
        let name = local_import(&state, &request)?;
        return Ok(Json(json!({ "status": "ok", "model_name": name })).into_response());
    }

    let entry = state.catalog.lookup(&request.model)?;

    if !request.stream {
        // An explicit pull always checks the remote revision
        // (do_not_upgrade = false).
        download_entry(&state, &entry, &NullSink, &CancelToken::new()).await?;
        return Ok(Json(json!({ "status": "ok", "model_name": entry.name })).into_response());
    }

    // Streaming: run the download in a task, relay progress as SSE. A
    // dropped receiver (client gone) cancels the transfer and keeps the
    // partial files for resume.
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Event>(64);
    let cancel = CancelToken::new();
    let sink = SseSink {
        tx: tx.clone(),
        cancel: cancel.clone(),
    };

    let task_state = state.clone();
    tokio::spawn(async move {
        let result = download_entry(&task_state, &entry, &sink, &cancel).await;
        let final_event = match result {
            Ok(()) => Event::default()
                .event("complete")
                .data(json!({ "model_name": entry.name }).to_string()),
            Err(e) => Event::default()
                .event("error")
                .data(json!({ "message": e.to_string(), "code": e.code() }).to_string()),
        };
        let _ = tx.send(final_event).await;
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok::<_, std::convert::Infallible>(event);
        }
    };
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Progress sink that relays into the SSE channel. A closed channel means
/// the client disconnected: flag the cancel token so the transfer aborts.
struct SseSink {
    tx: tokio::sync::mpsc::Sender<Event>,
    cancel: CancelToken,
}

impl ProgressSink for SseSink {
    fn emit(&self, event: DownloadEvent) {
        // The completion event is sent by the task wrapper.
        if matches!(event, DownloadEvent::Completed) {
            return;
        }
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        match self.tx.try_send(Event::default().event("progress").data(payload)) {
            Ok(()) => {}
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                // Progress thinning: dropping an update is fine.
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                self.cancel.cancel();
            }
        }
    }
}

/// One pull, any recipe. FLM delegates to the engine's own pull command;
/// everything else goes through the artifact store.
async fn download_entry(
    state: &AppState,
    entry: &ModelEntry,
    sink: &dyn ProgressSink,
    cancel: &CancelToken,
) -> Result<()> {
    if entry.recipe == Recipe::Flm {
        let binary = install::ensure_installed(
            &state.config.cache_root(),
            Recipe::Flm,
            "npu",
            Duration::from_secs(state.config.engine.install_timeout_sec),
        )
        .await?;
        let runner = FlmRunner::new(binary);
        runner.pull(entry.main_checkpoint(), sink, cancel).await?;
        if let Ok(installed) = runner.installed().await {
            state.catalog.refresh_flm(&installed);
        }
        state.catalog.mark_downloaded(&entry.name, true);
        return Ok(());
    }

    state.artifacts.download(entry, false, sink, cancel).await?;
    state.catalog.mark_downloaded(&entry.name, true);
    Ok(())
}

fn local_import(state: &AppState, request: &PullRequest) -> Result<String> {
    let path = request
        .path
        .as_deref()
        .ok_or_else(|| Error::InvalidRequest("local_import requires a path".into()))?;
    let import = state.artifacts.local_import(path)?;
    let name = state.catalog.register_user(UserModelSpec {
        suffix: request.model.clone(),
        checkpoint: import.main,
        recipe: request.recipe.unwrap_or(Recipe::LlamaCpp),
        labels: vec!["custom".into()],
        mmproj: import.mmproj,
        source: Some(ModelSource::LocalUpload),
    })?;
    state.catalog.mark_downloaded(&name, true);
    Ok(name)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /load
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct LoadRequest {
    pub model: String,
    #[serde(default)]
    pub recipe_options: RecipeOptions,
    /// Persist the given options as the model's saved options.
    #[serde(default)]
    pub save_options: bool,
}

pub async fn load(
    State(state): State<AppState>,
    Json(request): Json<LoadRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let entry = state.catalog.lookup(&request.model)?;

    if request.save_options && !request.recipe_options.is_empty() {
        state
            .catalog
            .save_options(&request.model, request.recipe_options.clone())?;
    }

    // Force-load still prefers the cached artifacts.
    if !entry.downloaded && entry.recipe != Recipe::Flm {
        state
            .artifacts
            .download(&entry, true, &NullSink, &CancelToken::new())
            .await?;
        state.catalog.mark_downloaded(&request.model, true);
    }
    let entry = state.catalog.lookup(&request.model)?;

    state
        .scheduler
        .load(&request.model, &entry, request.recipe_options, true)
        .await?;
    Ok(Json(json!({ "status": "ok", "model_name": request.model })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /unload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize, Default)]
pub struct UnloadRequest {
    /// Absent or empty unloads everything.
    #[serde(default)]
    pub model: Option<String>,
}

pub async fn unload(
    State(state): State<AppState>,
    body: Option<Json<UnloadRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    let model = body
        .map(|Json(r)| r.model.unwrap_or_default())
        .unwrap_or_default();
    state.scheduler.unload(&model).await?;
    Ok(Json(json!({ "status": "ok" })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /delete
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Deserialize)]
pub struct DeleteRequest {
    pub model: String,
}

pub async fn delete(
    State(state): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> Response {
    // 422 rather than 404 for an unknown model.
    if !state.catalog.exists(&request.model) && !state.catalog.exists_unfiltered(&request.model) {
        return unprocessable(format!("model {} is not known", request.model));
    }

    match delete_inner(&state, &request.model).await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => crate::api::error::ApiError(e).into_response(),
    }
}

async fn delete_inner(state: &AppState, model: &str) -> Result<()> {
    // Unload first when resident; not being loaded is fine.
    match state.scheduler.unload(model).await {
        Ok(()) | Err(Error::ModelNotLoaded(_)) => {}
        Err(e) => return Err(e),
    }

    let entry = state
        .catalog
        .get(model)
        .or_else(|_| state.catalog.get_unfiltered(model))?;
    lmn_artifacts::store::delete_artifacts(state.artifacts.hub_cache(), &entry)?;

    if entry.is_user() {
        state.catalog.delete_user(model)?;
    } else {
        state.catalog.mark_downloaded(model, false);
    }
    tracing::info!(model, "model deleted");
    Ok(())
}
