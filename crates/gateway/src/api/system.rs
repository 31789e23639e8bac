//! Introspection endpoints: health, stats, system info, live stats, and
//! runtime log-level control.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use lmn_domain::Error;

use crate::api::error::ApiResult;
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let limits = state.scheduler.limits();
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "model_loaded": state.scheduler.get_loaded_model().await,
        "all_models_loaded": state.scheduler.get_all_loaded_models().await,
        "max_models": {
            "llm": limits.llm,
            "embedding": limits.embedding,
            "reranking": limits.reranking,
            "audio": limits.audio,
            "image": limits.image,
        },
        "log_streaming": { "sse": false, "websocket": false },
    }))
}

/// Last telemetry for the most recently used instance.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.mru_stats().await {
        Some((model, stats, uptime)) => Json(json!({
            "model": model,
            "requests": stats.requests,
            "failures": stats.failures,
            "last_latency_ms": stats.last_latency_ms,
            "uptime_s": uptime.as_secs(),
        })),
        None => Json(json!({})),
    }
}

pub async fn system_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "os": state.snapshot.os,
        "hardware": &*state.snapshot,
        "recipes": state.filter.recipes_table(),
    }))
}

/// Live utilization. The sampler blocks for one sysinfo tick, so it runs
/// on the blocking pool.
pub async fn system_stats() -> ApiResult<Json<serde_json::Value>> {
    let stats = tokio::task::spawn_blocking(lmn_hardware::stats::sample)
        .await
        .map_err(|e| Error::Engine(format!("stats sampler panicked: {e}")))?;
    Ok(Json(json!({
        "cpu_percent": stats.cpu_percent,
        "memory_gb": stats.memory_gb,
        "gpu_percent": stats.gpu_percent,
        "vram_gb": stats.vram_gb,
    })))
}

#[derive(Deserialize)]
pub struct LogLevelRequest {
    pub level: String,
}

pub async fn log_level(
    State(state): State<AppState>,
    Json(request): Json<LogLevelRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let filter = request
        .level
        .parse::<EnvFilter>()
        .map_err(|e| Error::InvalidRequest(format!("invalid log level {}: {e}", request.level)))?;
    state
        .log_reload
        .reload(filter)
        .map_err(|e| Error::Engine(format!("applying log level: {e}")))?;
    tracing::info!(level = %request.level, "log level changed");
    Ok(Json(json!({ "status": "ok", "level": request.level })))
}
