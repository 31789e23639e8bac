//! API router and bearer-token auth.

pub mod audio;
pub mod chat;
pub mod error;
pub mod images;
pub mod manage;
pub mod models;
pub mod system;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Build the full router: every endpoint at its bare path plus the
/// versioned aliases (`/v0`, `/v1`) and the `/api/` prefixed forms.
pub fn router(state: AppState) -> Router {
    let core = core_routes();

    let mut app = core.clone();
    for prefix in ["/v0", "/v1", "/api/v0", "/api/v1"] {
        app = app.nest(prefix, core.clone());
    }

    app.layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .with_state(state)
}

fn core_routes() -> Router<AppState> {
    Router::new()
        // Introspection
        .route("/health", get(system::health))
        .route("/stats", get(system::stats))
        .route("/system-info", get(system::system_info))
        .route("/system-stats", get(system::system_stats))
        .route("/log-level", post(system::log_level))
        // Model catalog
        .route("/models", get(models::list))
        .route("/models/:id", get(models::get))
        // OpenAI inference surface
        .route("/chat/completions", post(chat::chat_completions))
        .route("/completions", post(chat::completions))
        .route("/responses", post(chat::responses))
        .route("/embeddings", post(chat::embeddings))
        .route("/reranking", post(chat::reranking))
        .route("/audio/transcriptions", post(audio::transcriptions))
        .route("/audio/speech", post(audio::speech))
        .route("/images/generations", post(images::generations))
        // Model management
        .route("/pull", post(manage::pull))
        .route("/load", post(manage::load))
        .route("/unload", post(manage::unload))
        .route("/delete", post(manage::delete))
}

/// Bearer auth on the prefixed trees when `LEMONADE_API_KEY` is set.
/// The configured key is hashed once at startup; comparison is constant
/// time over hashes.
async fn require_bearer(
    axum::extract::State(state): axum::extract::State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_key_hash else {
        return next.run(request).await;
    };

    let path = request.uri().path();
    let protected = ["/api/", "/v0/", "/v1/"]
        .iter()
        .any(|p| path.starts_with(p));
    if !protected {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let authorized = presented
        .map(|token| {
            let hash = Sha256::digest(token.as_bytes());
            hash.as_slice().ct_eq(expected.as_slice()).into()
        })
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": {
                    "message": "missing or invalid bearer token",
                    "type": "invalid_request_error",
                    "code": "invalid_request_error",
                }
            })),
        )
            .into_response();
    }
    next.run(request).await
}
