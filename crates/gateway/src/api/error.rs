//! The HTTP error envelope.
//!
//! Every error response is `{"error": {message, type, code, ...}}`; status
//! codes follow the fixed mapping below. Handlers return
//! [`ApiResult`] and rely on this `IntoResponse` impl.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use lmn_domain::Error;

pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        Self(Error::from(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) | Error::ModelNotSupported { .. } | Error::ModelNotLoaded(_) => {
                StatusCode::NOT_FOUND
            }
            Error::InvalidRequest(_) | Error::UnsupportedOperation { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, code = self.0.code(), "request failed");
        } else {
            tracing::debug!(error = %self.0, code = self.0.code(), "request rejected");
        }

        let mut body = json!({
            "error": {
                "message": self.0.to_string(),
                "type": self.0.error_type(),
                "code": self.0.code(),
            }
        });
        if let Some(model) = self.0.requested_model() {
            body["error"]["requested_model"] = json!(model);
        }
        // The one field the OpenAI SDKs key on for validation errors.
        if matches!(&self.0, Error::InvalidRequest(msg) if msg.contains("model field")) {
            body["error"]["param"] = json!("model");
        }

        (status, Json(body)).into_response()
    }
}

/// `/delete` on an unknown model answers 422 rather than 404.
pub fn unprocessable(message: impl Into<String>) -> Response {
    let message = message.into();
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({
            "error": {
                "message": message,
                "type": "invalid_request_error",
                "code": "model_not_found",
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(e: Error) -> StatusCode {
        ApiError(e).into_response().status()
    }

    #[test]
    fn status_mapping_matches_contract() {
        assert_eq!(status_of(Error::NotFound("m".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(Error::ModelNotLoaded("m".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(Error::ModelNotSupported {
                model: "m".into(),
                reason: "no npu".into()
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(Error::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(Error::UnsupportedOperation {
                op: "embeddings".into(),
                device: "cpu".into()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(Error::ModelLoadError("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(Error::ModelInvalidated("m".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(Error::DownloadIncomplete("m".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
