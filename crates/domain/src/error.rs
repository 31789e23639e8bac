/// Shared error type used across all lemonade crates.
///
/// Variants map one-to-one onto the error codes the HTTP boundary emits;
/// [`Error::code`] and [`Error::error_type`] provide that mapping so the
/// gateway crate never has to match on variants itself.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("model not found: {0}")]
    NotFound(String),

    #[error("model {model} is not supported on this host: {reason}")]
    ModelNotSupported { model: String, reason: String },

    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("model load failed: {0}")]
    ModelLoadError(String),

    #[error("model invalidated by engine upgrade, re-pull required: {0}")]
    ModelInvalidated(String),

    #[error("operation {op} is not supported on device {device}")]
    UnsupportedOperation { op: String, device: String },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("download incomplete: {0}")]
    DownloadIncomplete(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("config: {0}")]
    Config(String),

    #[error("engine: {0}")]
    Engine(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The stable error code carried in the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_) => "invalid_request_error",
            Error::NotFound(_) => "model_not_found",
            Error::ModelNotSupported { .. } => "model_not_supported",
            Error::ModelNotLoaded(_) => "model_not_loaded",
            Error::ModelLoadError(_) => "model_load_error",
            Error::ModelInvalidated(_) => "model_invalidated",
            Error::UnsupportedOperation { .. } => "unsupported_operation",
            Error::FileNotFound(_) => "not_found",
            Error::DownloadIncomplete(_) => "download_incomplete",
            Error::Cancelled(_) => "cancelled",
            _ => "internal_error",
        }
    }

    /// Coarse error class, OpenAI-style (`invalid_request_error` vs
    /// `server_error`), also carried in the envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::InvalidRequest(_)
            | Error::NotFound(_)
            | Error::ModelNotSupported { .. }
            | Error::ModelNotLoaded(_)
            | Error::UnsupportedOperation { .. }
            | Error::FileNotFound(_) => "invalid_request_error",
            _ => "server_error",
        }
    }

    /// The model name a request referenced, when the error carries one.
    pub fn requested_model(&self) -> Option<&str> {
        match self {
            Error::NotFound(m)
            | Error::ModelNotLoaded(m)
            | Error::ModelNotSupported { model: m, .. } => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::NotFound("x".into()).code(), "model_not_found");
        assert_eq!(Error::ModelNotLoaded("x".into()).code(), "model_not_loaded");
        assert_eq!(Error::Http("boom".into()).code(), "internal_error");
    }

    #[test]
    fn requested_model_only_for_model_errors() {
        assert_eq!(
            Error::ModelNotLoaded("m".into()).requested_model(),
            Some("m")
        );
        assert!(Error::Http("x".into()).requested_model().is_none());
    }
}
