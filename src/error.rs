//! Error handling for nvrd
//!
//! Per-session and per-monitor errors never terminate the process; they are
//! isolated by their owning supervisor and surfaced here only when a caller
//! (usually the HTTP layer) needs to see them.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation error (bad id, bad URL, malformed config). Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict (duplicate publisher, concurrent set)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Resource error (disk full, fifo create failed). The monitor fails to start.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Protocol error (bad RTSP request). The session is closed, the server continues.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Subprocess exited abnormally
    #[error("Process error: {0}")]
    Process(String),

    /// No new segment observed within the deadline
    #[error("keyframe timeout")]
    KeyframeTimeout,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Fatal error, propagated to the process root, triggers shutdown
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            Error::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            Error::Resource(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "RESOURCE_ERROR",
                msg.clone(),
            ),
            Error::Protocol(msg) => (StatusCode::BAD_REQUEST, "PROTOCOL_ERROR", msg.clone()),
            Error::Process(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "PROCESS_ERROR",
                msg.clone(),
            ),
            Error::KeyframeTimeout => (
                StatusCode::SERVICE_UNAVAILABLE,
                "KEYFRAME_TIMEOUT",
                self.to_string(),
            ),
            Error::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "SERIALIZATION_ERROR",
                e.to_string(),
            ),
            Error::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e.to_string()),
            Error::Fatal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "FATAL", msg.clone()),
            Error::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}
