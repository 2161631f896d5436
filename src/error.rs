use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Error taxonomy for the cache data plane.
///
/// Every RPC failure is one of these variants, never a single opaque
/// string — tests and clients both depend on the precise status.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("unknown or missing API key")]
    Authentication,

    #[error("no live worker endpoints")]
    Unavailable,

    #[error("transport failure talking to worker {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("internal invariant violation: {0}")]
    Internal(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl CacheError {
    /// Machine-readable status code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            CacheError::Authentication => "UNAUTHENTICATED",
            CacheError::Unavailable => "UNAVAILABLE",
            CacheError::Transport { .. } => "UNAVAILABLE",
            CacheError::Internal(_) => "INTERNAL",
            CacheError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            CacheError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            CacheError::Config(_) => "INVALID_CONFIG",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CacheError::Authentication => StatusCode::UNAUTHORIZED,
            CacheError::Unavailable | CacheError::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CacheError::ResourceExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
            CacheError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            CacheError::Config(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
