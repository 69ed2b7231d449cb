use crate::models::content_hash::ContentHash;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, future::Future, io, time::Duration};
use thiserror::Error;

/// Failures surfaced by the upload coordinator and its collaborators.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Store or network unavailable, or an operation timed out. Safe to retry unchanged.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// The assembled content does not hash to the claimed value.
    #[error("integrity check failed: expected {expected}, computed {actual}")]
    IntegrityMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Finalize was requested before every declared chunk arrived.
    #[error("{} of {expected} chunks missing: {missing:?}", missing.len())]
    MissingChunks { expected: u32, missing: Vec<u32> },

    /// Late chunk after finalize began, finalize without a session, and similar
    /// client sequencing errors.
    #[error("session conflict: {0}")]
    SessionConflict(String),

    #[error("declared size {declared} does not match {received} received bytes")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl From<sqlx::Error> for UploadError {
    fn from(err: sqlx::Error) -> Self {
        UploadError::TransientIo(format!("metadata store: {err}"))
    }
}

impl From<io::Error> for UploadError {
    fn from(err: io::Error) -> Self {
        UploadError::TransientIo(err.to_string())
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        UploadError::TransientIo(format!("corrupt session record: {err}"))
    }
}

/// Run `fut` with a caller-visible deadline; expiry becomes `TransientIo`.
pub async fn bounded<T, F>(limit: Duration, op: &str, fut: F) -> UploadResult<T>
where
    F: Future<Output = UploadResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(UploadError::TransientIo(format!(
            "{op} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message);
        }

        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::IntegrityMismatch { .. } | UploadError::SizeMismatch { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            UploadError::MissingChunks { .. }
            | UploadError::SessionConflict(_)
            | UploadError::Conflict(_) => StatusCode::CONFLICT,
            UploadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            UploadError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
