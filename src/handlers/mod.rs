//! HTTP handlers. Each one parses its inputs, delegates to the
//! `UploadCoordinator`, and maps `UploadError` into `AppError`.

pub mod file_handlers;
pub mod health_handlers;
pub mod upload_handlers;
pub mod user;

use crate::{errors::AppError, models::content_hash::ContentHash, services::coordinator::UploadCoordinator};
use std::path::PathBuf;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadCoordinator,
    /// Directory probed by the readiness check.
    pub storage_dir: PathBuf,
}

/// Parse a content hash taken from the request path.
pub(crate) fn parse_hash(raw: &str) -> Result<ContentHash, AppError> {
    raw.parse()
        .map_err(|e| AppError::bad_request(format!("invalid content hash `{raw}`: {e}")))
}
