//! Results returned by the upload coordinator to the application layer.

use super::{
    content_hash::ContentHash,
    file::{BackendKind, FileRecord},
    session::UploadPhase,
};
use serde::Serialize;

/// Outcome of the hash-based duplicate check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Content is not stored yet; the client must transfer it.
    NoDuplicate,
    /// This user already owns the content under this filename.
    DuplicateSameOwner,
    /// Content is stored; a new ownership link was created without transfer.
    DuplicateNewOwner,
}

impl Decision {
    pub fn should_upload(&self) -> bool {
        matches!(self, Decision::NoDuplicate)
    }
}

#[derive(Debug, Serialize)]
pub struct InstantCheck {
    pub content_hash: ContentHash,
    pub decision: Decision,
    pub should_upload: bool,
}

/// What the client needs to resume an upload.
#[derive(Debug, Serialize)]
pub struct ResumeInfo {
    pub content_hash: ContentHash,
    pub phase: UploadPhase,
    /// Backend receiving the chunks, absent when the content is already stored.
    pub backend: Option<BackendKind>,
    /// Chunk indices already persisted, ascending.
    pub uploaded: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct ChunkAck {
    pub content_hash: ContentHash,
    pub index: u32,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct FinalizeResult {
    pub phase: UploadPhase,
    pub file: FileRecord,
    /// True when another uploader committed the content first and this call
    /// only linked a new owner to it.
    pub linked_existing: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteResult {
    pub content_hash: ContentHash,
    pub filename: String,
    /// Whether the last reference went away and the bytes were removed.
    pub physically_deleted: bool,
}

/// Where a client can fetch stored content from.
#[derive(Debug)]
pub enum DownloadTarget {
    LocalFile {
        path: std::path::PathBuf,
        filename: String,
        size_bytes: i64,
    },
    PresignedUrl(String),
}

/// Outcome of a single-request upload.
#[derive(Debug, Serialize)]
pub struct StoredFile {
    pub decision: Decision,
    pub file: FileRecord,
}
