//! Committed file metadata and per-user ownership links.

use super::content_hash::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

/// Which storage backend holds (or is receiving) a file's bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Chunks staged in a local directory and assembled on disk.
    Local,
    /// Parts uploaded to a remote multipart-upload object store.
    Remote,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown backend kind `{0}` (expected `local` or `remote`)")]
pub struct UnknownBackendKind(pub String);

impl FromStr for BackendKind {
    type Err = UnknownBackendKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "remote" | "s3" | "aws" => Ok(BackendKind::Remote),
            _ => Err(UnknownBackendKind(s.to_string())),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = UnknownBackendKind;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A physically stored blob, shared by every owner of the same content.
///
/// Only created once the content hash has been established for the stored
/// bytes. `copies` always equals the number of live [`OwnershipRecord`]s.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    /// Digest of the full content; primary key.
    #[sqlx(try_from = "String")]
    pub content_hash: ContentHash,

    /// Canonical size in bytes.
    pub size_bytes: i64,

    /// Local object path or remote object key, depending on `backend`.
    pub location: String,

    #[sqlx(try_from = "String")]
    pub backend: BackendKind,

    /// Whether the service itself recomputed the digest over the stored bytes.
    /// Remote uploads are assembled by the provider and recorded under the
    /// client's claimed hash, so they carry `false`.
    pub verified: bool,

    /// Reference count: number of ownership records pointing here.
    pub copies: i64,

    pub created_at: DateTime<Utc>,
}

/// A user's named reference to a [`FileRecord`].
///
/// `(user_id, content_hash, filename)` is unique.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct OwnershipRecord {
    pub user_id: String,

    #[sqlx(try_from = "String")]
    pub content_hash: ContentHash,

    pub filename: String,

    pub size_bytes: i64,

    pub uploaded_at: DateTime<Utc>,
}
