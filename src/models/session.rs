//! In-progress upload sessions.

use super::{content_hash::ContentHash, file::BackendKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

/// Lifecycle of one upload of a content hash.
///
/// Only `AwaitingChunks` and `Finalizing` are ever persisted in a session;
/// the other phases describe results reported to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    Probing,
    AwaitingChunks,
    Finalizing,
    Committed,
    Aborted,
}

/// Durable session state shared by every uploader of the same content hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub content_hash: ContentHash,

    /// Backend the session was started on; fixed for the session's lifetime.
    pub backend: BackendKind,

    /// Multipart upload id, present only for the remote backend.
    pub remote_upload_id: Option<String>,

    pub phase: UploadPhase,

    pub created_at: DateTime<Utc>,

    /// When the current finalize attempt started. Set only while `Finalizing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizing_since: Option<DateTime<Utc>>,

    /// Persisted chunk index -> byte length. Not part of the stored session
    /// record; loaded from the session's chunk set.
    #[serde(skip)]
    pub chunks: BTreeMap<u32, u64>,
}

impl UploadSession {
    pub fn new(
        content_hash: ContentHash,
        backend: BackendKind,
        remote_upload_id: Option<String>,
    ) -> Self {
        Self {
            content_hash,
            backend,
            remote_upload_id,
            phase: UploadPhase::AwaitingChunks,
            created_at: Utc::now(),
            finalizing_since: None,
            chunks: BTreeMap::new(),
        }
    }

    /// Total bytes across the recorded chunks.
    pub fn received_bytes(&self) -> u64 {
        self.chunks.values().sum()
    }

    /// Indices in `0..expected` that have not been recorded.
    pub fn missing_indices(&self, expected: u32) -> Vec<u32> {
        (0..expected)
            .filter(|index| !self.chunks.contains_key(index))
            .collect()
    }

    /// A finalize whose owner has held it for `lease` or longer is presumed
    /// dead. A finalizing record without a stamp counts as expired.
    pub fn finalize_expired(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        if self.phase != UploadPhase::Finalizing {
            return false;
        }
        match self.finalizing_since {
            Some(since) => (now - since).to_std().is_ok_and(|held| held >= lease),
            None => true,
        }
    }

    /// Recorded indices at or beyond `expected`.
    pub fn surplus_indices(&self, expected: u32) -> Vec<u32> {
        self.chunks.range(expected..).map(|(index, _)| *index).collect()
    }
}
