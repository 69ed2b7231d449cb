//! Storage backends behind one capability set: init, persist a chunk, list
//! persisted chunks, finalize, abort. The variant is chosen once at startup;
//! each session records the kind it was started on.

pub mod local;
pub mod remote;

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        content_hash::ContentHash,
        file::{BackendKind, FileRecord},
        session::UploadSession,
        upload::DownloadTarget,
    },
};
use bytes::Bytes;
use local::LocalChunkStore;
use remote::RemoteMultipartStore;
use std::{collections::BTreeMap, path::PathBuf};
use tracing::warn;

/// Result of a successful finalize.
#[derive(Debug, Clone)]
pub struct Finalized {
    /// Local object path or remote object key.
    pub location: String,
    pub size_bytes: u64,
    /// Whether the service recomputed the content hash over the stored bytes.
    pub verified: bool,
}

#[derive(Clone)]
pub enum Backend {
    Local(LocalChunkStore),
    Remote(RemoteMultipartStore),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Local(_) => BackendKind::Local,
            Backend::Remote(_) => BackendKind::Remote,
        }
    }

    /// Prepare storage for a new session. Returns the remote upload id, if any.
    pub async fn init(&self, hash: &ContentHash) -> UploadResult<Option<String>> {
        match self {
            Backend::Local(store) => store.init(hash).await.map(|_| None),
            Backend::Remote(store) => store.init(hash).await.map(Some),
        }
    }

    pub async fn persist_chunk(
        &self,
        session: &UploadSession,
        index: u32,
        data: Bytes,
    ) -> UploadResult<()> {
        match self {
            Backend::Local(store) => store.persist_chunk(session, index, data).await,
            Backend::Remote(store) => store.persist_chunk(session, index, data).await,
        }
    }

    /// Indices the backend actually holds, with byte lengths.
    pub async fn list_persisted(&self, session: &UploadSession) -> UploadResult<BTreeMap<u32, u64>> {
        match self {
            Backend::Local(store) => store.list_persisted(&session.content_hash).await,
            Backend::Remote(store) => store.list_persisted(session).await,
        }
    }

    pub async fn finalize(&self, session: &UploadSession, expected: u32) -> UploadResult<Finalized> {
        match self {
            Backend::Local(store) => store.finalize(session, expected).await,
            Backend::Remote(store) => store.finalize(session, expected).await,
        }
    }

    /// Discard staged chunks once their content has been committed.
    pub async fn release(&self, session: &UploadSession) -> UploadResult<()> {
        match self {
            Backend::Local(store) => store.remove_staging(&session.content_hash).await,
            // The provider discards parts when it completes the upload.
            Backend::Remote(_) => Ok(()),
        }
    }

    pub async fn abort(&self, session: &UploadSession) -> UploadResult<()> {
        match self {
            Backend::Local(store) => store.remove_staging(&session.content_hash).await,
            Backend::Remote(store) => store.abort(session).await,
        }
    }

    /// Abort a remote upload id that lost the race to become the session's id.
    pub async fn release_orphan(&self, hash: &ContentHash, upload_id: &str) -> UploadResult<()> {
        match self {
            Backend::Local(_) => Ok(()),
            Backend::Remote(store) => store.abort_upload_id(hash, upload_id).await,
        }
    }

    /// Remove the stored bytes of an unreferenced file.
    pub async fn delete_stored(&self, record: &FileRecord) -> UploadResult<()> {
        match (self, record.backend) {
            (Backend::Local(store), BackendKind::Local) => store.delete_object(&record.location).await,
            (Backend::Remote(store), BackendKind::Remote) => {
                store.delete_object(&record.location).await
            }
            (backend, stored_on) => {
                warn!(
                    content_hash = %record.content_hash,
                    "cannot delete {} object from the {} backend; leaving {} in place",
                    stored_on,
                    backend.kind(),
                    record.location
                );
                Ok(())
            }
        }
    }

    pub async fn download_target(
        &self,
        record: &FileRecord,
        filename: &str,
    ) -> UploadResult<DownloadTarget> {
        match (self, record.backend) {
            (_, BackendKind::Local) => Ok(DownloadTarget::LocalFile {
                path: PathBuf::from(&record.location),
                filename: filename.to_string(),
                size_bytes: record.size_bytes,
            }),
            (Backend::Remote(store), BackendKind::Remote) => store
                .presign_download_url(&record.location, filename)
                .await
                .map(DownloadTarget::PresignedUrl),
            (Backend::Local(_), BackendKind::Remote) => Err(UploadError::NotFound(format!(
                "remote object for {} (no remote store configured)",
                record.content_hash
            ))),
        }
    }
}
