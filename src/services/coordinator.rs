//! UploadCoordinator: resumable chunked uploads with content deduplication.
//!
//! Per content hash the coordinator drives
//! `Probing -> AwaitingChunks -> Finalizing -> Committed`, with `Aborted`
//! reachable from `AwaitingChunks` and on integrity failure.
//!
//! Work on one hash is fenced in-process: chunks hold a shared guard while
//! they persist, while finalize and delete hold the exclusive guard until
//! their outcome is durable. A second finalizer therefore waits and then links
//! to the committed content, and chunks arriving after a finalize began are
//! refused.
//!
//! Across processes the stored `Finalizing` phase is the fence. It carries a
//! start time, and a finalize older than the lease is presumed dead: the next
//! caller returns its session to `AwaitingChunks`.

use crate::{
    errors::{UploadError, UploadResult, bounded},
    models::{
        content_hash::ContentHash,
        file::{FileRecord, OwnershipRecord},
        session::{UploadPhase, UploadSession},
        upload::{
            ChunkAck, Decision, DeleteResult, DownloadTarget, FinalizeResult, InstantCheck,
            ResumeInfo, StoredFile,
        },
    },
    services::{
        backend::Backend,
        dedup::DedupEngine,
        metadata_store::{LinkOutcome, MetadataStore, NewUpload},
        session_store::SessionStore,
    },
};
use bytes::Bytes;
use chrono::Utc;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};

const MAX_FILENAME_LEN: usize = 255;
const MAX_LIST_LIMIT: u32 = 1000;

/// Limits applied to incoming chunks and to finalize.
#[derive(Clone, Copy, Debug)]
pub struct UploadLimits {
    pub max_chunk_bytes: u64,
    pub max_chunk_count: u32,

    /// How long a finalize may hold its session before another caller may
    /// reopen it. Assembly is cut off at this bound.
    pub finalize_lease: Duration,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 64 * 1024 * 1024,
            max_chunk_count: 1000,
            finalize_lease: Duration::from_secs(30),
        }
    }
}

type Fences = Arc<Mutex<HashMap<ContentHash, Arc<RwLock<()>>>>>;

#[derive(Clone)]
pub struct UploadCoordinator {
    pub sessions: SessionStore,
    pub backend: Backend,
    pub metadata: MetadataStore,
    dedup: DedupEngine,
    limits: UploadLimits,
    fences: Fences,
}

impl UploadCoordinator {
    pub fn new(
        sessions: SessionStore,
        backend: Backend,
        metadata: MetadataStore,
        limits: UploadLimits,
    ) -> Self {
        Self {
            sessions,
            backend,
            dedup: DedupEngine::new(metadata.clone()),
            metadata,
            limits,
            fences: Arc::default(),
        }
    }

    fn fence(&self, hash: &ContentHash) -> Arc<RwLock<()>> {
        let mut fences = self.fences.lock().unwrap_or_else(|poisoned| {
            error!("fence map poisoned; continuing with inner state");
            poisoned.into_inner()
        });
        fences.entry(*hash).or_default().clone()
    }

    /// Forget the fence for `hash` once nobody else holds it.
    fn prune_fence(&self, hash: &ContentHash) {
        let mut fences = self
            .fences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if fences
            .get(hash)
            .is_some_and(|fence| Arc::strong_count(fence) == 1)
        {
            fences.remove(hash);
        }
    }

    /// Waiting on a fence covers at most one finalize plus its commit.
    fn fence_wait(&self) -> Duration {
        self.limits.finalize_lease * 2
    }

    async fn shared(&self, hash: &ContentHash) -> UploadResult<OwnedRwLockReadGuard<()>> {
        let fence = self.fence(hash);
        bounded(self.fence_wait(), "wait for upload fence", async {
            Ok(fence.read_owned().await)
        })
        .await
    }

    async fn exclusive(&self, hash: &ContentHash) -> UploadResult<OwnedRwLockWriteGuard<()>> {
        let fence = self.fence(hash);
        bounded(self.fence_wait(), "wait for upload fence", async {
            Ok(fence.write_owned().await)
        })
        .await
    }

    fn ensure_backend(&self, session: &UploadSession) -> UploadResult<()> {
        if session.backend != self.backend.kind() {
            return Err(UploadError::SessionConflict(format!(
                "upload of {} was started on the {} backend, this server uses {}",
                session.content_hash,
                session.backend,
                self.backend.kind()
            )));
        }
        Ok(())
    }

    /// The stored session for `hash`, with a finalize that outlived its lease
    /// returned to `AwaitingChunks` first. Call with the hash's fence held.
    async fn load_session(&self, hash: &ContentHash) -> UploadResult<Option<UploadSession>> {
        let Some(session) = self.sessions.probe(hash).await? else {
            return Ok(None);
        };
        if !session.finalize_expired(self.limits.finalize_lease, Utc::now()) {
            return Ok(Some(session));
        }

        warn!(
            content_hash = %hash,
            since = ?session.finalizing_since,
            "finalize lease expired; reopening upload session"
        );
        match self
            .sessions
            .transition(&session, UploadPhase::Finalizing, UploadPhase::AwaitingChunks)
            .await?
        {
            Some(reopened) => Ok(Some(reopened)),
            // Someone else moved it first; take their version.
            None => self.sessions.probe(hash).await,
        }
    }

    /// Hash-based duplicate check, run before any transfer.
    ///
    /// A stored hash makes any lingering session for it obsolete, so the
    /// session is torn down here.
    pub async fn instant_check(
        &self,
        hash: &ContentHash,
        filename: &str,
        user_id: &str,
        claimed_size: Option<u64>,
    ) -> UploadResult<InstantCheck> {
        ensure_filename_safe(filename)?;
        let decision = self
            .dedup
            .resolve(hash, user_id, filename, claimed_size)
            .await?;
        if decision != Decision::NoDuplicate {
            self.discard_stale_session(hash).await?;
        }
        Ok(InstantCheck {
            content_hash: *hash,
            decision,
            should_upload: decision.should_upload(),
        })
    }

    /// Report which chunks are already persisted, starting a session if needed.
    pub async fn probe_upload(&self, hash: &ContentHash, user_id: &str) -> UploadResult<ResumeInfo> {
        if self.metadata.get_file_record(hash).await?.is_some() {
            self.discard_stale_session(hash).await?;
            return Ok(ResumeInfo {
                content_hash: *hash,
                phase: UploadPhase::Committed,
                backend: None,
                uploaded: Vec::new(),
            });
        }

        let result = async {
            let _shared = self.shared(hash).await?;
            self.probe_session(hash, user_id).await
        }
        .await;
        self.prune_fence(hash);
        result
    }

    async fn probe_session(&self, hash: &ContentHash, user_id: &str) -> UploadResult<ResumeInfo> {
        let mut session = match self.load_session(hash).await? {
            Some(session) => session,
            None => self.begin_session(hash, user_id).await?,
        };
        self.ensure_backend(&session)?;

        if session.phase == UploadPhase::AwaitingChunks {
            // Session first, listing second: a chunk recorded before our
            // session read is always visible in the listing.
            let persisted = self.backend.list_persisted(&session).await?;
            let indices: BTreeSet<u32> = persisted.keys().copied().collect();
            self.sessions
                .reconcile(&mut session, &indices, |index| {
                    persisted.get(&index).copied().unwrap_or_default()
                })
                .await?;
        }

        Ok(ResumeInfo {
            content_hash: *hash,
            phase: session.phase,
            backend: Some(session.backend),
            uploaded: session.chunks.keys().copied().collect(),
        })
    }

    async fn begin_session(&self, hash: &ContentHash, user_id: &str) -> UploadResult<UploadSession> {
        let upload_id = self.backend.init(hash).await?;
        let (session, created) = self
            .sessions
            .begin_if_absent(hash, self.backend.kind(), upload_id.clone())
            .await?;

        if created {
            info!(content_hash = %hash, user_id, "new upload session");
        } else if let Some(orphan) = upload_id {
            if session.remote_upload_id.as_deref() != Some(orphan.as_str()) {
                warn!(
                    content_hash = %hash,
                    upload_id = %orphan,
                    "lost session race; releasing orphaned multipart upload"
                );
                if let Err(err) = self.backend.release_orphan(hash, &orphan).await {
                    warn!(content_hash = %hash, upload_id = %orphan, "could not release orphaned upload: {}", err);
                }
            }
        }
        Ok(session)
    }

    /// Persist one chunk of an active session.
    pub async fn accept_chunk(
        &self,
        hash: &ContentHash,
        index: u32,
        data: Bytes,
        user_id: &str,
    ) -> UploadResult<ChunkAck> {
        if index >= self.limits.max_chunk_count {
            return Err(UploadError::InvalidRequest(format!(
                "chunk index {index} exceeds the limit of {} chunks",
                self.limits.max_chunk_count
            )));
        }
        let size = data.len() as u64;
        if size == 0 {
            return Err(UploadError::InvalidRequest("empty chunk".into()));
        }
        if size > self.limits.max_chunk_bytes {
            return Err(UploadError::InvalidRequest(format!(
                "chunk of {size} bytes exceeds the {} byte limit",
                self.limits.max_chunk_bytes
            )));
        }

        let result = async {
            let _shared = self.shared(hash).await?;
            self.persist(hash, index, data).await
        }
        .await;
        self.prune_fence(hash);
        result?;

        debug!(content_hash = %hash, index, size, user_id, "chunk persisted");
        Ok(ChunkAck {
            content_hash: *hash,
            index,
            size,
        })
    }

    async fn persist(&self, hash: &ContentHash, index: u32, data: Bytes) -> UploadResult<()> {
        let session = self.load_session(hash).await?.ok_or_else(|| {
            UploadError::SessionConflict(format!("no active upload session for {hash}; probe first"))
        })?;
        if session.phase == UploadPhase::Finalizing {
            return Err(UploadError::SessionConflict(format!(
                "upload of {hash} is already finalizing"
            )));
        }
        self.ensure_backend(&session)?;

        let size = data.len() as u64;
        self.backend.persist_chunk(&session, index, data).await?;
        self.sessions.record_chunk(hash, index, size).await
    }

    /// Verify, assemble and commit an upload of `expected_count` chunks.
    ///
    /// A caller that finds the upload already being finalized here waits for
    /// it and is then linked to the committed content.
    pub async fn complete_upload(
        &self,
        hash: &ContentHash,
        expected_count: u32,
        filename: &str,
        size: u64,
        user_id: &str,
    ) -> UploadResult<FinalizeResult> {
        ensure_filename_safe(filename)?;
        if expected_count == 0 || expected_count > self.limits.max_chunk_count {
            return Err(UploadError::InvalidRequest(format!(
                "chunk count must be between 1 and {}",
                self.limits.max_chunk_count
            )));
        }

        let result = async {
            let _exclusive = self.exclusive(hash).await?;
            match self.begin_finalize(hash, expected_count, size).await? {
                Some(session) => {
                    self.finalize_session(&session, expected_count, filename, user_id)
                        .await
                }
                None => self.complete_without_session(hash, filename, user_id).await,
            }
        }
        .await;
        self.prune_fence(hash);
        result
    }

    /// Check the chunk set and move the session to `Finalizing`.
    /// `None` means there is no session to finalize.
    async fn begin_finalize(
        &self,
        hash: &ContentHash,
        expected: u32,
        size: u64,
    ) -> UploadResult<Option<UploadSession>> {
        let Some(session) = self.load_session(hash).await? else {
            return Ok(None);
        };
        if session.phase == UploadPhase::Finalizing {
            // Held by another process whose lease is still running.
            return Err(UploadError::SessionConflict(format!(
                "upload of {hash} is already finalizing"
            )));
        }
        self.ensure_backend(&session)?;

        let missing = session.missing_indices(expected);
        if !missing.is_empty() {
            return Err(UploadError::MissingChunks { expected, missing });
        }
        if let Some(extra) = session.surplus_indices(expected).first() {
            return Err(UploadError::SessionConflict(format!(
                "chunk {extra} was received beyond the declared count {expected}"
            )));
        }
        let received = session.received_bytes();
        if received != size {
            return Err(UploadError::SizeMismatch {
                declared: size,
                received,
            });
        }

        let finalizing = self
            .sessions
            .transition(&session, UploadPhase::AwaitingChunks, UploadPhase::Finalizing)
            .await?
            .ok_or_else(|| {
                UploadError::SessionConflict(format!(
                    "upload of {hash} changed state during finalize; probe again"
                ))
            })?;
        Ok(Some(finalizing))
    }

    async fn finalize_session(
        &self,
        session: &UploadSession,
        expected: u32,
        filename: &str,
        user_id: &str,
    ) -> UploadResult<FinalizeResult> {
        let hash = session.content_hash;

        let assembled = bounded(
            self.limits.finalize_lease,
            "finalize",
            self.backend.finalize(session, expected),
        )
        .await;
        let finalized = match assembled {
            Ok(finalized) => finalized,
            Err(err @ UploadError::IntegrityMismatch { .. }) => {
                error!(content_hash = %hash, user_id, "aborting upload: {}", err);
                self.teardown(session).await;
                return Err(err);
            }
            Err(err) => {
                warn!(content_hash = %hash, "finalize failed, upload resumable: {}", err);
                self.reopen(session).await;
                return Err(err);
            }
        };

        let commit = self
            .metadata
            .commit_upload(&NewUpload {
                user_id,
                content_hash: hash,
                filename,
                size_bytes: finalized.size_bytes,
                location: &finalized.location,
                backend: self.backend.kind(),
                verified: finalized.verified,
            })
            .await;
        let (file, inserted) = match commit {
            Ok(committed) => committed,
            Err(err) => {
                warn!(content_hash = %hash, "metadata commit failed after finalize: {}", err);
                self.reopen(session).await;
                return Err(err);
            }
        };

        if let Err(err) = self.backend.release(session).await {
            warn!(content_hash = %hash, "could not release staged chunks: {}", err);
        }
        if let Err(err) = self.sessions.drop(&hash).await {
            // A later probe or instant check tears the session down.
            warn!(content_hash = %hash, "could not drop committed session: {}", err);
        }

        info!(
            content_hash = %hash,
            user_id,
            filename,
            size_bytes = file.size_bytes,
            copies = file.copies,
            verified = file.verified,
            "upload committed"
        );
        Ok(FinalizeResult {
            phase: UploadPhase::Committed,
            linked_existing: !inserted || file.copies > 1,
            file,
        })
    }

    /// Finalize with no session: succeeds only if another uploader already
    /// committed the same content, in which case this user is linked to it.
    async fn complete_without_session(
        &self,
        hash: &ContentHash,
        filename: &str,
        user_id: &str,
    ) -> UploadResult<FinalizeResult> {
        match self.metadata.link_existing(user_id, hash, filename).await? {
            LinkOutcome::Linked(file) | LinkOutcome::AlreadyOwned(file) => {
                debug!(content_hash = %hash, user_id, filename, "finalize linked to committed content");
                Ok(FinalizeResult {
                    phase: UploadPhase::Committed,
                    file,
                    linked_existing: true,
                })
            }
            LinkOutcome::Missing => Err(UploadError::SessionConflict(format!(
                "no active upload session for {hash}"
            ))),
        }
    }

    /// Return a finalizing session to `AwaitingChunks` so the client can resume.
    async fn reopen(&self, session: &UploadSession) {
        match self
            .sessions
            .transition(session, UploadPhase::Finalizing, UploadPhase::AwaitingChunks)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => warn!(content_hash = %session.content_hash, "session changed while finalizing"),
            Err(err) => warn!(content_hash = %session.content_hash, "could not reopen session: {}", err),
        }
    }

    /// Best-effort removal of backend and session state for an aborted upload.
    async fn teardown(&self, session: &UploadSession) {
        if let Err(err) = self.backend.abort(session).await {
            warn!(content_hash = %session.content_hash, "backend abort failed: {}", err);
        }
        if let Err(err) = self.sessions.drop(&session.content_hash).await {
            warn!(content_hash = %session.content_hash, "session drop failed: {}", err);
        }
    }

    /// Cancel an upload that has not started finalizing.
    pub async fn abort_upload(&self, hash: &ContentHash, user_id: &str) -> UploadResult<UploadPhase> {
        let result = async {
            let _exclusive = self.exclusive(hash).await?;
            self.abort_session(hash).await
        }
        .await;
        self.prune_fence(hash);
        result?;

        info!(content_hash = %hash, user_id, "upload aborted");
        Ok(UploadPhase::Aborted)
    }

    async fn abort_session(&self, hash: &ContentHash) -> UploadResult<()> {
        let session = self.load_session(hash).await?.ok_or_else(|| {
            UploadError::SessionConflict(format!("no active upload session for {hash}"))
        })?;
        if session.phase == UploadPhase::Finalizing {
            return Err(UploadError::SessionConflict(format!(
                "upload of {hash} is finalizing and can no longer be aborted"
            )));
        }
        self.ensure_backend(&session)?;
        self.backend.abort(&session).await?;
        self.sessions.drop(hash).await
    }

    /// Remove a session for content that is already stored.
    async fn discard_stale_session(&self, hash: &ContentHash) -> UploadResult<()> {
        let result = async {
            let _exclusive = self.exclusive(hash).await?;
            match self.load_session(hash).await? {
                Some(session) if session.phase == UploadPhase::AwaitingChunks => {
                    info!(content_hash = %hash, "content already stored; discarding upload session");
                    if session.backend == self.backend.kind() {
                        self.backend.abort(&session).await?;
                    }
                    self.sessions.drop(hash).await
                }
                _ => Ok(()),
            }
        }
        .await;
        self.prune_fence(hash);
        result
    }

    /// Store a small file in one request.
    pub async fn upload_whole(
        &self,
        hash: &ContentHash,
        filename: &str,
        data: Bytes,
        user_id: &str,
    ) -> UploadResult<StoredFile> {
        let size = data.len() as u64;
        let check = self
            .instant_check(hash, filename, user_id, Some(size))
            .await?;
        if !check.should_upload {
            let file = self.get_file(hash).await?;
            return Ok(StoredFile {
                decision: check.decision,
                file,
            });
        }

        let resume = self.probe_upload(hash, user_id).await?;
        if resume.uploaded.iter().any(|index| *index != 0) {
            return Err(UploadError::SessionConflict(format!(
                "a chunked upload of {hash} is in progress"
            )));
        }
        self.accept_chunk(hash, 0, data, user_id).await?;
        let result = self
            .complete_upload(hash, 1, filename, size, user_id)
            .await?;
        Ok(StoredFile {
            decision: Decision::NoDuplicate,
            file: result.file,
        })
    }

    /// Drop `user_id`'s reference; the bytes go when the last reference does.
    ///
    /// Runs under the exclusive fence so a new upload of the same content
    /// cannot commit between the record removal and the byte removal.
    pub async fn delete_ownership(
        &self,
        hash: &ContentHash,
        filename: &str,
        user_id: &str,
    ) -> UploadResult<DeleteResult> {
        let result = async {
            let _exclusive = self.exclusive(hash).await?;
            self.release_ownership(hash, filename, user_id).await
        }
        .await;
        self.prune_fence(hash);
        result
    }

    async fn release_ownership(
        &self,
        hash: &ContentHash,
        filename: &str,
        user_id: &str,
    ) -> UploadResult<DeleteResult> {
        let removed = self
            .metadata
            .remove_ownership(user_id, hash, filename)
            .await?;
        if !removed.removed {
            return Err(UploadError::NotFound(format!("file `{filename}` ({hash})")));
        }

        let mut physically_deleted = false;
        if let Some(record) = removed.unreferenced {
            match self.backend.delete_stored(&record).await {
                Ok(()) => {
                    physically_deleted = true;
                    info!(content_hash = %hash, "last reference removed; stored bytes deleted");
                }
                Err(err) => error!(
                    content_hash = %hash,
                    location = %record.location,
                    "record removed but stored bytes could not be deleted: {}",
                    err
                ),
            }
        }

        Ok(DeleteResult {
            content_hash: *hash,
            filename: filename.to_string(),
            physically_deleted,
        })
    }

    pub async fn get_file(&self, hash: &ContentHash) -> UploadResult<FileRecord> {
        self.metadata
            .get_file_record(hash)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("file {hash}")))
    }

    pub async fn list_files(&self, user_id: &str, limit: u32) -> UploadResult<Vec<OwnershipRecord>> {
        self.metadata
            .list_ownerships(user_id, limit.clamp(1, MAX_LIST_LIMIT))
            .await
    }

    pub async fn rename_file(
        &self,
        hash: &ContentHash,
        filename: &str,
        new_filename: &str,
        user_id: &str,
    ) -> UploadResult<OwnershipRecord> {
        ensure_filename_safe(new_filename)?;
        self.metadata
            .rename_ownership(user_id, hash, filename, new_filename)
            .await
    }

    /// Where `user_id` can download their file from.
    pub async fn download_target(
        &self,
        hash: &ContentHash,
        filename: &str,
        user_id: &str,
    ) -> UploadResult<DownloadTarget> {
        if !self
            .metadata
            .ownership_exists(user_id, hash, filename)
            .await?
        {
            return Err(UploadError::NotFound(format!("file `{filename}` ({hash})")));
        }
        let record = self.get_file(hash).await?;
        self.backend.download_target(&record, filename).await
    }
}

/// Reject filenames that are empty, oversized, or carry path or control characters.
fn ensure_filename_safe(name: &str) -> UploadResult<()> {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(UploadError::InvalidRequest(format!(
            "filename must be 1 to {MAX_FILENAME_LEN} bytes"
        )));
    }
    if name
        .chars()
        .any(|c| c.is_control() || c == '/' || c == '\\' || c == '\0')
    {
        return Err(UploadError::InvalidRequest(
            "filename contains a forbidden character".into(),
        ));
    }
    Ok(())
}
