//! Remote multipart store.
//!
//! Chunk `i` is uploaded as part `i + 1` of a multipart upload keyed by the
//! content hash. The remote part listing is the source of truth for resume.

use super::Finalized;
use crate::{
    errors::{UploadError, UploadResult, bounded},
    models::{content_hash::ContentHash, session::UploadSession},
    services::object_store_client::{ObjectStoreClient, RemotePart},
};
use bytes::Bytes;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Clone)]
pub struct RemoteMultipartStore {
    client: Arc<dyn ObjectStoreClient>,
    prefix: String,
    timeout: Duration,
}

impl RemoteMultipartStore {
    pub fn new(client: Arc<dyn ObjectStoreClient>, prefix: &str, timeout: Duration) -> Self {
        Self {
            client,
            prefix: prefix.trim_matches('/').to_string(),
            timeout,
        }
    }

    pub fn object_key(&self, hash: &ContentHash) -> String {
        if self.prefix.is_empty() {
            hash.to_string()
        } else {
            format!("{}/{}", self.prefix, hash)
        }
    }

    fn upload_id<'s>(&self, session: &'s UploadSession) -> UploadResult<&'s str> {
        session.remote_upload_id.as_deref().ok_or_else(|| {
            UploadError::SessionConflict(format!(
                "remote session for {} carries no upload id",
                session.content_hash
            ))
        })
    }

    /// Start a multipart upload and return its id.
    pub async fn init(&self, hash: &ContentHash) -> UploadResult<String> {
        let key = self.object_key(hash);
        let upload_id = bounded(
            self.timeout,
            "initiate multipart upload",
            self.client.initiate_multipart_upload(&key),
        )
        .await?;
        info!(content_hash = %hash, upload_id = %upload_id, "multipart upload initiated");
        Ok(upload_id)
    }

    pub async fn persist_chunk(
        &self,
        session: &UploadSession,
        index: u32,
        data: Bytes,
    ) -> UploadResult<()> {
        let key = self.object_key(&session.content_hash);
        let upload_id = self.upload_id(session)?;
        bounded(
            self.timeout,
            "upload part",
            self.client.upload_part(&key, upload_id, index + 1, data),
        )
        .await
        .map(|_etag| ())
    }

    async fn parts(&self, session: &UploadSession) -> UploadResult<Vec<RemotePart>> {
        let key = self.object_key(&session.content_hash);
        let upload_id = self.upload_id(session)?;
        bounded(
            self.timeout,
            "list parts",
            self.client.list_parts(&key, upload_id),
        )
        .await
    }

    /// Chunk indices (0-based) the remote store holds, with their sizes.
    pub async fn list_persisted(&self, session: &UploadSession) -> UploadResult<BTreeMap<u32, u64>> {
        Ok(self
            .parts(session)
            .await?
            .into_iter()
            .filter(|part| part.part_number >= 1)
            .map(|part| (part.part_number - 1, part.size))
            .collect())
    }

    /// Complete the multipart upload from parts `1..=expected`.
    ///
    /// Assembly happens on the provider; the bytes are not re-hashed here.
    pub async fn finalize(&self, session: &UploadSession, expected: u32) -> UploadResult<Finalized> {
        let key = self.object_key(&session.content_hash);
        let upload_id = self.upload_id(session)?;
        let parts = self.parts(session).await?;

        let by_number: BTreeMap<u32, &RemotePart> =
            parts.iter().map(|part| (part.part_number, part)).collect();
        let missing: Vec<u32> = (0..expected)
            .filter(|index| !by_number.contains_key(&(index + 1)))
            .collect();
        if !missing.is_empty() {
            return Err(UploadError::MissingChunks { expected, missing });
        }
        if let Some((extra, _)) = by_number.range(expected + 1..).next() {
            return Err(UploadError::SessionConflict(format!(
                "part {extra} was uploaded beyond the declared count {expected}"
            )));
        }

        let ordered: Vec<RemotePart> = by_number.values().map(|part| (*part).clone()).collect();
        let size_bytes = ordered.iter().map(|part| part.size).sum();
        bounded(
            self.timeout,
            "complete multipart upload",
            self.client
                .complete_multipart_upload(&key, upload_id, &ordered),
        )
        .await?;

        warn!(
            content_hash = %session.content_hash,
            "multipart upload completed by provider; content recorded under the claimed hash without re-verification"
        );
        Ok(Finalized {
            location: key,
            size_bytes,
            verified: false,
        })
    }

    pub async fn abort(&self, session: &UploadSession) -> UploadResult<()> {
        let upload_id = self.upload_id(session)?;
        self.abort_upload_id(&session.content_hash, upload_id).await
    }

    /// Abort a multipart upload by id, e.g. one that lost a session race.
    pub async fn abort_upload_id(&self, hash: &ContentHash, upload_id: &str) -> UploadResult<()> {
        let key = self.object_key(hash);
        bounded(
            self.timeout,
            "abort multipart upload",
            self.client.abort_multipart_upload(&key, upload_id),
        )
        .await
    }

    pub async fn delete_object(&self, key: &str) -> UploadResult<()> {
        bounded(self.timeout, "delete object", self.client.delete_object(key)).await
    }

    pub async fn presign_download_url(&self, key: &str, filename: &str) -> UploadResult<String> {
        bounded(
            self.timeout,
            "presign download",
            self.client.presign_download_url(key, filename),
        )
        .await
    }
}
