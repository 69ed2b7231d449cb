//! Hash-based deduplication ("instant upload").

use crate::{
    errors::UploadResult,
    models::{content_hash::ContentHash, upload::Decision},
    services::metadata_store::{LinkOutcome, MetadataStore},
};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct DedupEngine {
    metadata: MetadataStore,
}

impl DedupEngine {
    pub fn new(metadata: MetadataStore) -> Self {
        Self { metadata }
    }

    /// Decide whether `user_id` needs to transfer content `hash` as `filename`.
    ///
    /// When the content is stored but this (user, hash, filename) triple is
    /// new, the ownership link and the extra copy are recorded here, so the
    /// caller skips the byte transfer entirely.
    pub async fn resolve(
        &self,
        hash: &ContentHash,
        user_id: &str,
        filename: &str,
        claimed_size: Option<u64>,
    ) -> UploadResult<Decision> {
        let Some(record) = self.metadata.get_file_record(hash).await? else {
            debug!(content_hash = %hash, "no stored copy; upload required");
            return Ok(Decision::NoDuplicate);
        };

        if self.metadata.ownership_exists(user_id, hash, filename).await? {
            debug!(content_hash = %hash, user_id, filename, "user already owns this file");
            return Ok(Decision::DuplicateSameOwner);
        }

        if let Some(size) = claimed_size {
            if i64::try_from(size).ok() != Some(record.size_bytes) {
                warn!(
                    content_hash = %hash,
                    claimed = size,
                    stored = record.size_bytes,
                    "claimed size differs from stored content; using stored size"
                );
            }
        }

        let decision = match self.metadata.link_existing(user_id, hash, filename).await? {
            LinkOutcome::Linked(record) => {
                info!(
                    content_hash = %hash,
                    user_id,
                    copies = record.copies,
                    "linked new owner to stored content"
                );
                Decision::DuplicateNewOwner
            }
            LinkOutcome::AlreadyOwned(_) => Decision::DuplicateSameOwner,
            LinkOutcome::Missing => Decision::NoDuplicate,
        };
        Ok(decision)
    }
}
