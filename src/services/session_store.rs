//! Durable upload-session state keyed by content hash.
//!
//! Sessions live in a hash-field cache (`HGET`/`HSET`/`HDEL` style). The
//! session record itself sits in field `<hash>` of the `sessions` hash; the
//! persisted chunk set sits in its own `chunks:<hash>` hash, one field per
//! index. `begin_if_absent` relies on `hsetnx` so exactly one writer creates a
//! session, and finalize fencing relies on `hcas`.

use crate::{
    errors::{UploadError, UploadResult, bounded},
    models::{
        content_hash::ContentHash,
        file::BackendKind,
        session::{UploadPhase, UploadSession},
    },
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tracing::{debug, info};

const SESSIONS_KEY: &str = "sessions";

fn chunks_key(hash: &ContentHash) -> String {
    format!("chunks:{hash}")
}

/// Hash-field key-value operations the session store needs from its cache.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> UploadResult<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> UploadResult<()>;

    /// Set `field` only if absent. Returns whether this call created it.
    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> UploadResult<bool>;

    /// Replace `field` only if it currently holds `expected`.
    async fn hcas(&self, key: &str, field: &str, expected: &str, value: &str)
    -> UploadResult<bool>;

    async fn hdel(&self, key: &str, field: &str) -> UploadResult<bool>;

    async fn hgetall(&self, key: &str) -> UploadResult<Vec<(String, String)>>;

    async fn del(&self, key: &str) -> UploadResult<()>;
}

/// [`SessionCache`] persisted in the service's SQLite database.
#[derive(Clone)]
pub struct SqliteSessionCache {
    db: Arc<SqlitePool>,
}

impl SqliteSessionCache {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionCache for SqliteSessionCache {
    async fn hget(&self, key: &str, field: &str) -> UploadResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM session_cache WHERE hash_key = ? AND field = ?",
        )
        .bind(key)
        .bind(field)
        .fetch_optional(&*self.db)
        .await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> UploadResult<()> {
        sqlx::query(
            "INSERT INTO session_cache (hash_key, field, value) VALUES (?, ?, ?)
             ON CONFLICT(hash_key, field) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> UploadResult<bool> {
        let result = sqlx::query(
            "INSERT INTO session_cache (hash_key, field, value) VALUES (?, ?, ?)
             ON CONFLICT(hash_key, field) DO NOTHING",
        )
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn hcas(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE session_cache SET value = ? WHERE hash_key = ? AND field = ? AND value = ?",
        )
        .bind(value)
        .bind(key)
        .bind(field)
        .bind(expected)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn hdel(&self, key: &str, field: &str) -> UploadResult<bool> {
        let result = sqlx::query("DELETE FROM session_cache WHERE hash_key = ? AND field = ?")
            .bind(key)
            .bind(field)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn hgetall(&self, key: &str) -> UploadResult<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT field, value FROM session_cache WHERE hash_key = ?",
        )
        .bind(key)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    async fn del(&self, key: &str) -> UploadResult<()> {
        sqlx::query("DELETE FROM session_cache WHERE hash_key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

/// Session bookkeeping on top of a [`SessionCache`], with every call bounded
/// by `timeout`.
#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<dyn SessionCache>,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn SessionCache>, timeout: Duration) -> Self {
        Self { cache, timeout }
    }

    /// Load the session for `hash` with its chunk set. No side effects.
    pub async fn probe(&self, hash: &ContentHash) -> UploadResult<Option<UploadSession>> {
        bounded(self.timeout, "session probe", async {
            let Some(raw) = self.cache.hget(SESSIONS_KEY, &hash.to_string()).await? else {
                return Ok(None);
            };
            let mut session: UploadSession = serde_json::from_str(&raw)?;
            for (field, value) in self.cache.hgetall(&chunks_key(hash)).await? {
                let (Ok(index), Ok(len)) = (field.parse::<u32>(), value.parse::<u64>()) else {
                    debug!("ignoring malformed chunk entry {field}={value} for {hash}");
                    continue;
                };
                session.chunks.insert(index, len);
            }
            Ok(Some(session))
        })
        .await
    }

    /// Create the session for `hash` unless one exists.
    ///
    /// Returns the session that is now authoritative and whether this call
    /// created it. A caller that lost the race must adopt the returned session.
    pub async fn begin_if_absent(
        &self,
        hash: &ContentHash,
        backend: BackendKind,
        remote_upload_id: Option<String>,
    ) -> UploadResult<(UploadSession, bool)> {
        let candidate = UploadSession::new(*hash, backend, remote_upload_id);
        let raw = serde_json::to_string(&candidate)?;
        let created = bounded(
            self.timeout,
            "session begin",
            self.cache.hsetnx(SESSIONS_KEY, &hash.to_string(), &raw),
        )
        .await?;

        if created {
            info!(content_hash = %hash, backend = %backend, "upload session begun");
            return Ok((candidate, true));
        }

        match self.probe(hash).await? {
            Some(existing) => Ok((existing, false)),
            // Dropped between our insert attempt and the read.
            None => Err(UploadError::TransientIo(format!(
                "session for {hash} vanished during begin; retry"
            ))),
        }
    }

    /// Record chunk `index`. Re-recording an index overwrites its length.
    pub async fn record_chunk(&self, hash: &ContentHash, index: u32, len: u64) -> UploadResult<()> {
        bounded(
            self.timeout,
            "session record chunk",
            self.cache
                .hset(&chunks_key(hash), &index.to_string(), &len.to_string()),
        )
        .await
    }

    /// Remove chunk `index` from the set, used when the backend no longer has it.
    pub async fn forget_chunk(&self, hash: &ContentHash, index: u32) -> UploadResult<()> {
        bounded(
            self.timeout,
            "session forget chunk",
            self.cache.hdel(&chunks_key(hash), &index.to_string()),
        )
        .await
        .map(|_| ())
    }

    /// Reconcile the recorded chunk set with the backend's persisted indices.
    ///
    /// `lengths` supplies byte lengths for indices unknown to the session.
    pub async fn reconcile(
        &self,
        session: &mut UploadSession,
        persisted: &BTreeSet<u32>,
        lengths: impl Fn(u32) -> u64,
    ) -> UploadResult<()> {
        let stale: Vec<u32> = session
            .chunks
            .keys()
            .filter(|index| !persisted.contains(index))
            .copied()
            .collect();
        for index in stale {
            debug!(content_hash = %session.content_hash, index, "forgetting chunk absent from backend");
            self.forget_chunk(&session.content_hash, index).await?;
            session.chunks.remove(&index);
        }
        for index in persisted {
            if !session.chunks.contains_key(index) {
                let len = lengths(*index);
                self.record_chunk(&session.content_hash, *index, len).await?;
                session.chunks.insert(*index, len);
            }
        }
        Ok(())
    }

    /// Move the session from `from` to `to` if the stored record still
    /// matches `session` in phase `from`.
    ///
    /// Entering `Finalizing` stamps the record with the current time; leaving
    /// it clears the stamp. Returns the stored record, or `None` when the
    /// session is gone or was changed by someone else.
    pub async fn transition(
        &self,
        session: &UploadSession,
        from: UploadPhase,
        to: UploadPhase,
    ) -> UploadResult<Option<UploadSession>> {
        let mut expected = session.clone();
        expected.phase = from;
        let mut next = session.clone();
        next.phase = to;
        next.finalizing_since = (to == UploadPhase::Finalizing).then(Utc::now);
        let swapped = bounded(
            self.timeout,
            "session transition",
            self.cache.hcas(
                SESSIONS_KEY,
                &session.content_hash.to_string(),
                &serde_json::to_string(&expected)?,
                &serde_json::to_string(&next)?,
            ),
        )
        .await?;
        Ok(swapped.then_some(next))
    }

    /// Tear down all state for `hash`. Chunks go first so a later session for
    /// the same hash never inherits a stale chunk set.
    pub async fn drop(&self, hash: &ContentHash) -> UploadResult<()> {
        bounded(self.timeout, "session drop", async {
            self.cache.del(&chunks_key(hash)).await?;
            self.cache.hdel(SESSIONS_KEY, &hash.to_string()).await?;
            Ok(())
        })
        .await?;
        info!(content_hash = %hash, "upload session dropped");
        Ok(())
    }
}
