//! MetadataStore: committed file records and ownership links in SQLite.
//!
//! Reference counting is kept transactional: every statement that adds or
//! removes an ownership row adjusts `files.copies` in the same transaction,
//! so `copies` always equals the number of ownership rows for the hash.

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        content_hash::ContentHash,
        file::{BackendKind, FileRecord, OwnershipRecord},
    },
};
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const FILE_COLUMNS: &str =
    "content_hash, size_bytes, location, backend, verified, copies, created_at";
const OWNERSHIP_COLUMNS: &str = "user_id, content_hash, filename, size_bytes, uploaded_at";

/// Everything needed to record a freshly finalized upload.
#[derive(Debug, Clone)]
pub struct NewUpload<'a> {
    pub user_id: &'a str,
    pub content_hash: ContentHash,
    pub filename: &'a str,
    pub size_bytes: u64,
    pub location: &'a str,
    pub backend: BackendKind,
    pub verified: bool,
}

/// Outcome of linking a user to content that is already stored.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    Linked(FileRecord),
    AlreadyOwned(FileRecord),
    /// No file record exists (or it disappeared concurrently).
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemovedOwnership {
    pub removed: bool,
    /// The file record that lost its last reference and was deleted.
    pub unreferenced: Option<FileRecord>,
}

#[derive(Clone)]
pub struct MetadataStore {
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> UploadResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    pub async fn get_file_record(&self, hash: &ContentHash) -> UploadResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE content_hash = ?"
        ))
        .bind(hash.to_string())
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    pub async fn ownership_exists(
        &self,
        user_id: &str,
        hash: &ContentHash,
        filename: &str,
    ) -> UploadResult<bool> {
        Ok(self.get_ownership(user_id, hash, filename).await?.is_some())
    }

    pub async fn get_ownership(
        &self,
        user_id: &str,
        hash: &ContentHash,
        filename: &str,
    ) -> UploadResult<Option<OwnershipRecord>> {
        let record = sqlx::query_as::<_, OwnershipRecord>(&format!(
            "SELECT {OWNERSHIP_COLUMNS} FROM user_files
             WHERE user_id = ? AND content_hash = ? AND filename = ?"
        ))
        .bind(user_id)
        .bind(hash.to_string())
        .bind(filename)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    /// Create the file record with one copy, or add a copy if it exists.
    pub async fn create_or_increment_file_record(
        &self,
        hash: &ContentHash,
        size_bytes: u64,
        location: &str,
        backend: BackendKind,
        verified: bool,
    ) -> UploadResult<FileRecord> {
        let mut conn = self.db.acquire().await?;
        upsert_file(&mut conn, hash, size_bytes, location, backend, verified).await
    }

    /// Insert an ownership row. Returns false when the triple already exists.
    ///
    /// Does not touch `copies`; callers pair it with a file-record update.
    pub async fn create_ownership_record(
        &self,
        user_id: &str,
        hash: &ContentHash,
        filename: &str,
        size_bytes: u64,
    ) -> UploadResult<bool> {
        let mut conn = self.db.acquire().await?;
        insert_ownership(&mut conn, user_id, hash, filename, size_bytes).await
    }

    /// Record a verified upload and its first (or next) owner atomically.
    ///
    /// The file row is created or its count incremented only when the
    /// ownership row is new, so a racing second finalizer of the same hash
    /// degenerates into a reference-count increment.
    pub async fn commit_upload(&self, upload: &NewUpload<'_>) -> UploadResult<(FileRecord, bool)> {
        let mut tx = self.db.begin().await?;

        let inserted = insert_ownership(
            &mut tx,
            upload.user_id,
            &upload.content_hash,
            upload.filename,
            upload.size_bytes,
        )
        .await?;

        let record = if inserted {
            upsert_file(
                &mut tx,
                &upload.content_hash,
                upload.size_bytes,
                upload.location,
                upload.backend,
                upload.verified,
            )
            .await?
        } else {
            sqlx::query(&format!(
                "INSERT INTO files ({FILE_COLUMNS}) VALUES (?, ?, ?, ?, ?, 0, ?)
                 ON CONFLICT(content_hash) DO NOTHING"
            ))
            .bind(upload.content_hash.to_string())
            .bind(upload.size_bytes as i64)
            .bind(upload.location)
            .bind(upload.backend.as_str())
            .bind(upload.verified)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
            fetch_file(&mut tx, &upload.content_hash).await?.ok_or_else(|| {
                UploadError::TransientIo("file record missing after insert".into())
            })?
        };

        tx.commit().await?;
        Ok((record, inserted))
    }

    /// Link `user_id` to already-stored content under `filename`, adding a copy.
    pub async fn link_existing(
        &self,
        user_id: &str,
        hash: &ContentHash,
        filename: &str,
    ) -> UploadResult<LinkOutcome> {
        let mut tx = self.db.begin().await?;

        let Some(record) = fetch_file(&mut tx, hash).await? else {
            return Ok(LinkOutcome::Missing);
        };

        let size = u64::try_from(record.size_bytes).unwrap_or_default();
        if !insert_ownership(&mut tx, user_id, hash, filename, size).await? {
            return Ok(LinkOutcome::AlreadyOwned(record));
        }

        let updated = sqlx::query_as::<_, FileRecord>(&format!(
            "UPDATE files SET copies = copies + 1 WHERE content_hash = ?
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(hash.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some(record) => {
                tx.commit().await?;
                Ok(LinkOutcome::Linked(record))
            }
            None => {
                tx.rollback().await?;
                Ok(LinkOutcome::Missing)
            }
        }
    }

    /// Remove an ownership row and release its copy. When the count reaches
    /// zero the file row is deleted and returned so the bytes can be removed.
    pub async fn remove_ownership(
        &self,
        user_id: &str,
        hash: &ContentHash,
        filename: &str,
    ) -> UploadResult<RemovedOwnership> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            "DELETE FROM user_files WHERE user_id = ? AND content_hash = ? AND filename = ?",
        )
        .bind(user_id)
        .bind(hash.to_string())
        .bind(filename)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(RemovedOwnership {
                removed: false,
                unreferenced: None,
            });
        }

        let remaining = sqlx::query_scalar::<_, i64>(
            "UPDATE files SET copies = MAX(copies - 1, 0) WHERE content_hash = ? RETURNING copies",
        )
        .bind(hash.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let unreferenced = match remaining {
            Some(0) => {
                sqlx::query_as::<_, FileRecord>(&format!(
                    "DELETE FROM files WHERE content_hash = ? RETURNING {FILE_COLUMNS}"
                ))
                .bind(hash.to_string())
                .fetch_optional(&mut *tx)
                .await?
            }
            _ => None,
        };

        tx.commit().await?;
        Ok(RemovedOwnership {
            removed: true,
            unreferenced,
        })
    }

    /// A user's files, most recently uploaded first.
    pub async fn list_ownerships(
        &self,
        user_id: &str,
        limit: u32,
    ) -> UploadResult<Vec<OwnershipRecord>> {
        let rows = sqlx::query_as::<_, OwnershipRecord>(&format!(
            "SELECT {OWNERSHIP_COLUMNS} FROM user_files
             WHERE user_id = ?
             ORDER BY uploaded_at DESC, filename ASC
             LIMIT ?"
        ))
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Rename one of a user's files. The reference count is unaffected.
    pub async fn rename_ownership(
        &self,
        user_id: &str,
        hash: &ContentHash,
        from: &str,
        to: &str,
    ) -> UploadResult<OwnershipRecord> {
        let result = sqlx::query_as::<_, OwnershipRecord>(&format!(
            "UPDATE user_files SET filename = ?
             WHERE user_id = ? AND content_hash = ? AND filename = ?
             RETURNING {OWNERSHIP_COLUMNS}"
        ))
        .bind(to)
        .bind(user_id)
        .bind(hash.to_string())
        .bind(from)
        .fetch_optional(&*self.db)
        .await;

        match result {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(UploadError::NotFound(format!("file `{from}` ({hash})"))),
            Err(err) if is_unique_violation(&err) => Err(UploadError::Conflict(format!(
                "file `{to}` ({hash}) already exists"
            ))),
            Err(err) => Err(err.into()),
        }
    }
}

async fn fetch_file(
    conn: &mut SqliteConnection,
    hash: &ContentHash,
) -> UploadResult<Option<FileRecord>> {
    let record = sqlx::query_as::<_, FileRecord>(&format!(
        "SELECT {FILE_COLUMNS} FROM files WHERE content_hash = ?"
    ))
    .bind(hash.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(record)
}

async fn upsert_file(
    conn: &mut SqliteConnection,
    hash: &ContentHash,
    size_bytes: u64,
    location: &str,
    backend: BackendKind,
    verified: bool,
) -> UploadResult<FileRecord> {
    let record = sqlx::query_as::<_, FileRecord>(&format!(
        "INSERT INTO files ({FILE_COLUMNS}) VALUES (?, ?, ?, ?, ?, 1, ?)
         ON CONFLICT(content_hash) DO UPDATE SET copies = files.copies + 1
         RETURNING {FILE_COLUMNS}"
    ))
    .bind(hash.to_string())
    .bind(size_bytes as i64)
    .bind(location)
    .bind(backend.as_str())
    .bind(verified)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;
    Ok(record)
}

async fn insert_ownership(
    conn: &mut SqliteConnection,
    user_id: &str,
    hash: &ContentHash,
    filename: &str,
    size_bytes: u64,
) -> UploadResult<bool> {
    let result = sqlx::query(&format!(
        "INSERT INTO user_files ({OWNERSHIP_COLUMNS}) VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(user_id, content_hash, filename) DO NOTHING"
    ))
    .bind(user_id)
    .bind(hash.to_string())
    .bind(filename)
    .bind(size_bytes as i64)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
