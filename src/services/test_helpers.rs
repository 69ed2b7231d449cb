//! In-memory doubles shared by the service and handler tests.

use crate::{
    errors::{UploadError, UploadResult},
    services::{
        backend::{Backend, local::LocalChunkStore, remote::RemoteMultipartStore},
        coordinator::{UploadCoordinator, UploadLimits},
        metadata_store::MetadataStore,
        object_store_client::{ObjectStoreClient, RemotePart},
        session_store::{SessionCache, SessionStore, SqliteSessionCache},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use uuid::Uuid;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A migrated in-memory database. One connection, kept alive for the pool's
/// lifetime, so every query sees the same database.
pub async fn memory_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    let pool = Arc::new(pool);
    MetadataStore::new(pool.clone())
        .migrate()
        .await
        .expect("migrate in-memory sqlite");
    pool
}

pub fn local_coordinator(pool: Arc<SqlitePool>, root: &Path) -> UploadCoordinator {
    coordinator(
        pool,
        Backend::Local(LocalChunkStore::new(root, TEST_TIMEOUT)),
    )
}

pub fn remote_coordinator(pool: Arc<SqlitePool>, client: Arc<MemoryObjectStore>) -> UploadCoordinator {
    coordinator(
        pool,
        Backend::Remote(RemoteMultipartStore::new(client, "uploads", TEST_TIMEOUT)),
    )
}

/// A local coordinator whose sessions live in `pool`, as in production, so a
/// second coordinator built on the same pool and root picks up where the
/// first stopped.
pub fn durable_local_coordinator(
    pool: Arc<SqlitePool>,
    root: &Path,
    finalize_lease: Duration,
) -> UploadCoordinator {
    UploadCoordinator::new(
        SessionStore::new(Arc::new(SqliteSessionCache::new(pool.clone())), TEST_TIMEOUT),
        Backend::Local(LocalChunkStore::new(root, TEST_TIMEOUT)),
        MetadataStore::new(pool),
        test_limits(finalize_lease),
    )
}

fn coordinator(pool: Arc<SqlitePool>, backend: Backend) -> UploadCoordinator {
    UploadCoordinator::new(
        SessionStore::new(Arc::new(MemorySessionCache::default()), TEST_TIMEOUT),
        backend,
        MetadataStore::new(pool),
        test_limits(TEST_TIMEOUT),
    )
}

fn test_limits(finalize_lease: Duration) -> UploadLimits {
    UploadLimits {
        max_chunk_bytes: 1024 * 1024,
        max_chunk_count: 64,
        finalize_lease,
    }
}

#[derive(Default)]
pub struct MemorySessionCache {
    hashes: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn hget(&self, key: &str, field: &str) -> UploadResult<Option<String>> {
        let hashes = self.hashes.lock().unwrap();
        Ok(hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> UploadResult<()> {
        let mut hashes = self.hashes.lock().unwrap();
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> UploadResult<bool> {
        let mut hashes = self.hashes.lock().unwrap();
        let hash = hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hcas(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> UploadResult<bool> {
        let mut hashes = self.hashes.lock().unwrap();
        match hashes.get_mut(key).and_then(|h| h.get_mut(field)) {
            Some(current) if current == expected => {
                *current = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> UploadResult<bool> {
        let mut hashes = self.hashes.lock().unwrap();
        Ok(hashes
            .get_mut(key)
            .is_some_and(|h| h.remove(field).is_some()))
    }

    async fn hgetall(&self, key: &str) -> UploadResult<Vec<(String, String)>> {
        let hashes = self.hashes.lock().unwrap();
        Ok(hashes
            .get(key)
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn del(&self, key: &str) -> UploadResult<()> {
        self.hashes.lock().unwrap().remove(key);
        Ok(())
    }
}

/// A cache whose every call fails, as if the server were unreachable.
pub struct UnavailableCache;

fn unreachable_cache<T>() -> UploadResult<T> {
    Err(UploadError::TransientIo("session cache unreachable".into()))
}

#[async_trait]
impl SessionCache for UnavailableCache {
    async fn hget(&self, _: &str, _: &str) -> UploadResult<Option<String>> {
        unreachable_cache()
    }

    async fn hset(&self, _: &str, _: &str, _: &str) -> UploadResult<()> {
        unreachable_cache()
    }

    async fn hsetnx(&self, _: &str, _: &str, _: &str) -> UploadResult<bool> {
        unreachable_cache()
    }

    async fn hcas(&self, _: &str, _: &str, _: &str, _: &str) -> UploadResult<bool> {
        unreachable_cache()
    }

    async fn hdel(&self, _: &str, _: &str) -> UploadResult<bool> {
        unreachable_cache()
    }

    async fn hgetall(&self, _: &str) -> UploadResult<Vec<(String, String)>> {
        unreachable_cache()
    }

    async fn del(&self, _: &str) -> UploadResult<()> {
        unreachable_cache()
    }
}

struct OpenUpload {
    key: String,
    parts: BTreeMap<u32, Vec<u8>>,
}

/// Multipart object store kept in memory.
#[derive(Default)]
pub struct MemoryObjectStore {
    uploads: Mutex<HashMap<String, OpenUpload>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    part_uploads: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn part_numbers(&self, upload_id: &str) -> Vec<u32> {
        self.uploads
            .lock()
            .unwrap()
            .get(upload_id)
            .map(|upload| upload.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn open_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    /// Total `upload_part` calls served so far.
    pub fn part_upload_calls(&self) -> usize {
        self.part_uploads.load(Ordering::SeqCst)
    }

    fn no_such_upload(upload_id: &str) -> UploadError {
        UploadError::NotFound(format!("multipart upload {upload_id}"))
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryObjectStore {
    async fn initiate_multipart_upload(&self, key: &str) -> UploadResult<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.uploads.lock().unwrap().insert(
            upload_id.clone(),
            OpenUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> UploadResult<String> {
        self.part_uploads.fetch_add(1, Ordering::SeqCst);
        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        let etag = format!("{:x}", md5::compute(&data));
        upload.parts.insert(part_number, data.to_vec());
        Ok(etag)
    }

    async fn list_parts(&self, _key: &str, upload_id: &str) -> UploadResult<Vec<RemotePart>> {
        let uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        Ok(upload
            .parts
            .iter()
            .map(|(number, data)| RemotePart {
                part_number: *number,
                etag: format!("{:x}", md5::compute(data)),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[RemotePart],
    ) -> UploadResult<()> {
        let upload = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        let mut object = Vec::new();
        for part in parts {
            let data = upload.parts.get(&part.part_number).ok_or_else(|| {
                UploadError::InvalidRequest(format!("part {} was never uploaded", part.part_number))
            })?;
            object.extend_from_slice(data);
        }
        self.objects.lock().unwrap().insert(key.to_string(), object);
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> UploadResult<()> {
        self.uploads.lock().unwrap().remove(upload_id);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> UploadResult<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn presign_download_url(&self, key: &str, filename: &str) -> UploadResult<String> {
        Ok(format!("https://objects.test/{key}?filename={filename}"))
    }
}
