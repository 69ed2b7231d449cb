//! Local chunk store.
//!
//! Layout beneath the storage root:
//! - `staging/{hash}/chunk_{index}`: chunks of in-progress uploads
//! - `objects/{shard}/{shard}/{hash}`: assembled, verified objects
//! - `rejected/{hash}-{uuid}`: staging directories that failed verification
//!
//! Every file is written to a `.tmp-{uuid}` sibling, synced, then renamed into
//! place, so a listing never observes a partially written chunk or object.

use super::Finalized;
use crate::{
    errors::{UploadError, UploadResult, bounded},
    models::{content_hash::ContentHash, session::UploadSession},
    services::hasher::StreamingHasher,
};
use bytes::Bytes;
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, error, info};
use uuid::Uuid;

const CHUNK_PREFIX: &str = "chunk_";

#[derive(Clone, Debug)]
pub struct LocalChunkStore {
    root: PathBuf,
    timeout: Duration,
}

impl LocalChunkStore {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
        }
    }

    pub fn staging_dir(&self, hash: &ContentHash) -> PathBuf {
        self.root.join("staging").join(hash.to_string())
    }

    fn objects_root(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn rejected_root(&self) -> PathBuf {
        self.root.join("rejected")
    }

    /// Path of the assembled object for `hash`.
    pub fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let (shard_a, shard_b) = hash.shards();
        let mut path = self.objects_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(hash.to_string());
        path
    }

    fn chunk_path(dir: &Path, index: u32) -> PathBuf {
        dir.join(format!("{CHUNK_PREFIX}{index}"))
    }

    fn parse_chunk_name(name: &str) -> Option<u32> {
        let digits = name.strip_prefix(CHUNK_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    pub async fn init(&self, hash: &ContentHash) -> UploadResult<()> {
        let dir = self.staging_dir(hash);
        bounded(self.timeout, "create staging directory", async {
            fs::create_dir_all(&dir).await?;
            Ok(())
        })
        .await?;
        debug!("staging directory ready at {}", dir.display());
        Ok(())
    }

    /// Write chunk `index`, replacing any earlier copy of the same index.
    pub async fn persist_chunk(
        &self,
        session: &UploadSession,
        index: u32,
        data: Bytes,
    ) -> UploadResult<()> {
        let dir = self.staging_dir(&session.content_hash);
        bounded(self.timeout, "persist chunk", async {
            fs::create_dir_all(&dir).await?;
            let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
            if let Err(err) = write_synced(&tmp_path, &data).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
            if let Err(err) = fs::rename(&tmp_path, Self::chunk_path(&dir, index)).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
            Ok(())
        })
        .await
    }

    /// Persisted chunk indices and their byte lengths, parsed from file names.
    pub async fn list_persisted(&self, hash: &ContentHash) -> UploadResult<BTreeMap<u32, u64>> {
        let dir = self.staging_dir(hash);
        bounded(self.timeout, "list staged chunks", async {
            let mut chunks = BTreeMap::new();
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(chunks),
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(index) = name.to_str().and_then(Self::parse_chunk_name) else {
                    continue;
                };
                let meta = entry.metadata().await?;
                if meta.is_file() {
                    chunks.insert(index, meta.len());
                }
            }
            Ok(chunks)
        })
        .await
    }

    /// Assemble chunks `0..expected` into the object file while hashing them.
    ///
    /// On a digest mismatch the temp object is discarded and the staging
    /// directory is moved under `rejected/` for inspection.
    pub async fn finalize(&self, session: &UploadSession, expected: u32) -> UploadResult<Finalized> {
        let hash = session.content_hash;
        let persisted = self.list_persisted(&hash).await?;
        let missing: Vec<u32> = (0..expected)
            .filter(|index| !persisted.contains_key(index))
            .collect();
        if !missing.is_empty() {
            return Err(UploadError::MissingChunks { expected, missing });
        }
        if let Some((extra, _)) = persisted.range(expected..).next() {
            return Err(UploadError::SessionConflict(format!(
                "chunk {extra} is staged beyond the declared count {expected}"
            )));
        }

        let staging = self.staging_dir(&hash);
        let object_path = self.object_path(&hash);
        let parent = object_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            UploadError::TransientIo("object path missing parent directory".into())
        })?;

        bounded(self.timeout, "assemble object", async {
            fs::create_dir_all(&parent).await?;
            let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

            let (actual, size_bytes) = match assemble(&staging, &tmp_path, expected).await {
                Ok(done) => done,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            };

            if actual != hash {
                let _ = fs::remove_file(&tmp_path).await;
                let quarantined = self.quarantine(&hash).await;
                error!(
                    content_hash = %hash,
                    computed = %actual,
                    quarantined = ?quarantined,
                    "assembled content failed integrity check"
                );
                return Err(UploadError::IntegrityMismatch {
                    expected: hash,
                    actual,
                });
            }

            if let Err(err) = fs::rename(&tmp_path, &object_path).await {
                if err.kind() == ErrorKind::AlreadyExists {
                    fs::remove_file(&object_path).await?;
                    fs::rename(&tmp_path, &object_path).await?;
                } else {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err.into());
                }
            }

            info!(
                content_hash = %hash,
                size_bytes,
                "assembled object at {}",
                object_path.display()
            );
            Ok(Finalized {
                location: object_path.to_string_lossy().into_owned(),
                size_bytes,
                verified: true,
            })
        })
        .await
    }

    /// Move the staging directory aside; returns where it went.
    async fn quarantine(&self, hash: &ContentHash) -> Option<PathBuf> {
        let target = self
            .rejected_root()
            .join(format!("{}-{}", hash, Uuid::new_v4()));
        if let Err(err) = fs::create_dir_all(self.rejected_root()).await {
            debug!("could not create rejected directory: {}", err);
            return None;
        }
        match fs::rename(self.staging_dir(hash), &target).await {
            Ok(()) => Some(target),
            Err(err) => {
                debug!("could not quarantine staging for {}: {}", hash, err);
                None
            }
        }
    }

    /// Delete the staging directory for `hash`. Missing directories are fine.
    pub async fn remove_staging(&self, hash: &ContentHash) -> UploadResult<()> {
        let dir = self.staging_dir(hash);
        bounded(self.timeout, "remove staging directory", async {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    /// Remove an assembled object and prune the shard directories it leaves empty.
    pub async fn delete_object(&self, location: &str) -> UploadResult<()> {
        let path = PathBuf::from(location);
        let objects_root = self.objects_root();
        if !path.starts_with(&objects_root) {
            return Err(UploadError::InvalidRequest(format!(
                "{} is outside the object store",
                path.display()
            )));
        }

        bounded(self.timeout, "delete object", async {
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed physical file {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("file {} already missing", path.display());
                }
                Err(err) => return Err(err.into()),
            }
            if let Some(parent) = path.parent() {
                prune_empty_dirs(parent, &objects_root).await;
            }
            Ok(())
        })
        .await
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Stream chunks `0..expected` in ascending order into `out_path` and the hasher.
async fn assemble(staging: &Path, out_path: &Path, expected: u32) -> UploadResult<(ContentHash, u64)> {
    let mut out = File::create(out_path).await?;
    let mut hasher = StreamingHasher::new();
    for index in 0..expected {
        let data = fs::read(LocalChunkStore::chunk_path(staging, index)).await?;
        hasher
            .update_chunk(index, &data)
            .map_err(|e| UploadError::SessionConflict(e.to_string()))?;
        out.write_all(&data).await?;
    }
    out.flush().await?;
    out.sync_all().await?;
    let size_bytes = hasher.bytes();
    Ok((hasher.finalize(), size_bytes))
}

/// Remove empty directories from `start` up to, but not including, `stop`.
async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(_) => {
                if let Some(parent) = current.parent() {
                    current = parent.to_path_buf();
                } else {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::file::BackendKind;

    fn store(tmp: &tempfile::TempDir) -> LocalChunkStore {
        LocalChunkStore::new(tmp.path(), Duration::from_secs(5))
    }

    fn session_for(data: &[u8]) -> UploadSession {
        UploadSession::new(ContentHash::compute(data), BackendKind::Local, None)
    }

    #[test]
    fn chunk_names_round_trip_and_skip_temp_files() {
        assert_eq!(LocalChunkStore::parse_chunk_name("chunk_12"), Some(12));
        assert_eq!(LocalChunkStore::parse_chunk_name("chunk_"), None);
        assert_eq!(LocalChunkStore::parse_chunk_name("chunk_+1"), None);
        assert_eq!(LocalChunkStore::parse_chunk_name(".tmp-1234"), None);
    }

    #[tokio::test]
    async fn persisting_same_index_twice_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let session = session_for(b"abcdef");
        store.init(&session.content_hash).await.unwrap();

        store
            .persist_chunk(&session, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        store
            .persist_chunk(&session, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let listed = store.list_persisted(&session.content_hash).await.unwrap();
        assert_eq!(listed.into_iter().collect::<Vec<_>>(), vec![(0, 3)]);
        let entries = std::fs::read_dir(store.staging_dir(&session.content_hash))
            .unwrap()
            .count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn listing_reflects_interrupted_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let session = session_for(b"irrelevant");
        for index in [4, 0, 2] {
            store
                .persist_chunk(&session, index, Bytes::from(vec![index as u8; 8]))
                .await
                .unwrap();
        }
        // Leftover temp file from a crashed write.
        std::fs::write(store.staging_dir(&session.content_hash).join(".tmp-dead"), b"x").unwrap();

        let listed = store.list_persisted(&session.content_hash).await.unwrap();
        assert_eq!(listed.keys().copied().collect::<Vec<_>>(), vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn finalize_assembles_in_index_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let data: Vec<u8> = (0..2560u32).map(|i| (i % 253) as u8).collect();
        let session = session_for(&data);

        // Out-of-order arrival.
        store
            .persist_chunk(&session, 2, Bytes::copy_from_slice(&data[2048..]))
            .await
            .unwrap();
        store
            .persist_chunk(&session, 0, Bytes::copy_from_slice(&data[..1024]))
            .await
            .unwrap();
        store
            .persist_chunk(&session, 1, Bytes::copy_from_slice(&data[1024..2048]))
            .await
            .unwrap();

        let finalized = store.finalize(&session, 3).await.unwrap();
        assert!(finalized.verified);
        assert_eq!(finalized.size_bytes, 2560);
        assert_eq!(std::fs::read(&finalized.location).unwrap(), data);
        assert_eq!(
            PathBuf::from(&finalized.location),
            store.object_path(&session.content_hash)
        );
    }

    #[tokio::test]
    async fn finalize_reports_gaps() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let session = session_for(b"whatever");
        for index in [0, 1, 3, 4] {
            store
                .persist_chunk(&session, index, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        match store.finalize(&session, 5).await {
            Err(UploadError::MissingChunks { expected, missing }) => {
                assert_eq!(expected, 5);
                assert_eq!(missing, vec![2]);
            }
            other => panic!("expected MissingChunks, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tampered_chunk_is_rejected_and_quarantined() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let session = session_for(b"hello world");
        store
            .persist_chunk(&session, 0, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        store
            .persist_chunk(&session, 1, Bytes::from_static(b"w0rld"))
            .await
            .unwrap();

        let err = store.finalize(&session, 2).await.unwrap_err();
        assert!(matches!(err, UploadError::IntegrityMismatch { .. }));
        assert!(!store.object_path(&session.content_hash).exists());
        assert!(!store.staging_dir(&session.content_hash).exists());

        let rejected: Vec<_> = std::fs::read_dir(tmp.path().join("rejected"))
            .unwrap()
            .collect();
        assert_eq!(rejected.len(), 1);
    }

    #[tokio::test]
    async fn delete_object_prunes_shards() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(&tmp);
        let session = session_for(b"tiny");
        store
            .persist_chunk(&session, 0, Bytes::from_static(b"tiny"))
            .await
            .unwrap();
        let finalized = store.finalize(&session, 1).await.unwrap();
        store.remove_staging(&session.content_hash).await.unwrap();

        store.delete_object(&finalized.location).await.unwrap();
        assert!(!PathBuf::from(&finalized.location).exists());
        let (shard_a, _) = session.content_hash.shards();
        assert!(!tmp.path().join("objects").join(shard_a).exists());
        assert!(tmp.path().join("objects").exists());

        assert!(matches!(
            store.delete_object("/etc/passwd").await,
            Err(UploadError::InvalidRequest(_))
        ));
    }
}
