//! Remote object store used by the multipart backend.
//!
//! `S3Client` signs requests with `rusty-s3` and runs them on the blocking
//! pool with `ureq`. Every call carries connect/read/write timeouts on the
//! agent plus an outer deadline; there is no internal retry.

use crate::errors::{UploadError, UploadResult, bounded};
use async_trait::async_trait;
use bytes::Bytes;
use rusty_s3::actions::{CreateMultipartUpload, ListParts, S3Action};
use rusty_s3::{Bucket, Credentials, UrlStyle};
use std::{sync::Arc, time::Duration};

/// Validity of signed request and download URLs.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// A part the remote store has accepted for an in-progress multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemotePart {
    /// 1-based part number.
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn initiate_multipart_upload(&self, key: &str) -> UploadResult<String>;

    /// Upload one part; returns its etag. Re-uploading a part number replaces it.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> UploadResult<String>;

    /// Parts received so far, ascending by part number.
    async fn list_parts(&self, key: &str, upload_id: &str) -> UploadResult<Vec<RemotePart>>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[RemotePart],
    ) -> UploadResult<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> UploadResult<()>;

    async fn delete_object(&self, key: &str) -> UploadResult<()>;

    /// Time-limited GET URL whose response names the file `filename`.
    async fn presign_download_url(&self, key: &str, filename: &str) -> UploadResult<String>;
}

/// Connection settings for an S3-compatible endpoint.
#[derive(Clone, Debug)]
pub struct S3Settings {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Clone)]
pub struct S3Client {
    inner: Arc<S3Inner>,
    timeout: Duration,
}

struct S3Inner {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
}

impl S3Client {
    pub fn new(settings: &S3Settings, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = settings
            .endpoint
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid S3 endpoint URL '{}': {e}", settings.endpoint))?;

        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            settings.bucket.clone(),
            settings.region.clone(),
        )
        .map_err(|e| anyhow::anyhow!("failed to create S3 bucket handle: {e}"))?;

        let credentials = Credentials::new(&settings.access_key, &settings.secret_key);

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();

        Ok(Self {
            inner: Arc::new(S3Inner {
                bucket,
                credentials,
                agent,
            }),
            timeout,
        })
    }

    /// Run a blocking S3 call off the async runtime, under the client deadline.
    async fn run<T, F>(&self, op: String, f: F) -> UploadResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&S3Inner) -> Result<T, String> + Send + 'static,
    {
        let inner = self.inner.clone();
        let label = op.clone();
        bounded(self.timeout, &op, async move {
            tokio::task::spawn_blocking(move || f(&inner))
                .await
                .map_err(|e| UploadError::TransientIo(format!("S3 {label}: worker failed: {e}")))?
                .map_err(|e| UploadError::TransientIo(format!("S3 {label}: {e}")))
        })
        .await
    }
}

fn read_body(resp: ureq::Response) -> Result<String, String> {
    resp.into_string().map_err(|e| format!("reading response: {e}"))
}

fn part_number_u16(part_number: u32) -> Result<u16, String> {
    u16::try_from(part_number).map_err(|_| format!("part number {part_number} out of range"))
}

#[async_trait]
impl ObjectStoreClient for S3Client {
    async fn initiate_multipart_upload(&self, key: &str) -> UploadResult<String> {
        let key = key.to_string();
        self.run(format!("CREATE MULTIPART {key}"), move |s3| {
            let url = s3
                .bucket
                .create_multipart_upload(Some(&s3.credentials), &key)
                .sign(PRESIGN_DURATION);
            let resp = s3
                .agent
                .post(url.as_str())
                .call()
                .map_err(|e| e.to_string())?;
            let body = read_body(resp)?;
            let parsed = CreateMultipartUpload::parse_response(&body)
                .map_err(|e| format!("failed to parse response: {e}"))?;
            Ok(parsed.upload_id().to_string())
        })
        .await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> UploadResult<String> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        self.run(format!("UPLOAD PART {key}#{part_number}"), move |s3| {
            let number = part_number_u16(part_number)?;
            let url = s3
                .bucket
                .upload_part(Some(&s3.credentials), &key, number, &upload_id)
                .sign(PRESIGN_DURATION);
            let resp = s3
                .agent
                .put(url.as_str())
                .send_bytes(&data)
                .map_err(|e| e.to_string())?;
            resp.header("ETag")
                .map(|etag| etag.to_string())
                .ok_or_else(|| "response carried no ETag".to_string())
        })
        .await
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> UploadResult<Vec<RemotePart>> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        self.run(format!("LIST PARTS {key}"), move |s3| {
            let url = s3
                .bucket
                .list_parts(Some(&s3.credentials), &key, &upload_id)
                .sign(PRESIGN_DURATION);
            let resp = s3
                .agent
                .get(url.as_str())
                .call()
                .map_err(|e| e.to_string())?;
            let body = read_body(resp)?;
            let parsed = ListParts::parse_response(&body)
                .map_err(|e| format!("failed to parse response: {e}"))?;
            let mut parts: Vec<RemotePart> = parsed
                .parts
                .into_iter()
                .map(|part| RemotePart {
                    part_number: u32::from(part.number),
                    etag: part.etag,
                    size: part.size,
                })
                .collect();
            parts.sort_by_key(|part| part.part_number);
            Ok(parts)
        })
        .await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[RemotePart],
    ) -> UploadResult<()> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        let etags: Vec<String> = parts.iter().map(|part| part.etag.clone()).collect();
        self.run(format!("COMPLETE MULTIPART {key}"), move |s3| {
            let action = s3.bucket.complete_multipart_upload(
                Some(&s3.credentials),
                &key,
                &upload_id,
                etags.iter().map(String::as_str),
            );
            let url = action.sign(PRESIGN_DURATION);
            let body = action.body();
            s3.agent
                .post(url.as_str())
                .send_string(&body)
                .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> UploadResult<()> {
        let key = key.to_string();
        let upload_id = upload_id.to_string();
        self.run(format!("ABORT MULTIPART {key}"), move |s3| {
            let url = s3
                .bucket
                .abort_multipart_upload(Some(&s3.credentials), &key, &upload_id)
                .sign(PRESIGN_DURATION);
            match s3.agent.delete(url.as_str()).call() {
                Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await
    }

    async fn delete_object(&self, key: &str) -> UploadResult<()> {
        let key = key.to_string();
        self.run(format!("DELETE {key}"), move |s3| {
            let url = s3
                .bucket
                .delete_object(Some(&s3.credentials), &key)
                .sign(PRESIGN_DURATION);
            match s3.agent.delete(url.as_str()).call() {
                Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await
    }

    async fn presign_download_url(&self, key: &str, filename: &str) -> UploadResult<String> {
        let mut action = self
            .inner
            .bucket
            .get_object(Some(&self.inner.credentials), key);
        action.query_mut().insert(
            "response-content-disposition",
            format!("attachment; filename=\"{}\"", filename.replace('"', "")),
        );
        Ok(action.sign(PRESIGN_DURATION).to_string())
    }
}
