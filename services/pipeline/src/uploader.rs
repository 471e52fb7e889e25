//! Verified upload of completed segments to object storage.
//!
//! A fixed pool of workers consumes completed segments from a shared queue.
//! Claiming a segment is the `Completed -> Uploading` compare-and-set, so
//! two workers can never own the same file. An upload only counts once a
//! HEAD request confirms the remote object's size equals the local file's;
//! transient failures retry with jittered exponential backoff up to the
//! attempt cap, permanent failures (credentials, missing bucket) fail the
//! segment immediately.
//!
//! The uploader never deletes anything: reclaiming disk is the retention
//! sweeper's job, which keeps "durable offsite" and "space reclaimed"
//! independently verifiable.

use crate::config::{S3Config, UploadConfig};
use crate::segment::{Segment, SegmentState, SegmentStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ServerSideEncryption, StorageClass};
use aws_sdk_s3::Client as S3Client;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Datelike, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors from object storage operations.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Worth retrying: network trouble, timeouts, 5xx responses
    #[error("transient upload failure: {0}")]
    Transient(String),
    /// Retrying cannot succeed: credentials, permissions, missing bucket
    #[error("permanent upload failure: {0}")]
    Permanent(String),
    /// The remote copy does not match the local file
    #[error("size mismatch after upload: remote {remote} != local {local}")]
    SizeMismatch { remote: u64, local: u64 },
}

impl UploadError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, UploadError::Permanent(_))
    }
}

/// Object storage operations the pipeline needs. S3 in production, a mock
/// in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync + 'static {
    /// Upload a local file to `key`.
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), UploadError>;

    /// Size of the remote object, or `None` if it does not exist.
    async fn object_size(&self, key: &str) -> Result<Option<u64>, UploadError>;
}

/// Service error codes that no amount of retrying will fix.
const PERMANENT_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "NoSuchBucket",
    "ExpiredToken",
    "AccountProblem",
];

fn classify_sdk_error<E, R>(err: &SdkError<E, R>) -> UploadError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match err.as_service_error().and_then(|service| service.code()) {
        Some(code) if PERMANENT_ERROR_CODES.contains(&code) => {
            UploadError::Permanent(format!("{code}: {err}"))
        }
        Some(code) => UploadError::Transient(format!("{code}: {err}")),
        None => UploadError::Transient(err.to_string()),
    }
}

/// S3-backed object storage.
pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    /// Create an S3 client for the configured destination.
    pub async fn new(config: &S3Config, operation_timeout: Duration) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .timeout_config(
                aws_config::timeout::TimeoutConfig::builder()
                    .operation_timeout(operation_timeout)
                    .build(),
            )
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&aws_config);
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 uploader initialized"
        );

        Self {
            client: S3Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }

    /// Startup probe: an unreachable or forbidden bucket is fatal, since a
    /// pipeline that can never upload should not record at all.
    pub async fn verify_bucket(&self) -> Result<(), UploadError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| classify_sdk_error(&e))
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put_file(&self, key: &str, path: &Path) -> Result<(), UploadError> {
        let body = ByteStream::from_path(path).await.map_err(|e| {
            UploadError::Transient(format!("could not read {}: {e}", path.display()))
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type("video/mp4")
            .content_disposition("inline")
            .cache_control("max-age=31536000")
            .storage_class(StorageClass::Standard)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;

        Ok(())
    }

    async fn object_size(&self, key: &str) -> Result<Option<u64>, UploadError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => Ok(response.content_length().map(|len| len as u64)),
            Err(e) => {
                if e.as_service_error()
                    .map(|service| service.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(classify_sdk_error(&e))
                }
            }
        }
    }
}

/// Deterministic, date-partitioned destination key:
/// `{year}/{month:02}/{day:02}/{camera_id}/{file_name}`.
pub fn destination_key(camera_id: &str, created_at: DateTime<Utc>, file_name: &str) -> String {
    format!(
        "{year}/{month:02}/{day:02}/{camera}/{file_name}",
        year = created_at.year(),
        month = created_at.month(),
        day = created_at.day(),
        camera = sanitize_key_component(camera_id),
    )
}

/// Sanitize a key component to prevent path traversal.
fn sanitize_key_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Fixed-size pool of upload workers over a shared queue.
pub struct UploadWorkerPool {
    store: Arc<SegmentStore>,
    storage: Arc<dyn ObjectStorage>,
    config: UploadConfig,
    uploaded_dir: PathBuf,
}

impl UploadWorkerPool {
    pub fn new(
        store: Arc<SegmentStore>,
        storage: Arc<dyn ObjectStorage>,
        config: UploadConfig,
        uploaded_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            storage,
            config,
            uploaded_dir,
        }
    }

    /// Spawn the configured number of workers.
    pub fn spawn(
        self: Arc<Self>,
        queue: mpsc::Receiver<Uuid>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let queue = Arc::new(Mutex::new(queue));
        (0..self.config.worker_count)
            .map(|worker| {
                let pool = self.clone();
                let queue = queue.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.worker_loop(worker, queue, cancel).await })
            })
            .collect()
    }

    async fn worker_loop(
        &self,
        worker: usize,
        queue: Arc<Mutex<mpsc::Receiver<Uuid>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let id = {
                let mut queue = queue.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    id = queue.recv() => match id {
                        Some(id) => id,
                        None => return,
                    },
                }
            };

            // Claiming the segment IS the transition; losing the race just
            // means another worker (or a command) already owns it.
            if self
                .store
                .transition(id, SegmentState::Completed, SegmentState::Uploading)
                .is_err()
            {
                continue;
            }

            self.process(worker, id, &cancel).await;
        }
    }

    /// Drive one claimed segment to a terminal outcome (or release it on
    /// shutdown).
    #[instrument(skip_all, fields(worker = worker, segment_id = %id))]
    async fn process(&self, worker: usize, id: Uuid, cancel: &CancellationToken) {
        let Some(segment) = self.store.get(id) else {
            return;
        };
        let Some(file_name) = segment.file_name() else {
            self.store.set_last_error(id, "segment has no file name");
            let _ = self
                .store
                .transition(id, SegmentState::Uploading, SegmentState::Failed);
            return;
        };
        let key = destination_key(&segment.camera_id, segment.created_at, &file_name);

        let mut retry_backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(self.config.retry_backoff_base_seconds),
            max_interval: Duration::from_secs(self.config.retry_backoff_max_seconds),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            let attempt = self.store.begin_upload_attempt(id);

            match self.try_upload(&segment, &key).await {
                Ok(size_bytes) => {
                    self.store.set_remote_key(id, &key);
                    if self
                        .store
                        .transition(id, SegmentState::Uploading, SegmentState::Uploaded)
                        .is_ok()
                    {
                        info!(
                            camera_id = %segment.camera_id,
                            key = %key,
                            size_bytes,
                            attempt,
                            "Segment uploaded and verified"
                        );
                        metrics::counter!("pipeline.uploads.succeeded").increment(1);
                        metrics::counter!("pipeline.uploads.bytes").increment(size_bytes);
                        self.relocate(id, &segment).await;
                    }
                    return;
                }
                Err(e) if e.is_permanent() => {
                    self.store.set_last_error(id, e.to_string());
                    let _ = self
                        .store
                        .transition(id, SegmentState::Uploading, SegmentState::Failed);
                    error!(
                        camera_id = %segment.camera_id,
                        key = %key,
                        error = %e,
                        "Permanent upload failure, not retrying"
                    );
                    metrics::counter!("pipeline.uploads.failed").increment(1);
                    return;
                }
                Err(e) => {
                    self.store.set_last_error(id, e.to_string());
                    warn!(
                        camera_id = %segment.camera_id,
                        key = %key,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        error = %e,
                        "Upload attempt failed"
                    );

                    if attempt >= self.config.max_attempts {
                        let _ = self
                            .store
                            .transition(id, SegmentState::Uploading, SegmentState::Failed);
                        error!(
                            camera_id = %segment.camera_id,
                            key = %key,
                            attempts = attempt,
                            "Upload attempts exhausted, segment failed"
                        );
                        metrics::counter!("pipeline.uploads.failed").increment(1);
                        return;
                    }

                    // Release the claim while waiting out the backoff; on
                    // shutdown the segment stays Completed and is retried
                    // at next startup.
                    let _ = self
                        .store
                        .transition(id, SegmentState::Uploading, SegmentState::Completed);
                    let delay = retry_backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_secs(self.config.retry_backoff_max_seconds));
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if self
                        .store
                        .transition(id, SegmentState::Completed, SegmentState::Uploading)
                        .is_err()
                    {
                        // An operator command re-routed the segment.
                        return;
                    }
                }
            }
        }
    }

    /// Transfer and verify: the remote object must report exactly the
    /// local file's size before the segment may leave `Uploading`.
    async fn try_upload(&self, segment: &Segment, key: &str) -> Result<u64, UploadError> {
        let metadata = tokio::fs::metadata(&segment.file_path).await.map_err(|e| {
            UploadError::Permanent(format!(
                "local file {} unreadable: {e}",
                segment.file_path.display()
            ))
        })?;
        let local_size = metadata.len();

        self.storage.put_file(key, &segment.file_path).await?;

        match self.storage.object_size(key).await? {
            Some(remote) if remote == local_size => Ok(local_size),
            Some(remote) => Err(UploadError::SizeMismatch {
                remote,
                local: local_size,
            }),
            None => Err(UploadError::Transient(format!(
                "object {key} missing after upload"
            ))),
        }
    }

    /// Move the verified file out of the recordings tree so it no longer
    /// costs anything to scan. Failure is non-fatal: the sweeper deletes
    /// by whatever path the store records.
    async fn relocate(&self, id: Uuid, segment: &Segment) {
        let Some(file_name) = segment.file_name() else {
            return;
        };
        let dest_dir = self.uploaded_dir.join(&segment.camera_id);
        if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
            warn!(error = %e, "Could not create uploaded directory");
            return;
        }
        let dest = dest_dir.join(file_name);
        match tokio::fs::rename(&segment.file_path, &dest).await {
            Ok(()) => {
                self.store.set_file_path(id, &dest);
                debug!(
                    from = %segment.file_path.display(),
                    to = %dest.display(),
                    "Uploaded segment moved out of the recordings tree"
                );
            }
            Err(e) => {
                warn!(
                    path = %segment.file_path.display(),
                    error = %e,
                    "Could not move uploaded segment; it will age out in place"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockall::Sequence;
    use tempfile::TempDir;

    const FILE_SIZE: u64 = 8_192;

    struct Fixture {
        store: Arc<SegmentStore>,
        _dir: TempDir,
        uploaded_dir: PathBuf,
        segment_id: Uuid,
        file_path: PathBuf,
    }

    /// A claimed (Uploading) segment backed by a real temp file.
    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let recordings = dir.path().join("recordings").join("cam-1");
        std::fs::create_dir_all(&recordings).unwrap();
        let file_path = recordings.join("cam-1_2026-08-01_14-30-00.mp4");
        let file = std::fs::File::create(&file_path).unwrap();
        file.set_len(FILE_SIZE).unwrap();

        let store = Arc::new(SegmentStore::new());
        let created_at = Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).unwrap();
        let mut segment = Segment::new("cam-1", &file_path, created_at, FILE_SIZE, created_at);
        segment.state = SegmentState::Completed;
        let segment_id = store.register(segment);
        store
            .transition(segment_id, SegmentState::Completed, SegmentState::Uploading)
            .unwrap();

        Fixture {
            store,
            uploaded_dir: dir.path().join("uploaded"),
            _dir: dir,
            segment_id,
            file_path,
        }
    }

    fn fast_upload_config() -> UploadConfig {
        UploadConfig {
            worker_count: 2,
            max_attempts: 5,
            retry_backoff_base_seconds: 0,
            retry_backoff_max_seconds: 0,
            timeout_seconds: 1,
            queue_size: 16,
        }
    }

    fn pool(f: &Fixture, storage: MockObjectStorage) -> UploadWorkerPool {
        UploadWorkerPool::new(
            f.store.clone(),
            Arc::new(storage),
            fast_upload_config(),
            f.uploaded_dir.clone(),
        )
    }

    #[test]
    fn test_destination_key_is_date_partitioned() {
        let created_at = Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).unwrap();
        assert_eq!(
            destination_key("cam-1", created_at, "cam-1_2026-08-01_14-30-00.mp4"),
            "2026/08/01/cam-1/cam-1_2026-08-01_14-30-00.mp4"
        );
    }

    #[test]
    fn test_sanitize_key_component() {
        assert_eq!(sanitize_key_component("cam-1"), "cam-1");
        assert_eq!(sanitize_key_component("cam/../1"), "cam___1");
        assert_eq!(sanitize_key_component("front door"), "front_door");
    }

    #[tokio::test]
    async fn test_upload_succeeds_on_third_attempt() {
        let f = fixture();
        let mut storage = MockObjectStorage::new();
        let mut seq = Sequence::new();
        storage
            .expect_put_file()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(UploadError::Transient("HTTP 500".to_string())));
        storage
            .expect_put_file()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        storage
            .expect_object_size()
            .times(1)
            .returning(|_| Ok(Some(FILE_SIZE)));

        pool(&f, storage)
            .process(0, f.segment_id, &CancellationToken::new())
            .await;

        let segment = f.store.get(f.segment_id).unwrap();
        assert_eq!(segment.state, SegmentState::Uploaded);
        assert_eq!(segment.upload_attempts, 3);
        assert_eq!(
            segment.remote_key.as_deref(),
            Some("2026/08/01/cam-1/cam-1_2026-08-01_14-30-00.mp4")
        );
        // Verified file was moved out of the recordings tree.
        assert!(!f.file_path.exists());
        assert!(f
            .uploaded_dir
            .join("cam-1")
            .join("cam-1_2026-08-01_14-30-00.mp4")
            .exists());
    }

    #[tokio::test]
    async fn test_size_mismatch_counts_as_a_failed_attempt() {
        let f = fixture();
        let mut storage = MockObjectStorage::new();
        let mut seq = Sequence::new();
        storage
            .expect_put_file()
            .times(2)
            .returning(|_, _| Ok(()));
        storage
            .expect_object_size()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(FILE_SIZE / 2)));
        storage
            .expect_object_size()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(FILE_SIZE)));

        pool(&f, storage)
            .process(0, f.segment_id, &CancellationToken::new())
            .await;

        let segment = f.store.get(f.segment_id).unwrap();
        assert_eq!(segment.state, SegmentState::Uploaded);
        assert_eq!(segment.upload_attempts, 2);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_without_retry() {
        let f = fixture();
        let mut storage = MockObjectStorage::new();
        storage
            .expect_put_file()
            .times(1)
            .returning(|_, _| Err(UploadError::Permanent("AccessDenied".to_string())));

        pool(&f, storage)
            .process(0, f.segment_id, &CancellationToken::new())
            .await;

        let segment = f.store.get(f.segment_id).unwrap();
        assert_eq!(segment.state, SegmentState::Failed);
        assert_eq!(segment.upload_attempts, 1);
        assert!(segment.last_error.unwrap().contains("AccessDenied"));
        assert!(f.file_path.exists(), "failed segments are kept for inspection");
    }

    #[tokio::test]
    async fn test_attempts_are_bounded_by_max_attempts() {
        let f = fixture();
        let mut storage = MockObjectStorage::new();
        storage
            .expect_put_file()
            .times(5)
            .returning(|_, _| Err(UploadError::Transient("connection reset".to_string())));

        pool(&f, storage)
            .process(0, f.segment_id, &CancellationToken::new())
            .await;

        let segment = f.store.get(f.segment_id).unwrap();
        assert_eq!(segment.state, SegmentState::Failed);
        assert_eq!(segment.upload_attempts, 5);
    }

    #[tokio::test]
    async fn test_missing_remote_object_after_put_is_transient() {
        let f = fixture();
        let mut storage = MockObjectStorage::new();
        let mut seq = Sequence::new();
        storage.expect_put_file().times(2).returning(|_, _| Ok(()));
        storage
            .expect_object_size()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        storage
            .expect_object_size()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(FILE_SIZE)));

        pool(&f, storage)
            .process(0, f.segment_id, &CancellationToken::new())
            .await;

        assert_eq!(
            f.store.get(f.segment_id).unwrap().state,
            SegmentState::Uploaded
        );
    }

    #[tokio::test]
    async fn test_queue_claims_each_segment_exactly_once() {
        let f = fixture();
        // Put back to Completed so the pool performs the claiming itself.
        f.store
            .transition(f.segment_id, SegmentState::Uploading, SegmentState::Completed)
            .unwrap();

        let mut storage = MockObjectStorage::new();
        storage.expect_put_file().times(1).returning(|_, _| Ok(()));
        storage
            .expect_object_size()
            .times(1)
            .returning(|_| Ok(Some(FILE_SIZE)));

        let pool = Arc::new(pool(&f, storage));
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handles = pool.spawn(rx, cancel.clone());

        // A duplicate enqueue must not produce a second upload.
        tx.send(f.segment_id).await.unwrap();
        tx.send(f.segment_id).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if f.store.get(f.segment_id).unwrap().state == SegmentState::Uploaded {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("segment never reached Uploaded");

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
