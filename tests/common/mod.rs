#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::SqlitePool;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use upload_portal::{
    backends::{
        BackendError, BackendResult, ByteRange, CompletedPart, ObjectBackend, ObjectReader,
        PartInfo, RedundancySettings, filesystem::FilesystemBackend,
    },
    config::{AppConfig, BackendConfig, LockSettings, PipelineSettings, SchedulerSettings, TransferSettings, UploadSettings},
    db,
};

pub async fn test_db(dir: &TempDir) -> SqlitePool {
    let url = format!("sqlite://{}", dir.path().join("portal.db").display());
    let pool = db::connect(&url, 4).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub async fn fs_backend(dir: &TempDir, name: &str) -> Arc<FilesystemBackend> {
    let backend = FilesystemBackend::new(dir.path().join(name));
    backend.init().await.unwrap();
    Arc::new(backend)
}

/// Small parts and fast polling so tests exercise every code path quickly.
pub fn test_config(dir: &TempDir) -> AppConfig {
    AppConfig {
        database_url: format!("sqlite://{}", dir.path().join("portal.db").display()),
        buffer: BackendConfig::Filesystem {
            root: dir.path().join("buffer"),
            min_shards: None,
        },
        durable: BackendConfig::Filesystem {
            root: dir.path().join("durable"),
            min_shards: None,
        },
        upload: UploadSettings {
            buffer_part_size: 8,
            event_workers: 2,
            ..UploadSettings::default()
        },
        lock: LockSettings {
            acquirer_poll_interval: Duration::from_millis(20),
            holder_poll_interval: Duration::from_millis(20),
            acquire_timeout: Duration::from_millis(200),
            ..LockSettings::default()
        },
        scheduler: SchedulerSettings {
            poll_interval: Duration::from_millis(50),
            ..SchedulerSettings::default()
        },
        transfer: TransferSettings {
            min_part_size: 8,
            max_parts: 10_000,
        },
        pipeline: PipelineSettings {
            multipart_threshold: 16,
            store_retry_base: Duration::from_millis(20),
            ..PipelineSettings::default()
        },
        ..AppConfig::default()
    }
}

pub async fn read_object(backend: &dyn ObjectBackend, bucket: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::new();
    backend
        .get_object(bucket, key, None)
        .await
        .unwrap()
        .read_to_end(&mut out)
        .await
        .unwrap();
    out
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

/// Wraps a backend to count part uploads and inject failures.
pub struct InstrumentedBackend {
    inner: Arc<dyn ObjectBackend>,
    uploaded_parts: AtomicUsize,
    part_calls: AtomicUsize,
    /// Parts beyond this count never finish, like a process that died mid-call.
    hang_after: Option<usize>,
    /// Parts beyond this count fail.
    fail_after: Option<usize>,
    refuse_abort: bool,
}

impl InstrumentedBackend {
    pub fn new(inner: Arc<dyn ObjectBackend>) -> Self {
        Self {
            inner,
            uploaded_parts: AtomicUsize::new(0),
            part_calls: AtomicUsize::new(0),
            hang_after: None,
            fail_after: None,
            refuse_abort: false,
        }
    }

    pub fn hang_after(mut self, parts: usize) -> Self {
        self.hang_after = Some(parts);
        self
    }

    pub fn fail_after(mut self, parts: usize) -> Self {
        self.fail_after = Some(parts);
        self
    }

    pub fn refuse_abort(mut self) -> Self {
        self.refuse_abort = true;
        self
    }

    pub fn parts(&self) -> usize {
        self.uploaded_parts.load(Ordering::SeqCst)
    }

    /// Part uploads attempted, failed ones included.
    pub fn part_calls(&self) -> usize {
        self.part_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectBackend for InstrumentedBackend {
    async fn create_bucket_if_not_exists(&self, bucket: &str) -> BackendResult<()> {
        self.inner.create_bucket_if_not_exists(bucket).await
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BackendResult<String> {
        self.inner.put_object(bucket, key, data).await
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> BackendResult<ObjectReader> {
        self.inner.get_object(bucket, key, range).await
    }

    async fn head_object(&self, bucket: &str, key: &str) -> BackendResult<Option<u64>> {
        self.inner.head_object(bucket, key).await
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> BackendResult<()> {
        self.inner.delete_objects(bucket, keys).await
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> BackendResult<String> {
        self.inner.create_multipart_upload(bucket, key).await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> BackendResult<CompletedPart> {
        self.part_calls.fetch_add(1, Ordering::SeqCst);
        let done = self.parts();
        if self.hang_after.is_some_and(|limit| done >= limit) {
            std::future::pending::<()>().await;
        }
        if self.fail_after.is_some_and(|limit| done >= limit) {
            return Err(BackendError::InvalidPart(format!("injected failure on part {part_number}")));
        }
        let part = self
            .inner
            .upload_part(bucket, key, upload_id, part_number, data)
            .await?;
        self.uploaded_parts.fetch_add(1, Ordering::SeqCst);
        Ok(part)
    }

    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<Vec<PartInfo>> {
        self.inner.list_parts(bucket, key, upload_id).await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        self.inner
            .complete_multipart_upload(bucket, key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<()> {
        if self.refuse_abort {
            return Err(BackendError::Config("abort refused".into()));
        }
        self.inner.abort_multipart_upload(bucket, key, upload_id).await
    }

    fn redundancy(&self) -> Option<RedundancySettings> {
        self.inner.redundancy()
    }

    fn backend_name(&self) -> &'static str {
        "instrumented"
    }
}
