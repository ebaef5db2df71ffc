mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::InstrumentedBackend;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use upload_portal::{
    backends::{BackendError, ObjectBackend, ObjectReader},
    config::TransferSettings,
    services::{
        partial_uploads::PartialUploads,
        transfer::{BackendRangeReader, MultipartTransfer, RangeReaderFactory, TransferError},
    },
};

const PART: u64 = 8;

fn settings() -> TransferSettings {
    TransferSettings {
        min_part_size: PART,
        max_parts: 10_000,
    }
}

fn payload() -> Vec<u8> {
    // five parts of eight bytes
    (0u8..40).collect()
}

async fn source(dir: &TempDir) -> Arc<dyn ObjectBackend> {
    let backend = common::fs_backend(dir, "source").await;
    backend.create_bucket_if_not_exists("buffer").await.unwrap();
    backend
        .put_object("buffer", "session", Bytes::from(payload()))
        .await
        .unwrap();
    backend
}

async fn destination(dir: &TempDir) -> Arc<dyn ObjectBackend> {
    let backend = common::fs_backend(dir, "durable").await;
    backend.create_bucket_if_not_exists("s5").await.unwrap();
    backend
}

#[tokio::test]
async fn interrupted_transfer_resumes_at_first_missing_part() {
    let dir = TempDir::new().unwrap();
    let db = common::test_db(&dir).await;
    let partials = PartialUploads::new(db);
    let source = source(&dir).await;
    let durable = destination(&dir).await;

    let crashing = Arc::new(InstrumentedBackend::new(durable.clone()).hang_after(2));
    let run = {
        let transfer = MultipartTransfer::new(crashing.clone(), partials.clone(), settings());
        let source = source.clone();
        tokio::spawn(async move {
            let reader = BackendRangeReader::new(source, "buffer", "session");
            transfer.transfer(&reader, "s5", "object", 40).await
        })
    };
    let stalled = common::wait_for(Duration::from_secs(3), || {
        let crashing = crashing.clone();
        async move { crashing.parts() == 2 }
    })
    .await;
    assert!(stalled);
    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());
    assert!(partials.find("s5", "object").await.unwrap().is_some());

    let resumed = Arc::new(InstrumentedBackend::new(durable.clone()));
    let transfer = MultipartTransfer::new(resumed.clone(), partials.clone(), settings());
    let reader = BackendRangeReader::new(source, "buffer", "session");
    transfer.transfer(&reader, "s5", "object", 40).await.unwrap();

    assert_eq!(resumed.parts(), 3);
    assert_eq!(common::read_object(durable.as_ref(), "s5", "object").await, payload());
    assert!(partials.find("s5", "object").await.unwrap().is_none());
}

#[tokio::test]
async fn failed_transfer_keeps_record_when_abort_fails() {
    let dir = TempDir::new().unwrap();
    let db = common::test_db(&dir).await;
    let partials = PartialUploads::new(db);
    let source = source(&dir).await;
    let durable = destination(&dir).await;

    let failing = Arc::new(
        InstrumentedBackend::new(durable.clone())
            .fail_after(1)
            .refuse_abort(),
    );
    let transfer = MultipartTransfer::new(failing.clone(), partials.clone(), settings());
    let reader = BackendRangeReader::new(source.clone(), "buffer", "session");
    let err = transfer.transfer(&reader, "s5", "object", 40).await.unwrap_err();
    assert!(matches!(err, TransferError::Part { part_number: 2, .. }));
    assert!(partials.find("s5", "object").await.unwrap().is_some());
    assert!(durable.head_object("s5", "object").await.unwrap().is_none());

    // a healthy retry picks up the surviving part
    let healthy = Arc::new(InstrumentedBackend::new(durable.clone()));
    let transfer = MultipartTransfer::new(healthy.clone(), partials.clone(), settings());
    transfer.transfer(&reader, "s5", "object", 40).await.unwrap();
    assert_eq!(healthy.parts(), 4);
    assert_eq!(common::read_object(durable.as_ref(), "s5", "object").await, payload());
}

#[tokio::test]
async fn failed_transfer_with_successful_abort_starts_over() {
    let dir = TempDir::new().unwrap();
    let db = common::test_db(&dir).await;
    let partials = PartialUploads::new(db);
    let source = source(&dir).await;
    let durable = destination(&dir).await;

    let failing = Arc::new(InstrumentedBackend::new(durable.clone()).fail_after(3));
    let transfer = MultipartTransfer::new(failing, partials.clone(), settings());
    let reader = BackendRangeReader::new(source, "buffer", "session");
    assert!(transfer.transfer(&reader, "s5", "object", 40).await.is_err());
    assert!(partials.find("s5", "object").await.unwrap().is_none());

    let healthy = Arc::new(InstrumentedBackend::new(durable.clone()));
    let transfer = MultipartTransfer::new(healthy.clone(), partials, settings());
    transfer.transfer(&reader, "s5", "object", 40).await.unwrap();
    assert_eq!(healthy.parts(), 5);
}

/// Refuses ranges starting at or past the end, as S3 does with 416.
struct BoundedRangeReader {
    inner: BackendRangeReader,
    size: u64,
}

#[async_trait]
impl RangeReaderFactory for BoundedRangeReader {
    async fn open(&self, start: u64) -> Result<ObjectReader, BackendError> {
        if start >= self.size {
            return Err(BackendError::Config(format!(
                "range start {start} not satisfiable for {} bytes",
                self.size
            )));
        }
        self.inner.open(start).await
    }
}

#[tokio::test]
async fn fully_committed_upload_completes_without_reading_source() {
    let dir = TempDir::new().unwrap();
    let db = common::test_db(&dir).await;
    let partials = PartialUploads::new(db);
    let source = source(&dir).await;
    let durable = destination(&dir).await;

    let upload_id = durable.create_multipart_upload("s5", "object").await.unwrap();
    partials.save("s5", "object", &upload_id).await.unwrap();
    for (index, chunk) in payload().chunks(PART as usize).enumerate() {
        durable
            .upload_part("s5", "object", &upload_id, index as i32 + 1, Bytes::copy_from_slice(chunk))
            .await
            .unwrap();
    }

    let counting = Arc::new(InstrumentedBackend::new(durable.clone()));
    let transfer = MultipartTransfer::new(counting.clone(), partials.clone(), settings());
    let reader = BoundedRangeReader {
        inner: BackendRangeReader::new(source, "buffer", "session"),
        size: 40,
    };
    transfer.transfer(&reader, "s5", "object", 40).await.unwrap();

    assert_eq!(counting.parts(), 0);
    assert_eq!(common::read_object(durable.as_ref(), "s5", "object").await, payload());
    assert!(partials.find("s5", "object").await.unwrap().is_none());
}
