//! Resumable multipart transfer of a byte source into an object backend.
//!
//! Progress lives in two places: the backend's committed parts and a
//! [`PartialMultipartUpload`](crate::models::multipart::PartialMultipartUpload)
//! row naming the upload id. A transfer interrupted by a crash is resumed by
//! listing the committed parts and continuing at the first missing one.

use crate::{
    backends::{BackendError, ByteRange, CompletedPart, ObjectBackend, ObjectReader, PartInfo},
    config::TransferSettings,
    services::partial_uploads::PartialUploads,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("opening source at offset {offset}: {source}")]
    Source {
        offset: u64,
        #[source]
        source: BackendError,
    },
    #[error("reading part {part_number}: {source}")]
    Read {
        part_number: i32,
        #[source]
        source: std::io::Error,
    },
    #[error("source ended early in part {part_number}: expected {expected} bytes, got {actual}")]
    ShortRead {
        part_number: i32,
        expected: u64,
        actual: u64,
    },
    #[error("uploading part {part_number}: {source}")]
    Part {
        part_number: i32,
        #[source]
        source: BackendError,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Produces a reader positioned at an arbitrary offset of the source.
#[async_trait]
pub trait RangeReaderFactory: Send + Sync {
    async fn open(&self, start: u64) -> Result<ObjectReader, BackendError>;
}

/// Reads an object stored in a backend.
pub struct BackendRangeReader {
    backend: Arc<dyn ObjectBackend>,
    bucket: String,
    key: String,
}

impl BackendRangeReader {
    pub fn new(backend: Arc<dyn ObjectBackend>, bucket: &str, key: &str) -> Self {
        Self {
            backend,
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl RangeReaderFactory for BackendRangeReader {
    async fn open(&self, start: u64) -> Result<ObjectReader, BackendError> {
        self.backend
            .get_object(&self.bucket, &self.key, Some(ByteRange::from(start)))
            .await
    }
}

#[derive(Clone)]
pub struct MultipartTransfer {
    backend: Arc<dyn ObjectBackend>,
    partials: PartialUploads,
    settings: TransferSettings,
}

impl MultipartTransfer {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        partials: PartialUploads,
        settings: TransferSettings,
    ) -> Self {
        Self {
            backend,
            partials,
            settings,
        }
    }

    /// Part size for an object of `total_size` bytes: one slab when the
    /// backend shards objects, the configured minimum otherwise, enlarged
    /// until the part count fits the backend limit.
    pub fn part_size(&self, total_size: u64) -> u64 {
        let base = self
            .backend
            .redundancy()
            .map(|r| r.part_size())
            .unwrap_or(self.settings.min_part_size)
            .max(1);
        let max_parts = self.settings.max_parts.max(1);
        if total_size.div_ceil(base) > max_parts {
            total_size.div_ceil(max_parts)
        } else {
            base
        }
    }

    /// Move `total_size` bytes from `source` into `bucket/key`, resuming a
    /// previous attempt when one is on record.
    pub async fn transfer(
        &self,
        source: &dyn RangeReaderFactory,
        bucket: &str,
        key: &str,
        total_size: u64,
    ) -> Result<(), TransferError> {
        if total_size == 0 {
            self.backend.put_object(bucket, key, Bytes::new()).await?;
            return Ok(());
        }

        let part_size = self.part_size(total_size);
        let total_parts = total_size.div_ceil(part_size);

        let (upload_id, mut completed) = match self.resume(bucket, key, part_size, total_parts).await? {
            Some(resumed) => resumed,
            None => {
                let upload_id = self.backend.create_multipart_upload(bucket, key).await?;
                self.partials.save(bucket, key, &upload_id).await?;
                (upload_id, Vec::new())
            }
        };

        let start = completed.len() as u64;
        if start > 0 {
            info!(bucket, key, resumed_parts = start, total_parts, "resuming multipart transfer");
        }

        let result = self
            .upload_parts(source, bucket, key, &upload_id, start, part_size, total_size, &mut completed)
            .await;
        if let Err(err) = result {
            self.abort(bucket, key, &upload_id).await;
            return Err(err);
        }

        completed.sort_by_key(|p| p.part_number);
        self.backend
            .complete_multipart_upload(bucket, key, &upload_id, &completed)
            .await?;
        self.partials.delete(bucket, key).await?;
        debug!(bucket, key, parts = completed.len(), "multipart transfer complete");
        Ok(())
    }

    /// Accept the committed prefix of a recorded upload, or discard the record.
    async fn resume(
        &self,
        bucket: &str,
        key: &str,
        part_size: u64,
        total_parts: u64,
    ) -> Result<Option<(String, Vec<CompletedPart>)>, TransferError> {
        let Some(record) = self.partials.find(bucket, key).await? else {
            return Ok(None);
        };

        let listed = match self.backend.list_parts(bucket, key, &record.upload_id).await {
            Ok(parts) => parts,
            Err(err) => {
                warn!(bucket, key, upload_id = %record.upload_id, error = %err,
                    "cannot list parts of recorded upload; starting fresh");
                self.discard(bucket, key, &record.upload_id).await?;
                return Ok(None);
            }
        };

        match accepted_prefix(listed, part_size, total_parts) {
            Some(parts) => Ok(Some((record.upload_id, parts))),
            None => {
                warn!(bucket, key, upload_id = %record.upload_id,
                    "recorded upload is inconsistent with the current layout; starting fresh");
                self.discard(bucket, key, &record.upload_id).await?;
                Ok(None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &self,
        source: &dyn RangeReaderFactory,
        bucket: &str,
        key: &str,
        upload_id: &str,
        start: u64,
        part_size: u64,
        total_size: u64,
        completed: &mut Vec<CompletedPart>,
    ) -> Result<(), TransferError> {
        let total_parts = total_size.div_ceil(part_size);
        if start >= total_parts {
            // Every part is committed; the source has nothing left to read.
            return Ok(());
        }
        let offset = start * part_size;
        let mut reader = source
            .open(offset)
            .await
            .map_err(|source| TransferError::Source { offset, source })?;

        let started = Instant::now();
        for index in start..total_parts {
            let part_number = (index + 1) as i32;
            let len = part_size.min(total_size - index * part_size);
            let mut buf = Vec::with_capacity(len as usize);
            (&mut reader)
                .take(len)
                .read_to_end(&mut buf)
                .await
                .map_err(|source| TransferError::Read { part_number, source })?;
            if (buf.len() as u64) < len {
                return Err(TransferError::ShortRead {
                    part_number,
                    expected: len,
                    actual: buf.len() as u64,
                });
            }

            let part = self
                .backend
                .upload_part(bucket, key, upload_id, part_number, Bytes::from(buf))
                .await
                .map_err(|source| TransferError::Part { part_number, source })?;
            completed.push(part);

            let done = index + 1 - start;
            let remaining = total_parts - index - 1;
            let eta = started.elapsed().mul_f64(remaining as f64 / done as f64);
            debug!(bucket, key, part_number, total_parts, eta_secs = eta.as_secs(), "uploaded part");
        }
        Ok(())
    }

    /// Abort a failed upload. The record goes only if the abort succeeded,
    /// so a failed abort can still be found and cleaned up later.
    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) {
        match self.backend.abort_multipart_upload(bucket, key, upload_id).await {
            Ok(()) => {
                if let Err(err) = self.partials.delete(bucket, key).await {
                    warn!(bucket, key, error = %err, "failed to delete multipart record");
                }
            }
            Err(err) => {
                warn!(bucket, key, upload_id, error = %err, "failed to abort multipart upload");
            }
        }
    }

    async fn discard(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), TransferError> {
        if let Err(err) = self.backend.abort_multipart_upload(bucket, key, upload_id).await {
            if !err.is_not_found() {
                warn!(bucket, key, upload_id, error = %err, "failed to abort stale multipart upload");
            }
        }
        self.partials.delete(bucket, key).await?;
        Ok(())
    }
}

/// Committed parts usable for resuming: the contiguous run from part 1 whose
/// sizes equal `part_size`. `None` when the listing cannot belong to an
/// upload of this layout.
fn accepted_prefix(
    mut listed: Vec<PartInfo>,
    part_size: u64,
    total_parts: u64,
) -> Option<Vec<CompletedPart>> {
    listed.sort_by_key(|p| p.part_number);
    if listed
        .iter()
        .any(|p| p.part_number < 1 || p.part_number as u64 > total_parts || p.size > part_size)
    {
        return None;
    }

    Some(
        listed
            .into_iter()
            .enumerate()
            .take_while(|(i, p)| p.part_number as usize == i + 1 && p.size == part_size)
            .map(|(_, p)| p.into())
            .collect(),
    )
}
