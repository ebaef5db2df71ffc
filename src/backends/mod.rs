//! Object storage backends speaking the S3-compatible subset the upload
//! pipeline needs: single puts, ranged reads, batch deletes and resumable
//! multipart uploads.
//!
//! Two implementations exist: [`filesystem::FilesystemBackend`] keeps
//! objects in a sharded directory tree, [`s3::S3Backend`] talks to any
//! S3-compatible service through the AWS SDK. Both the upload buffer and the
//! durable object store are instances of this trait.

pub mod filesystem;
pub mod s3;

use crate::config::BackendConfig;
use async_trait::async_trait;
use bytes::Bytes;
use std::{io, pin::Pin, sync::Arc};
use thiserror::Error;
use tokio::io::AsyncRead;

/// Size of one storage sector on sharded backends (4 MiB).
pub const SECTOR_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("bucket `{0}` not found")]
    NoSuchBucket(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NoSuchKey { bucket: String, key: String },
    #[error("multipart upload `{0}` not found")]
    NoSuchUpload(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("invalid part: {0}")]
    InvalidPart(String),
    #[error("backend misconfigured: {0}")]
    Config(String),
    #[error("s3 error: {0}")]
    S3(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackendError::NoSuchBucket(_)
                | BackendError::NoSuchKey { .. }
                | BackendError::NoSuchUpload(_)
        )
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Streaming body returned by [`ObjectBackend::get_object`].
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Half-open byte range `[start, end)`; `end = None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn bounded(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }
}

/// A part already committed to a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub part_number: i32,
    pub size: u64,
    pub etag: String,
}

/// Part reference passed to `complete_multipart_upload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

impl From<PartInfo> for CompletedPart {
    fn from(part: PartInfo) -> Self {
        Self {
            part_number: part.part_number,
            etag: part.etag,
        }
    }
}

/// Erasure-coding layout of a backend that shards objects across hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedundancySettings {
    pub min_shards: u32,
}

impl RedundancySettings {
    /// One slab: `min_shards` sectors.
    pub fn part_size(&self) -> u64 {
        u64::from(self.min_shards.max(1)) * SECTOR_SIZE
    }
}

/// S3-compatible object storage.
///
/// Implementations must be cheap to share (`Arc<dyn ObjectBackend>`) and safe
/// to call concurrently. Deletes are idempotent: removing a missing object is
/// not an error.
#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    async fn create_bucket_if_not_exists(&self, bucket: &str) -> BackendResult<()>;

    /// Store `data` under `key`, replacing any existing object. Returns the ETag.
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BackendResult<String>;

    /// Stream an object, optionally restricted to `range`.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> BackendResult<ObjectReader>;

    /// Size of the object, or `None` if it does not exist.
    async fn head_object(&self, bucket: &str, key: &str) -> BackendResult<Option<u64>>;

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> BackendResult<()>;

    /// Start a multipart upload and return its upload id.
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> BackendResult<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> BackendResult<CompletedPart>;

    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<Vec<PartInfo>>;

    /// Assemble the object from `parts`, which must be in ascending part order.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<()>;

    /// Sharding layout, if this backend erasure-codes objects.
    fn redundancy(&self) -> Option<RedundancySettings> {
        None
    }

    fn backend_name(&self) -> &'static str;

    /// Cheap connectivity check used by readiness checks.
    async fn health_check(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Build a backend from its configuration section.
pub async fn from_config(config: &BackendConfig) -> BackendResult<Arc<dyn ObjectBackend>> {
    match config {
        BackendConfig::Filesystem { root, min_shards } => {
            let backend = filesystem::FilesystemBackend::new(root.clone())
                .with_redundancy(min_shards.map(|min_shards| RedundancySettings { min_shards }));
            backend.init().await?;
            Ok(Arc::new(backend))
        }
        BackendConfig::S3(s3_config) => Ok(Arc::new(s3::S3Backend::new(s3_config).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_size_scales_with_min_shards() {
        assert_eq!(RedundancySettings { min_shards: 10 }.part_size(), 40 * 1024 * 1024);
        assert_eq!(RedundancySettings { min_shards: 0 }.part_size(), SECTOR_SIZE);
    }
}
