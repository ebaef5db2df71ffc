//! Filesystem-backed object storage.
//!
//! Objects live under `root/{bucket}/{shard}/{shard}/{key}`; multipart state
//! lives under `root/.multipart/{upload_id}/` with one file per part and a
//! side-car holding the part's ETag. Writes go to a temporary file that is
//! fsynced and renamed into place, so readers never observe a torn object.

use super::{
    BackendError, BackendResult, ByteRange, CompletedPart, ObjectBackend, ObjectReader, PartInfo,
    RedundancySettings,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MULTIPART_DIR: &str = ".multipart";
const TARGET_FILE: &str = "target";

#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    /// Base directory on disk where buckets are stored.
    root: PathBuf,
    redundancy: Option<RedundancySettings>,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            redundancy: None,
        }
    }

    /// Report a sharding layout so transfers size their parts by slab.
    pub fn with_redundancy(mut self, redundancy: Option<RedundancySettings>) -> Self {
        self.redundancy = redundancy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and multipart directories.
    pub async fn init(&self) -> BackendResult<()> {
        fs::create_dir_all(self.root.join(MULTIPART_DIR)).await?;
        Ok(())
    }

    /// Reject keys that could escape the bucket directory.
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(BackendError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn ensure_bucket_safe(bucket: &str) -> BackendResult<()> {
        if bucket.is_empty()
            || bucket.starts_with('.')
            || bucket.contains('/')
            || bucket.contains('\\')
        {
            return Err(BackendError::Config(format!("invalid bucket name `{}`", bucket)));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    /// Two-level shard from MD5(bucket/key) keeps directories small.
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn upload_dir(&self, upload_id: &str) -> BackendResult<PathBuf> {
        if upload_id.is_empty() || !upload_id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(BackendError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(self.root.join(MULTIPART_DIR).join(upload_id))
    }

    fn part_path(dir: &Path, part_number: i32) -> PathBuf {
        dir.join(format!("{:05}.part", part_number))
    }

    fn etag_path(dir: &Path, part_number: i32) -> PathBuf {
        dir.join(format!("{:05}.etag", part_number))
    }

    async fn ensure_bucket_exists(&self, bucket: &str) -> BackendResult<()> {
        Self::ensure_bucket_safe(bucket)?;
        match fs::metadata(self.bucket_root(bucket)).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(BackendError::NoSuchBucket(bucket.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BackendError::NoSuchBucket(bucket.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Open the upload directory and check it belongs to `bucket`/`key`.
    async fn open_upload(&self, bucket: &str, key: &str, upload_id: &str) -> BackendResult<PathBuf> {
        let dir = self.upload_dir(upload_id)?;
        let target = match fs::read_to_string(dir.join(TARGET_FILE)).await {
            Ok(target) => target,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BackendError::NoSuchUpload(upload_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        if target != format!("{}/{}", bucket, key) {
            return Err(BackendError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(dir)
    }

    /// Write `chunks` to a temporary file beside `dest`, fsync, then rename.
    /// Returns the hex MD5 of the written bytes.
    async fn write_atomic<'a, I>(dest: &Path, chunks: I) -> BackendResult<String>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let parent = dest
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            let mut digest = md5::Context::new();
            for chunk in chunks {
                digest.consume(chunk);
                file.write_all(chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, dest).await?;
            Ok::<_, io::Error>(format!("{:x}", digest.compute()))
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path).await;
        }
        Ok(result?)
    }

    /// Recursively remove empty directories up to bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectBackend for FilesystemBackend {
    async fn create_bucket_if_not_exists(&self, bucket: &str) -> BackendResult<()> {
        Self::ensure_bucket_safe(bucket)?;
        fs::create_dir_all(self.bucket_root(bucket)).await?;
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> BackendResult<String> {
        Self::ensure_key_safe(key)?;
        self.ensure_bucket_exists(bucket).await?;
        let path = self.object_path(bucket, key);
        let etag = Self::write_atomic(&path, [data.as_ref()]).await?;
        debug!(bucket, key, size = data.len(), "stored object");
        Ok(etag)
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> BackendResult<ObjectReader> {
        Self::ensure_key_safe(key)?;
        self.ensure_bucket_exists(bucket).await?;
        let path = self.object_path(bucket, key);
        let mut file = File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::NoSuchKey {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                BackendError::Io(err)
            }
        })?;

        match range {
            None => Ok(Box::pin(file)),
            Some(range) => {
                file.seek(SeekFrom::Start(range.start)).await?;
                match range.end {
                    Some(end) => Ok(Box::pin(file.take(end.saturating_sub(range.start)))),
                    None => Ok(Box::pin(file)),
                }
            }
        }
    }

    async fn head_object(&self, bucket: &str, key: &str) -> BackendResult<Option<u64>> {
        Self::ensure_key_safe(key)?;
        self.ensure_bucket_exists(bucket).await?;
        match fs::metadata(self.object_path(bucket, key)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> BackendResult<()> {
        Self::ensure_bucket_safe(bucket)?;
        let bucket_root = self.bucket_root(bucket);
        for key in keys {
            Self::ensure_key_safe(key)?;
            let path = self.object_path(bucket, key);
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed physical file {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("file {} already missing", path.display());
                }
                Err(err) => return Err(err.into()),
            }
            if let Some(parent) = path.parent() {
                self.prune_empty_dirs(parent, &bucket_root).await;
            }
        }
        Ok(())
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> BackendResult<String> {
        Self::ensure_key_safe(key)?;
        self.ensure_bucket_exists(bucket).await?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;
        let target = format!("{}/{}", bucket, key);
        Self::write_atomic(&dir.join(TARGET_FILE), [target.as_bytes()]).await?;
        debug!(bucket, key, upload_id, "created multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> BackendResult<CompletedPart> {
        if !(1..=10_000).contains(&part_number) {
            return Err(BackendError::InvalidPart(format!(
                "part number {} out of range",
                part_number
            )));
        }
        let dir = self.open_upload(bucket, key, upload_id).await?;
        let etag = Self::write_atomic(&Self::part_path(&dir, part_number), [data.as_ref()]).await?;
        Self::write_atomic(&Self::etag_path(&dir, part_number), [etag.as_bytes()]).await?;
        Ok(CompletedPart { part_number, etag })
    }

    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<Vec<PartInfo>> {
        let dir = self.open_upload(bucket, key, upload_id).await?;
        let mut entries = fs::read_dir(&dir).await?;
        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(number) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".part"))
                .and_then(|n| n.parse::<i32>().ok())
            else {
                continue;
            };
            let size = entry.metadata().await?.len();
            let etag = match fs::read_to_string(Self::etag_path(&dir, number)).await {
                Ok(etag) => etag,
                // part file landed but its etag did not: not committed
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            parts.push(PartInfo {
                part_number: number,
                size,
                etag,
            });
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        let dir = self.open_upload(bucket, key, upload_id).await?;
        if parts.is_empty() {
            return Err(BackendError::InvalidPart("no parts to complete".into()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(BackendError::InvalidPart(
                "parts must be listed in ascending order".into(),
            ));
        }

        let mut payloads = Vec::with_capacity(parts.len());
        for part in parts {
            let stored_etag = fs::read_to_string(Self::etag_path(&dir, part.part_number))
                .await
                .map_err(|_| {
                    BackendError::InvalidPart(format!("part {} was never uploaded", part.part_number))
                })?;
            if stored_etag != part.etag {
                return Err(BackendError::InvalidPart(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            payloads.push(fs::read(Self::part_path(&dir, part.part_number)).await?);
        }

        let path = self.object_path(bucket, key);
        Self::write_atomic(&path, payloads.iter().map(Vec::as_slice)).await?;
        fs::remove_dir_all(&dir).await?;
        debug!(bucket, key, upload_id, parts = parts.len(), "completed multipart upload");
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> BackendResult<()> {
        let dir = self.open_upload(bucket, key, upload_id).await?;
        fs::remove_dir_all(&dir).await?;
        debug!(bucket, key, upload_id, "aborted multipart upload");
        Ok(())
    }

    fn redundancy(&self) -> Option<RedundancySettings> {
        self.redundancy
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    /// Write, read back and remove a marker file under the root.
    async fn health_check(&self) -> BackendResult<()> {
        let marker = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&marker, b"readyz").await?;
        let read = fs::read(&marker).await;
        let _ = fs::remove_file(&marker).await;
        if read? != b"readyz" {
            return Err(io::Error::other("file content mismatch").into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn backend() -> (tempfile::TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());
        backend.init().await.unwrap();
        backend.create_bucket_if_not_exists("bucket").await.unwrap();
        (dir, backend)
    }

    async fn read_all(mut reader: ObjectReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn put_get_range_and_delete() {
        let (_dir, backend) = backend().await;
        let etag = backend
            .put_object("bucket", "a/b.bin", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(etag, format!("{:x}", md5::compute(b"0123456789")));

        let all = backend.get_object("bucket", "a/b.bin", None).await.unwrap();
        assert_eq!(read_all(all).await, b"0123456789");
        let mid = backend
            .get_object("bucket", "a/b.bin", Some(ByteRange::bounded(2, 5)))
            .await
            .unwrap();
        assert_eq!(read_all(mid).await, b"234");
        let tail = backend
            .get_object("bucket", "a/b.bin", Some(ByteRange::from(7)))
            .await
            .unwrap();
        assert_eq!(read_all(tail).await, b"789");

        assert_eq!(backend.head_object("bucket", "a/b.bin").await.unwrap(), Some(10));
        let keys = vec!["a/b.bin".to_string(), "missing".to_string()];
        backend.delete_objects("bucket", &keys).await.unwrap();
        backend.delete_objects("bucket", &keys).await.unwrap();
        assert_eq!(backend.head_object("bucket", "a/b.bin").await.unwrap(), None);
        assert!(matches!(
            backend.get_object("bucket", "a/b.bin", None).await,
            Err(BackendError::NoSuchKey { .. })
        ));
    }

    #[tokio::test]
    async fn rejects_unsafe_keys_and_unknown_buckets() {
        let (_dir, backend) = backend().await;
        assert!(matches!(
            backend.put_object("bucket", "../escape", Bytes::new()).await,
            Err(BackendError::InvalidKey(_))
        ));
        assert!(matches!(
            backend.put_object("nope", "key", Bytes::new()).await,
            Err(BackendError::NoSuchBucket(_))
        ));
    }

    #[tokio::test]
    async fn multipart_lists_and_assembles_parts_in_order() {
        let (_dir, backend) = backend().await;
        let id = backend.create_multipart_upload("bucket", "obj").await.unwrap();
        let p2 = backend
            .upload_part("bucket", "obj", &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let p1 = backend
            .upload_part("bucket", "obj", &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        let listed = backend.list_parts("bucket", "obj", &id).await.unwrap();
        assert_eq!(listed.iter().map(|p| p.part_number).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(listed[0].size, 6);

        let err = backend
            .complete_multipart_upload("bucket", "obj", &id, &[p2.clone(), p1.clone()])
            .await;
        assert!(matches!(err, Err(BackendError::InvalidPart(_))));

        backend
            .complete_multipart_upload("bucket", "obj", &id, &[p1, p2])
            .await
            .unwrap();
        let reader = backend.get_object("bucket", "obj", None).await.unwrap();
        assert_eq!(read_all(reader).await, b"hello world");
        assert!(matches!(
            backend.list_parts("bucket", "obj", &id).await,
            Err(BackendError::NoSuchUpload(_))
        ));
    }

    #[tokio::test]
    async fn abort_discards_parts_and_checks_target() {
        let (_dir, backend) = backend().await;
        let id = backend.create_multipart_upload("bucket", "obj").await.unwrap();
        backend
            .upload_part("bucket", "obj", &id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(matches!(
            backend.abort_multipart_upload("bucket", "other", &id).await,
            Err(BackendError::NoSuchUpload(_))
        ));
        backend.abort_multipart_upload("bucket", "obj", &id).await.unwrap();
        assert!(matches!(
            backend.abort_multipart_upload("bucket", "obj", &id).await,
            Err(BackendError::NoSuchUpload(_))
        ));
        backend.health_check().await.unwrap();
    }
}
