//! Temporary storage of chunked-upload sessions.
//!
//! Each session owns three keys in the buffer bucket: `<id>` (the assembled
//! object, written through a multipart upload while bytes arrive),
//! `<id>.info` (the [`SessionInfo`] side-car) and `<id>.part` (the received
//! tail that does not yet fill a whole part). The recorded offset only moves
//! after the bytes it covers are durable.

use crate::{
    backends::{BackendError, ByteRange, ObjectBackend, ObjectReader},
    models::session::SessionInfo,
    services::partial_uploads::PartialUploads,
};
use bytes::Bytes;
use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INFO_SUFFIX: &str = ".info";
const PART_SUFFIX: &str = ".part";
const READ_CHUNK: usize = 64 * 1024;
const MAX_PARTS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("upload session {0} not found")]
    NotFound(String),
    #[error("upload session {0} is not complete")]
    Incomplete(String),
    #[error("upload session {0} has no buffer upload in progress")]
    MissingMultipart(String),
    #[error("offset mismatch: session is at {expected}, request starts at {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },
    #[error("upload exceeds its declared size of {size} bytes")]
    TooLarge { size: u64 },
    #[error("reading request body at offset {offset}: {source}")]
    Body {
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt session info: {0}")]
    Info(#[from] serde_json::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Result of one write call.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub info: SessionInfo,
    /// Bytes accepted from this call.
    pub written: u64,
    /// The write stopped early because its cancellation token fired.
    pub interrupted: bool,
}

#[derive(Clone)]
pub struct UploadBuffer {
    backend: Arc<dyn ObjectBackend>,
    bucket: String,
    partials: PartialUploads,
    part_size: u64,
}

impl UploadBuffer {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        bucket: &str,
        partials: PartialUploads,
        part_size: u64,
    ) -> Self {
        Self {
            backend,
            bucket: bucket.to_string(),
            partials,
            part_size: part_size.max(1),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn backend(&self) -> Arc<dyn ObjectBackend> {
        self.backend.clone()
    }

    /// Open a session for `size` bytes.
    pub async fn create(
        &self,
        size: u64,
        metadata: HashMap<String, String>,
    ) -> Result<SessionInfo, BufferError> {
        let id = Uuid::new_v4().simple().to_string();
        let part_size = self
            .backend
            .redundancy()
            .map(|r| r.part_size())
            .unwrap_or(0)
            .max(self.part_size)
            .max(size.div_ceil(MAX_PARTS));

        let mut info = SessionInfo {
            id: id.clone(),
            size,
            offset: 0,
            metadata,
            multipart_id: None,
            part_size,
            completed: false,
            created_at: Utc::now(),
        };

        if size == 0 {
            self.backend.put_object(&self.bucket, &id, Bytes::new()).await?;
            info.completed = true;
        } else {
            let upload_id = self.backend.create_multipart_upload(&self.bucket, &id).await?;
            self.partials.save(&self.bucket, &id, &upload_id).await?;
            info.multipart_id = Some(upload_id);
        }
        self.save_info(&info).await?;
        debug!(session = %id, size, part_size, "created upload session");
        Ok(info)
    }

    /// Current session state, reconciled against the stored tail.
    pub async fn get_info(&self, id: &str) -> Result<SessionInfo, BufferError> {
        let mut info = self.load_info(id).await?;
        if info.completed || info.offset == info.size {
            return Ok(info);
        }

        let expected_tail = info.offset % info.part_size;
        let actual_tail = self.backend.head_object(&self.bucket, &part_key(id)).await?.unwrap_or(0);
        if actual_tail != expected_tail {
            let aligned = info.offset - expected_tail;
            warn!(session = id, offset = info.offset, expected_tail, actual_tail,
                rolled_back_to = aligned, "buffered tail out of sync; rolling back offset");
            self.backend.delete_objects(&self.bucket, &[part_key(id)]).await?;
            info.offset = aligned;
            self.save_info(&info).await?;
        }
        Ok(info)
    }

    /// Append the bytes of `body` at `offset`. Whole parts are committed as
    /// they fill; the remainder is kept as the session tail. Reaching the
    /// declared size assembles the object.
    pub async fn write_chunk<R>(
        &self,
        id: &str,
        offset: u64,
        mut body: R,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome, BufferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut info = self.get_info(id).await?;
        if offset != info.offset {
            return Err(BufferError::OffsetMismatch {
                expected: info.offset,
                actual: offset,
            });
        }
        if !info.completed && info.offset == info.size {
            self.finish(&mut info).await?;
        }

        let tail_len = info.offset % info.part_size;
        let mut base = info.offset - tail_len;
        let mut pending = if tail_len > 0 {
            self.read_tail(id, tail_len).await?
        } else {
            Vec::new()
        };

        let mut buf = vec![0u8; READ_CHUNK];
        let mut written = 0u64;
        let mut interrupted = false;
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                read = body.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(source) => {
                    let at = base + pending.len() as u64;
                    self.persist_tail(&mut info, base, &pending).await?;
                    return Err(BufferError::Body { offset: at, source });
                }
            };
            if base + (pending.len() + n) as u64 > info.size {
                return Err(BufferError::TooLarge { size: info.size });
            }
            pending.extend_from_slice(&buf[..n]);
            written += n as u64;

            while pending.len() as u64 >= info.part_size {
                let rest = pending.split_off(info.part_size as usize);
                let part = std::mem::replace(&mut pending, rest);
                self.commit_part(&mut info, base, Bytes::from(part)).await?;
                base += info.part_size;
            }
        }

        if base + pending.len() as u64 == info.size && !info.completed {
            if !pending.is_empty() {
                let len = pending.len() as u64;
                self.commit_part(&mut info, base, Bytes::from(std::mem::take(&mut pending)))
                    .await?;
                base += len;
            }
            info.offset = base;
            self.finish(&mut info).await?;
        } else if written > 0 {
            self.persist_tail(&mut info, base, &pending).await?;
        }

        Ok(WriteOutcome {
            info,
            written,
            interrupted,
        })
    }

    /// Read the assembled object starting at `start`.
    pub async fn open_reader(&self, id: &str, start: u64) -> Result<ObjectReader, BufferError> {
        let info = self.load_info(id).await?;
        if !info.completed {
            return Err(BufferError::Incomplete(id.to_string()));
        }
        Ok(self
            .backend
            .get_object(&self.bucket, id, Some(ByteRange::from(start)))
            .await?)
    }

    /// Discard an existing session.
    pub async fn terminate(&self, id: &str) -> Result<(), BufferError> {
        self.load_info(id).await?;
        self.delete_session(id).await
    }

    /// Remove everything a session stored. Missing pieces are ignored.
    pub async fn delete_session(&self, id: &str) -> Result<(), BufferError> {
        ensure_session_id(id)?;
        let upload_id = match self.load_info(id).await {
            Ok(info) => info.multipart_id,
            Err(BufferError::NotFound(_)) => None,
            Err(BufferError::Info(err)) => {
                warn!(session = id, error = %err, "discarding unreadable session info");
                None
            }
            Err(err) => return Err(err),
        };
        let upload_id = match upload_id {
            Some(upload_id) => Some(upload_id),
            None => self.partials.find(&self.bucket, id).await?.map(|r| r.upload_id),
        };
        if let Some(upload_id) = upload_id {
            match self.backend.abort_multipart_upload(&self.bucket, id, &upload_id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.backend
            .delete_objects(
                &self.bucket,
                &[id.to_string(), info_key(id), part_key(id)],
            )
            .await?;
        self.partials.delete(&self.bucket, id).await?;
        debug!(session = id, "deleted upload session");
        Ok(())
    }

    async fn commit_part(
        &self,
        info: &mut SessionInfo,
        base: u64,
        data: Bytes,
    ) -> Result<(), BufferError> {
        let upload_id = info
            .multipart_id
            .clone()
            .ok_or_else(|| BufferError::MissingMultipart(info.id.clone()))?;
        let part_number = (base / info.part_size + 1) as i32;
        let len = data.len() as u64;
        self.backend
            .upload_part(&self.bucket, &info.id, &upload_id, part_number, data)
            .await?;
        self.backend.delete_objects(&self.bucket, &[part_key(&info.id)]).await?;
        info.offset = base + len;
        self.save_info(info).await?;
        debug!(session = %info.id, part_number, offset = info.offset, "committed buffer part");
        Ok(())
    }

    async fn persist_tail(
        &self,
        info: &mut SessionInfo,
        base: u64,
        pending: &[u8],
    ) -> Result<(), BufferError> {
        if pending.is_empty() {
            return Ok(());
        }
        self.backend
            .put_object(&self.bucket, &part_key(&info.id), Bytes::copy_from_slice(pending))
            .await?;
        info.offset = base + pending.len() as u64;
        self.save_info(info).await
    }

    async fn finish(&self, info: &mut SessionInfo) -> Result<(), BufferError> {
        if let Some(upload_id) = info.multipart_id.clone() {
            let mut parts = self
                .backend
                .list_parts(&self.bucket, &info.id, &upload_id)
                .await?;
            parts.sort_by_key(|p| p.part_number);
            let completed: Vec<_> = parts.into_iter().map(Into::into).collect();
            self.backend
                .complete_multipart_upload(&self.bucket, &info.id, &upload_id, &completed)
                .await?;
            self.partials.delete(&self.bucket, &info.id).await?;
        }
        self.backend.delete_objects(&self.bucket, &[part_key(&info.id)]).await?;
        info.multipart_id = None;
        info.offset = info.size;
        info.completed = true;
        self.save_info(info).await?;
        info!(session = %info.id, size = info.size, "upload session complete");
        Ok(())
    }

    async fn read_tail(&self, id: &str, len: u64) -> Result<Vec<u8>, BufferError> {
        let mut reader = self.backend.get_object(&self.bucket, &part_key(id), None).await?;
        let mut tail = Vec::with_capacity(len as usize);
        reader
            .read_to_end(&mut tail)
            .await
            .map_err(BackendError::Io)?;
        tail.truncate(len as usize);
        Ok(tail)
    }

    async fn load_info(&self, id: &str) -> Result<SessionInfo, BufferError> {
        ensure_session_id(id)?;
        let mut reader = match self.backend.get_object(&self.bucket, &info_key(id), None).await {
            Ok(reader) => reader,
            Err(err) if err.is_not_found() => return Err(BufferError::NotFound(id.to_string())),
            Err(err) => return Err(err.into()),
        };
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await.map_err(BackendError::Io)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn save_info(&self, info: &SessionInfo) -> Result<(), BufferError> {
        let raw = serde_json::to_vec(info)?;
        self.backend
            .put_object(&self.bucket, &info_key(&info.id), Bytes::from(raw))
            .await?;
        Ok(())
    }
}

fn info_key(id: &str) -> String {
    format!("{id}{INFO_SUFFIX}")
}

fn part_key(id: &str) -> String {
    format!("{id}{PART_SUFFIX}")
}

fn ensure_session_id(id: &str) -> Result<(), BufferError> {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(BufferError::NotFound(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::filesystem::FilesystemBackend;

    async fn buffer(part_size: u64) -> (tempfile::TempDir, UploadBuffer) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("b.db").display());
        let db = crate::db::connect(&url, 2).await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        let backend = FilesystemBackend::new(dir.path().join("objects"));
        backend.init().await.unwrap();
        backend.create_bucket_if_not_exists("buffer").await.unwrap();
        let buffer = UploadBuffer::new(Arc::new(backend), "buffer", PartialUploads::new(db), part_size);
        (dir, buffer)
    }

    async fn read_all(buffer: &UploadBuffer, id: &str, start: u64) -> Vec<u8> {
        let mut out = Vec::new();
        buffer
            .open_reader(id, start)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn chunks_assemble_across_part_boundaries() {
        let (_dir, buffer) = buffer(4).await;
        let cancel = CancellationToken::new();
        let info = buffer.create(10, HashMap::new()).await.unwrap();
        assert!(info.multipart_id.is_some());

        let out = buffer.write_chunk(&info.id, 0, &b"abc"[..], &cancel).await.unwrap();
        assert_eq!(out.info.offset, 3);
        let out = buffer.write_chunk(&info.id, 3, &b"defgh"[..], &cancel).await.unwrap();
        assert_eq!(out.info.offset, 8);
        assert!(!out.info.completed);

        let err = buffer.write_chunk(&info.id, 3, &b"x"[..], &cancel).await.unwrap_err();
        assert!(matches!(err, BufferError::OffsetMismatch { expected: 8, actual: 3 }));

        let out = buffer.write_chunk(&info.id, 8, &b"ij"[..], &cancel).await.unwrap();
        assert!(out.info.completed);
        assert_eq!(out.info.offset, 10);
        assert_eq!(read_all(&buffer, &info.id, 0).await, b"abcdefghij");
        assert_eq!(read_all(&buffer, &info.id, 6).await, b"ghij");
    }

    #[tokio::test]
    async fn rejects_bytes_past_declared_size() {
        let (_dir, buffer) = buffer(4).await;
        let cancel = CancellationToken::new();
        let info = buffer.create(3, HashMap::new()).await.unwrap();
        let err = buffer.write_chunk(&info.id, 0, &b"abcd"[..], &cancel).await.unwrap_err();
        assert!(matches!(err, BufferError::TooLarge { size: 3 }));
        assert_eq!(buffer.get_info(&info.id).await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn lost_tail_rolls_offset_back_to_part_boundary() {
        let (_dir, buffer) = buffer(4).await;
        let cancel = CancellationToken::new();
        let info = buffer.create(12, HashMap::new()).await.unwrap();
        buffer.write_chunk(&info.id, 0, &b"abcdef"[..], &cancel).await.unwrap();

        buffer
            .backend
            .delete_objects("buffer", &[part_key(&info.id)])
            .await
            .unwrap();
        let info = buffer.get_info(&info.id).await.unwrap();
        assert_eq!(info.offset, 4);

        let out = buffer.write_chunk(&info.id, 4, &b"efghijkl"[..], &cancel).await.unwrap();
        assert!(out.info.completed);
        assert_eq!(read_all(&buffer, &info.id, 0).await, b"abcdefghijkl");
    }

    #[tokio::test]
    async fn empty_upload_completes_at_creation_and_terminate_cleans_up() {
        let (_dir, buffer) = buffer(4).await;
        let info = buffer.create(0, HashMap::new()).await.unwrap();
        assert!(info.completed);
        assert!(read_all(&buffer, &info.id, 0).await.is_empty());

        let open = buffer.create(8, HashMap::new()).await.unwrap();
        buffer.terminate(&open.id).await.unwrap();
        assert!(matches!(
            buffer.get_info(&open.id).await,
            Err(BufferError::NotFound(_))
        ));
        assert!(matches!(
            buffer.terminate(&open.id).await,
            Err(BufferError::NotFound(_))
        ));
        buffer.delete_session(&open.id).await.unwrap();
    }

    #[tokio::test]
    async fn session_without_buffer_upload_is_not_reported_missing() {
        let (_dir, buffer) = buffer(4).await;
        let cancel = CancellationToken::new();
        let mut info = buffer.create(8, HashMap::new()).await.unwrap();
        info.multipart_id = None;
        buffer.save_info(&info).await.unwrap();

        let err = buffer.write_chunk(&info.id, 0, &b"abcd"[..], &cancel).await.unwrap_err();
        assert!(matches!(err, BufferError::MissingMultipart(_)));
        assert!(matches!(
            crate::services::chunked_upload::TusError::from(err),
            crate::services::chunked_upload::TusError::Internal(_)
        ));
    }
}
