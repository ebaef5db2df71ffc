//! Content access outside the resumable protocol: single-request uploads,
//! pins of stored content and reads by hash.

use crate::{
    backends::{ByteRange, ObjectReader},
    models::{
        hash::StorageHash,
        request::{NewRequest, Request, RequestOperation, RequestStatus},
        upload::NewUpload,
    },
    services::{
        chunked_upload::UploadError,
        content_type::sniff_mime_type,
        pipeline::PipelineContext,
        request_service::DataHandler,
        upload_buffer::BufferError,
    },
};
use anyhow::Context;
use bytes::Bytes;
use std::{io::Cursor, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file not found")]
    NotFound,
    #[error("range start {start} is past the end of {size} bytes")]
    RangeNotSatisfiable { start: u64, size: u64 },
    #[error(transparent)]
    Rejected(#[from] UploadError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// An opened stored object.
pub struct StoredFile {
    pub reader: ObjectReader,
    /// Full size of the object.
    pub size: u64,
    /// First byte `reader` yields.
    pub start: u64,
    pub mime_type: Option<String>,
}

/// Outcome of a single-request upload.
#[derive(Debug, Clone)]
pub struct PostedFile {
    pub hash: StorageHash,
    pub size: u64,
    /// The content was already stored.
    pub duplicate: bool,
}

/// A file received in one request body.
#[derive(Debug, Clone)]
pub struct SmallUpload {
    pub data: Bytes,
    pub mime_type: Option<String>,
    pub user_id: Option<String>,
    pub source_ip: Option<String>,
}

#[derive(Clone)]
pub struct FileService {
    ctx: Arc<PipelineContext>,
    max_post_size: u64,
}

impl FileService {
    pub fn new(ctx: Arc<PipelineContext>, max_post_size: u64) -> Self {
        Self { ctx, max_post_size }
    }

    pub fn max_post_size(&self) -> u64 {
        self.max_post_size
    }

    /// Hash and store a small file in one step, then pin it for the uploader.
    /// Content that is already stored is only pinned.
    pub async fn put_small(&self, upload: SmallUpload) -> Result<PostedFile, FileError> {
        let ctx = &self.ctx;
        let SmallUpload {
            data,
            mime_type,
            user_id,
            source_ip,
        } = upload;
        let user_id = user_id
            .filter(|u| !u.is_empty())
            .ok_or(UploadError::Unauthenticated)?;
        let size = data.len() as u64;
        if size > self.max_post_size {
            return Err(UploadError::TooLarge {
                size,
                limit: self.max_post_size,
            }
            .into());
        }

        let hash = ctx
            .hasher
            .hash(Box::pin(Cursor::new(data.clone())), size)
            .await
            .context("hashing posted file")?;
        let mime_type = mime_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| sniff_mime_type(&data));

        let request = ctx
            .requests
            .record_request(
                RequestOperation::PostUpload,
                NewRequest {
                    protocol: ctx.protocol.name().to_string(),
                    hash: Some(hash.clone()),
                    size,
                    mime_type: Some(mime_type.clone()),
                    source_ip: source_ip.clone(),
                    user_id: Some(user_id.clone()),
                },
            )
            .await
            .context("recording request")?;
        ctx.requests
            .mark_verified(request.id, &hash)
            .await
            .context("recording verified hash")?;

        let stored = async {
            let duplicate = ctx
                .uploads
                .get_upload(&hash)
                .await
                .context("looking up existing upload")?
                .is_some();
            let bucket = ctx.protocol.name();
            let object_name = ctx.protocol.encode_file_name(&hash);
            if !duplicate {
                ctx.durable
                    .put_object(bucket, &object_name, data)
                    .await
                    .context("storing object")?;
                if let Some(proof) = &hash.proof {
                    ctx.durable
                        .put_object(bucket, &ctx.protocol.proof_file_name(&hash), Bytes::from(proof.clone()))
                        .await
                        .context("storing proof")?;
                }
            }
            let saved = ctx
                .uploads
                .save_upload(NewUpload {
                    hash: hash.clone(),
                    protocol: bucket.to_string(),
                    object_name,
                    mime_type: Some(mime_type),
                    size,
                    user_id: Some(user_id.clone()),
                    uploader_ip: source_ip,
                })
                .await
                .context("saving upload")?;
            ctx.uploads
                .pin(saved.id, &user_id)
                .await
                .context("pinning upload")?;
            anyhow::Ok(duplicate)
        }
        .await;

        let duplicate = match stored {
            Ok(duplicate) => duplicate,
            Err(err) => {
                self.fail(&request).await;
                return Err(err.context(format!("posted upload {}", request.id)).into());
            }
        };
        let status = if duplicate {
            RequestStatus::Duplicate
        } else {
            RequestStatus::Completed
        };
        ctx.requests
            .complete_request(request.id, status)
            .await
            .context("completing request")?;
        info!(request_id = request.id, hash = %hash, size, duplicate, "small upload stored");
        Ok(PostedFile {
            hash,
            size,
            duplicate,
        })
    }

    /// Pin stored content for `user_id`. Returns `false` when it was
    /// already pinned.
    pub async fn pin(
        &self,
        hash: &StorageHash,
        user_id: Option<String>,
        source_ip: Option<String>,
    ) -> Result<bool, FileError> {
        let ctx = &self.ctx;
        let user_id = user_id
            .filter(|u| !u.is_empty())
            .ok_or(UploadError::Unauthenticated)?;
        let upload = ctx
            .uploads
            .get_upload(hash)
            .await
            .context("looking up upload")?
            .ok_or(FileError::NotFound)?;

        let stored_hash = upload.hash();
        let request = ctx
            .requests
            .record_request(
                RequestOperation::Pin,
                NewRequest {
                    protocol: upload.protocol.clone(),
                    hash: Some(stored_hash.clone()),
                    size: upload.size as u64,
                    mime_type: upload.mime_type.clone(),
                    source_ip,
                    user_id: Some(user_id.clone()),
                },
            )
            .await
            .context("recording request")?;
        ctx.requests
            .mark_verified(request.id, &stored_hash)
            .await
            .context("recording verified hash")?;

        let added = match ctx.uploads.pin(upload.id, &user_id).await {
            Ok(added) => added,
            Err(err) => {
                self.fail(&request).await;
                return Err(anyhow::Error::from(err).context("pinning upload").into());
            }
        };
        let status = if added {
            RequestStatus::Completed
        } else {
            RequestStatus::Duplicate
        };
        ctx.requests
            .complete_request(request.id, status)
            .await
            .context("completing request")?;
        debug!(upload_id = upload.id, user_id = %user_id, added, "pinned upload");
        Ok(added)
    }

    /// Open the content with this hash from `start` on. Uploads still being
    /// finalized are read from the buffer, everything else from the durable
    /// store.
    pub async fn get_file(&self, hash: &StorageHash, start: u64) -> Result<StoredFile, FileError> {
        let ctx = &self.ctx;
        let pending = ctx
            .requests
            .find_active_by_hash(RequestOperation::ChunkedUpload, hash)
            .await
            .context("looking up pending uploads")?;
        for request in pending {
            let Some(data) = ctx
                .chunked
                .get(request.id)
                .await
                .context("loading session data")?
            else {
                continue;
            };
            if !data.completed {
                continue;
            }
            let size = request.size as u64;
            check_range(start, size)?;
            if start == size {
                return Ok(empty_file(size, request.mime_type));
            }
            match ctx.buffer.open_reader(&data.session_id, start).await {
                Ok(reader) => {
                    return Ok(StoredFile {
                        reader,
                        size,
                        start,
                        mime_type: request.mime_type,
                    });
                }
                // finalization moved it on in the meantime
                Err(BufferError::NotFound(_)) | Err(BufferError::Incomplete(_)) => continue,
                Err(err) => {
                    return Err(anyhow::Error::from(err).context("opening buffered upload").into());
                }
            }
        }

        let upload = ctx
            .uploads
            .get_upload(hash)
            .await
            .context("looking up upload")?
            .ok_or(FileError::NotFound)?;
        let size = upload.size as u64;
        check_range(start, size)?;
        if start == size {
            return Ok(empty_file(size, upload.mime_type));
        }
        let range = (start > 0).then(|| ByteRange::from(start));
        let reader = ctx
            .durable
            .get_object(&upload.protocol, &upload.object_name, range)
            .await
            .context("opening stored object")?;
        Ok(StoredFile {
            reader,
            size,
            start,
            mime_type: upload.mime_type,
        })
    }

    async fn fail(&self, request: &Request) {
        if let Err(err) = self
            .ctx
            .requests
            .update_status(request.id, RequestStatus::Failed)
            .await
        {
            warn!(request_id = request.id, error = %err, "failed to mark request failed");
        }
    }
}

fn check_range(start: u64, size: u64) -> Result<(), FileError> {
    if start > size || (start == size && size > 0) {
        return Err(FileError::RangeNotSatisfiable { start, size });
    }
    Ok(())
}

fn empty_file(size: u64, mime_type: Option<String>) -> StoredFile {
    StoredFile {
        reader: Box::pin(tokio::io::empty()),
        size,
        start: 0,
        mime_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_must_start_inside_the_object() {
        assert!(check_range(0, 0).is_ok());
        assert!(check_range(0, 10).is_ok());
        assert!(check_range(9, 10).is_ok());
        assert!(matches!(
            check_range(10, 10),
            Err(FileError::RangeNotSatisfiable { start: 10, size: 10 })
        ));
        assert!(check_range(1, 0).is_err());
    }
}
