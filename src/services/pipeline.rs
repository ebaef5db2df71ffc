//! Finalization of completed upload sessions.
//!
//! `upload.verify` → `upload.store` → `upload.cleanup`, each stage a one-time
//! job that enqueues the next one only after its own work is durable. Every
//! stage is tagged with the session id and tolerates being run again.

use crate::{
    backends::ObjectBackend,
    config::PipelineSettings,
    models::{
        hash::StorageHash,
        job::JobDefinition,
        request::{Request, RequestOperation, RequestStatus},
        upload::NewUpload,
    },
    services::{
        content_type::{SNIFF_LEN, sniff_mime_type},
        hashing::ContentHasher,
        locker::{AcquireOptions, DistributedLock, LockError},
        protocol::StorageProtocol,
        request_service::{ChunkedUploadDataHandler, DataHandler, RequestService},
        scheduler::{JobContext, JobScheduler, SchedulerError, Task, TaskRegistry},
        transfer::{BackendRangeReader, MultipartTransfer},
        upload_buffer::UploadBuffer,
        upload_service::UploadService,
    },
};
use anyhow::{Context, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const VERIFY_TASK: &str = "upload.verify";
pub const STORE_TASK: &str = "upload.store";
pub const CLEANUP_TASK: &str = "upload.cleanup";
pub const REAP_TASK: &str = "upload.reap_stale";

const MAINTENANCE_TAG: &str = "maintenance";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyArgs {
    pub request_id: i64,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreArgs {
    pub request_id: i64,
    pub session_id: String,
    /// Base64url proof computed by the verify stage.
    pub proof: Option<String>,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupArgs {
    pub request_id: i64,
    pub session_id: String,
    pub protocol: String,
    pub object_name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    /// The object was already stored by an earlier upload.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReapArgs {}

/// Collaborators shared by every stage.
pub struct PipelineContext {
    pub requests: RequestService,
    pub chunked: ChunkedUploadDataHandler,
    pub uploads: UploadService,
    pub buffer: UploadBuffer,
    pub durable: Arc<dyn ObjectBackend>,
    pub transfer: MultipartTransfer,
    pub hasher: Arc<dyn ContentHasher>,
    pub protocol: Arc<dyn StorageProtocol>,
    pub locks: DistributedLock,
    pub settings: PipelineSettings,
}

/// Name of the lock guarding a chunked-upload session.
pub fn session_lock_id(session_id: &str) -> String {
    format!("tus:{session_id}")
}

pub fn register_pipeline(
    registry: &mut TaskRegistry,
    ctx: Arc<PipelineContext>,
) -> Result<(), SchedulerError> {
    registry.register(VERIFY_TASK, VerifyStage(ctx.clone()), JobDefinition::OneTime)?;
    registry.register(STORE_TASK, StoreStage(ctx.clone()), JobDefinition::OneTime)?;
    registry.register(CLEANUP_TASK, CleanupStage(ctx.clone()), JobDefinition::OneTime)?;
    registry.register(
        REAP_TASK,
        ReapStage(ctx.clone()),
        JobDefinition::every(ctx.settings.reap_interval),
    )?;
    Ok(())
}

/// Ensure the recurring stale-session reaper is on record.
pub async fn schedule_maintenance(
    scheduler: &JobScheduler,
    settings: &PipelineSettings,
) -> Result<Option<Uuid>, SchedulerError> {
    scheduler
        .create_job_scheduled(
            REAP_TASK,
            &ReapArgs::default(),
            &[MAINTENANCE_TAG.to_string()],
            JobDefinition::every(settings.reap_interval),
        )
        .await
}

/// Load a request the stage can still act on. `None` means the session was
/// abandoned or the request already reached a terminal status.
async fn active_request(
    ctx: &PipelineContext,
    stage: &str,
    request_id: i64,
) -> anyhow::Result<Option<Request>> {
    let request = ctx
        .requests
        .get_request(request_id)
        .await
        .with_context(|| format!("{stage} stage: loading request {request_id}"))?;
    match request {
        None => {
            warn!(stage, request_id, "request no longer exists; skipping");
            Ok(None)
        }
        Some(request) if request.status.is_terminal() => {
            debug!(stage, request_id, status = %request.status, "request already finished");
            Ok(None)
        }
        Some(request) => Ok(Some(request)),
    }
}

/// Exponential backoff before store attempt `attempt + 1`.
fn store_backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

pub struct VerifyStage(pub Arc<PipelineContext>);

#[async_trait]
impl Task for VerifyStage {
    type Args = VerifyArgs;

    async fn run(&self, args: VerifyArgs, job: JobContext) -> anyhow::Result<()> {
        let ctx = &self.0;
        let Some(request) = active_request(ctx, "verify", args.request_id).await? else {
            return Ok(());
        };

        let Some(claimed) = request.hash() else {
            ctx.requests
                .update_status(request.id, RequestStatus::Failed)
                .await
                .context("verify stage: marking request failed")?;
            bail!("verify stage: request {} carries no claimed hash", request.id);
        };

        let size = request.size as u64;
        let verified = async {
            let reader = ctx
                .buffer
                .open_reader(&args.session_id, 0)
                .await
                .context("opening buffered upload")?;
            ctx.hasher
                .verify(reader, size, &claimed)
                .await
                .context("hashing buffered upload")
        }
        .await;

        let actual = match verified {
            Ok(Some(actual)) => actual,
            Ok(None) => {
                warn!(
                    request_id = request.id,
                    session_id = %args.session_id,
                    claimed = %claimed,
                    "content hash mismatch; buffered upload kept for inspection"
                );
                ctx.requests
                    .update_status(request.id, RequestStatus::Failed)
                    .await
                    .context("verify stage: marking request failed")?;
                bail!("verify stage: hash mismatch for request {}", request.id);
            }
            Err(err) => {
                ctx.requests
                    .update_status(request.id, RequestStatus::Failed)
                    .await
                    .context("verify stage: marking request failed")?;
                return Err(err.context(format!("verify stage: request {}", request.id)));
            }
        };

        ctx.requests
            .mark_verified(request.id, &actual)
            .await
            .context("verify stage: recording verified hash")?;
        debug!(request_id = request.id, hash = %actual, "upload verified");

        job.scheduler
            .create_job_if_not_exists(
                STORE_TASK,
                &StoreArgs {
                    request_id: request.id,
                    session_id: args.session_id.clone(),
                    proof: actual.proof.as_ref().map(|p| URL_SAFE_NO_PAD.encode(p)),
                    attempt: 1,
                },
                &[args.session_id],
            )
            .await
            .context("verify stage: enqueueing store")?;
        Ok(())
    }
}

pub struct StoreStage(pub Arc<PipelineContext>);

impl StoreStage {
    async fn store(
        &self,
        session_id: &str,
        bucket: &str,
        object_name: &str,
        size: u64,
        hash: &StorageHash,
        proof: Option<&str>,
    ) -> anyhow::Result<()> {
        let ctx = &self.0;
        if size < ctx.settings.multipart_threshold {
            let mut reader = ctx
                .buffer
                .open_reader(session_id, 0)
                .await
                .context("opening buffered upload")?;
            let mut data = Vec::with_capacity(size as usize);
            (&mut reader)
                .take(size)
                .read_to_end(&mut data)
                .await
                .context("reading buffered upload")?;
            if data.len() as u64 != size {
                bail!("buffered upload holds {} of {} bytes", data.len(), size);
            }
            ctx.durable
                .put_object(bucket, object_name, Bytes::from(data))
                .await
                .context("storing object")?;
        } else {
            let source = BackendRangeReader::new(ctx.buffer.backend(), ctx.buffer.bucket(), session_id);
            ctx.transfer
                .transfer(&source, bucket, object_name, size)
                .await
                .context("multipart transfer")?;
        }

        if let Some(proof) = proof {
            let proof = URL_SAFE_NO_PAD.decode(proof).context("decoding proof")?;
            ctx.durable
                .put_object(bucket, &ctx.protocol.proof_file_name(hash), Bytes::from(proof))
                .await
                .context("storing proof")?;
        }
        Ok(())
    }

    /// Type detected from the leading bytes of the buffered upload.
    async fn detect_mime_type(&self, session_id: &str, size: u64) -> anyhow::Result<String> {
        let mut head = Vec::with_capacity(SNIFF_LEN);
        if size > 0 {
            let reader = self
                .0
                .buffer
                .open_reader(session_id, 0)
                .await
                .context("opening buffered upload")?;
            reader
                .take(SNIFF_LEN as u64)
                .read_to_end(&mut head)
                .await
                .context("reading buffered upload")?;
        }
        Ok(sniff_mime_type(&head))
    }
}

#[async_trait]
impl Task for StoreStage {
    type Args = StoreArgs;

    async fn run(&self, args: StoreArgs, job: JobContext) -> anyhow::Result<()> {
        let ctx = &self.0;
        let Some(request) = active_request(ctx, "store", args.request_id).await? else {
            return Ok(());
        };
        if !request.is_verified() {
            bail!("store stage: request {} has not been verified", request.id);
        }
        let hash = request
            .hash()
            .with_context(|| format!("store stage: request {} has no hash", request.id))?;

        let bucket = ctx.protocol.name();
        let object_name = ctx.protocol.encode_file_name(&hash);
        let size = request.size as u64;

        let duplicate = ctx
            .uploads
            .get_upload(&hash)
            .await
            .context("store stage: looking up existing upload")?
            .is_some();

        if duplicate {
            info!(request_id = request.id, object_name = %object_name, "object already stored; skipping transfer");
        } else if let Err(err) = self
            .store(&args.session_id, bucket, &object_name, size, &hash, args.proof.as_deref())
            .await
        {
            if args.attempt >= ctx.settings.store_max_attempts {
                ctx.requests
                    .update_status(request.id, RequestStatus::Failed)
                    .await
                    .context("store stage: marking request failed")?;
                return Err(err.context(format!(
                    "store stage: giving up on request {} after {} attempts",
                    request.id, args.attempt
                )));
            }

            let delay = store_backoff(ctx.settings.store_retry_base, args.attempt);
            warn!(
                request_id = request.id,
                attempt = args.attempt,
                retry_in_secs = delay.as_secs(),
                error = ?err,
                "store attempt failed; retry scheduled"
            );
            job.scheduler
                .create_job_scheduled(
                    STORE_TASK,
                    &StoreArgs {
                        attempt: args.attempt + 1,
                        ..args.clone()
                    },
                    &[args.session_id.clone()],
                    JobDefinition::delayed(delay),
                )
                .await
                .context("store stage: scheduling retry")?;
            return Ok(());
        }

        let mime_type = match request.mime_type.clone() {
            Some(mime_type) => Some(mime_type),
            None => match self.detect_mime_type(&args.session_id, size).await {
                Ok(mime_type) => {
                    debug!(request_id = request.id, mime_type = %mime_type, "detected content type");
                    Some(mime_type)
                }
                Err(err) => {
                    warn!(request_id = request.id, error = ?err, "content type detection failed");
                    None
                }
            },
        };

        job.scheduler
            .create_job_if_not_exists(
                CLEANUP_TASK,
                &CleanupArgs {
                    request_id: request.id,
                    session_id: args.session_id.clone(),
                    protocol: bucket.to_string(),
                    object_name,
                    size,
                    mime_type,
                    duplicate,
                },
                &[args.session_id],
            )
            .await
            .context("store stage: enqueueing cleanup")?;
        Ok(())
    }
}

pub struct CleanupStage(pub Arc<PipelineContext>);

#[async_trait]
impl Task for CleanupStage {
    type Args = CleanupArgs;

    async fn run(&self, args: CleanupArgs, _job: JobContext) -> anyhow::Result<()> {
        let ctx = &self.0;
        let mut failures: Vec<String> = Vec::new();

        if let Err(err) = ctx.buffer.delete_session(&args.session_id).await {
            error!(session_id = %args.session_id, error = %err, "cleanup: failed to delete buffered upload");
            failures.push(format!("buffer: {err}"));
        }

        match ctx.requests.get_request(args.request_id).await {
            Ok(Some(request)) => {
                if let Err(err) = record_upload(ctx, &request, &args).await {
                    error!(request_id = request.id, error = ?err, "cleanup: failed to record upload");
                    failures.push(format!("metadata: {err:#}"));
                }

                let status = if args.duplicate {
                    RequestStatus::Duplicate
                } else {
                    RequestStatus::Completed
                };
                if let Err(err) = ctx.requests.complete_request(request.id, status).await {
                    error!(request_id = request.id, error = %err, "cleanup: failed to complete request");
                    failures.push(format!("request: {err}"));
                }
            }
            Ok(None) => warn!(request_id = args.request_id, "cleanup: request no longer exists"),
            Err(err) => failures.push(format!("request lookup: {err}")),
        }

        if let Err(err) = ctx.chunked.delete(args.request_id).await {
            error!(request_id = args.request_id, error = %err, "cleanup: failed to delete session data");
            failures.push(format!("session data: {err}"));
        }

        if let Err(err) = ctx.locks.purge(&session_lock_id(&args.session_id)).await {
            error!(session_id = %args.session_id, error = %err, "cleanup: failed to purge session lock");
            failures.push(format!("lock: {err}"));
        }

        if !failures.is_empty() {
            bail!("cleanup stage: {} step(s) failed: {}", failures.len(), failures.join("; "));
        }
        info!(
            request_id = args.request_id,
            object_name = %args.object_name,
            size = args.size,
            duplicate = args.duplicate,
            "upload finalized"
        );
        Ok(())
    }
}

async fn record_upload(
    ctx: &PipelineContext,
    request: &Request,
    args: &CleanupArgs,
) -> anyhow::Result<()> {
    let hash = request.hash().context("request has no hash")?;
    let upload = ctx
        .uploads
        .save_upload(NewUpload {
            hash,
            protocol: args.protocol.clone(),
            object_name: args.object_name.clone(),
            mime_type: args.mime_type.clone(),
            size: args.size,
            user_id: request.user_id.clone(),
            uploader_ip: request.source_ip.clone(),
        })
        .await
        .context("saving upload")?;
    if let Some(user_id) = &request.user_id {
        ctx.uploads.pin(upload.id, user_id).await.context("pinning upload")?;
    }
    Ok(())
}

pub struct ReapStage(pub Arc<PipelineContext>);

#[async_trait]
impl Task for ReapStage {
    type Args = ReapArgs;

    async fn run(&self, _args: ReapArgs, _job: JobContext) -> anyhow::Result<()> {
        let ctx = &self.0;
        let ttl = chrono::Duration::from_std(ctx.settings.stale_session_ttl)
            .context("reap stage: session ttl out of range")?;
        let stale = ctx
            .requests
            .list_inactive(RequestOperation::ChunkedUpload, RequestStatus::Pending, Utc::now() - ttl)
            .await
            .context("reap stage: listing stale requests")?;

        let mut reaped = 0usize;
        for request in stale {
            let Some(data) = ctx
                .chunked
                .get(request.id)
                .await
                .context("reap stage: loading session data")?
            else {
                continue;
            };

            let options = AcquireOptions::single_attempt().without_release_request();
            let handle = match ctx.locks.acquire(&session_lock_id(&data.session_id), options).await {
                Ok(handle) => handle,
                Err(LockError::Busy(_)) => {
                    debug!(session_id = %data.session_id, "stale session is in use; skipping");
                    continue;
                }
                Err(err) => return Err(err).context("reap stage: locking session"),
            };

            let result = async {
                ctx.buffer.delete_session(&data.session_id).await?;
                ctx.requests.delete_request(request.id).await?;
                anyhow::Ok(())
            }
            .await;
            if let Err(err) = ctx.locks.release(handle).await {
                warn!(session_id = %data.session_id, error = %err, "failed to release session lock");
            }
            match result {
                Ok(()) => reaped += 1,
                Err(err) => {
                    error!(session_id = %data.session_id, error = ?err, "failed to reap stale session")
                }
            }
        }

        if reaped > 0 {
            info!(reaped, "reaped stale upload sessions");
        }
        Ok(())
    }
}
