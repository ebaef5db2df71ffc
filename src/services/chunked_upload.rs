//! Session lifecycle of resumable uploads.
//!
//! Byte handling lives in [`UploadBuffer`]; this module guards it with the
//! per-session lock and turns the four lifecycle events into request records
//! and pipeline jobs. Each event kind has its own queue and worker pool.

use crate::{
    config::UploadSettings,
    models::{
        hash::{HashAlgorithm, HashError, StorageHash},
        request::{NewRequest, RequestStatus},
        session::{ChunkedUploadData, SessionInfo},
    },
    services::{
        events::{EventHandler, EventQueue},
        locker::{AcquireOptions, DistributedLock, LockError, LockHandle},
        pipeline::{VERIFY_TASK, VerifyArgs, session_lock_id},
        protocol::StorageProtocol,
        request_service::{ChunkedUploadDataHandler, DataHandler, RequestError, RequestService},
        scheduler::JobScheduler,
        upload_buffer::{BufferError, UploadBuffer},
        upload_service::UploadService,
    },
};
use anyhow::Context;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::{io::AsyncRead, sync::oneshot, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why the verification hook refused a session.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("an authenticated uploader is required")]
    Unauthenticated,
    #[error("missing `hash` upload metadata")]
    MissingHash,
    #[error("invalid `hash` upload metadata: {0}")]
    InvalidHash(#[from] HashError),
    #[error("hash algorithm {0} is not accepted")]
    UnsupportedAlgorithm(HashAlgorithm),
    #[error("upload of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("file already exists")]
    AlreadyExists,
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl UploadError {
    /// Refusals caused by the client, as opposed to internal failures.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, UploadError::Request(_) | UploadError::Sqlx(_))
    }
}

#[derive(Debug, Error)]
pub enum TusError {
    #[error("upload session {0} not found")]
    NotFound(String),
    #[error("offset mismatch: session is at {expected}, request starts at {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },
    #[error("upload exceeds its declared size of {size} bytes")]
    TooLarge { size: u64 },
    #[error("upload session {0} is locked by another request")]
    Locked(String),
    #[error(transparent)]
    Rejected(UploadError),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<BufferError> for TusError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::NotFound(id) => TusError::NotFound(id),
            BufferError::OffsetMismatch { expected, actual } => {
                TusError::OffsetMismatch { expected, actual }
            }
            BufferError::TooLarge { size } => TusError::TooLarge { size },
            other => TusError::Internal(other.into()),
        }
    }
}

impl From<UploadError> for TusError {
    fn from(err: UploadError) -> Self {
        match err {
            err if err.is_rejection() => TusError::Rejected(err),
            err => TusError::Internal(err.into()),
        }
    }
}

/// A session as presented to the verification hook.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub size: u64,
    pub metadata: HashMap<String, String>,
    /// Identity asserted by the authentication layer.
    pub user_id: Option<String>,
    pub source_ip: Option<String>,
}

/// What the hook approved.
#[derive(Debug, Clone)]
pub struct ApprovedUpload {
    pub hash: StorageHash,
    pub user_id: String,
}

/// Decides whether a new session may proceed.
#[async_trait]
pub trait UploadVerifier: Send + Sync + 'static {
    async fn verify(&self, session: &NewSession) -> Result<ApprovedUpload, UploadError>;
}

/// Requires an uploader, a claimed hash of the hasher's algorithm, a size
/// within limits and content that is not stored yet.
pub struct DefaultUploadVerifier {
    uploads: UploadService,
    algorithm: HashAlgorithm,
    max_upload_size: u64,
}

impl DefaultUploadVerifier {
    pub fn new(uploads: UploadService, algorithm: HashAlgorithm, max_upload_size: u64) -> Self {
        Self {
            uploads,
            algorithm,
            max_upload_size,
        }
    }
}

#[async_trait]
impl UploadVerifier for DefaultUploadVerifier {
    async fn verify(&self, session: &NewSession) -> Result<ApprovedUpload, UploadError> {
        let user_id = session
            .user_id
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or(UploadError::Unauthenticated)?;
        let claimed = session
            .metadata
            .get("hash")
            .filter(|h| !h.is_empty())
            .ok_or(UploadError::MissingHash)?;
        let hash = StorageHash::from_base64url(claimed)?;
        if hash.algorithm != self.algorithm {
            return Err(UploadError::UnsupportedAlgorithm(hash.algorithm));
        }
        if session.size > self.max_upload_size {
            return Err(UploadError::TooLarge {
                size: session.size,
                limit: self.max_upload_size,
            });
        }
        if self.uploads.get_upload(&hash).await?.is_some() {
            return Err(UploadError::AlreadyExists);
        }
        Ok(ApprovedUpload { hash, user_id })
    }
}

struct CreatedEvent {
    info: SessionInfo,
    session: NewSession,
    reply: oneshot::Sender<Result<i64, UploadError>>,
}

struct ProgressEvent(String);

struct TerminatedEvent(String);

struct CompletedEvent(String);

/// Shared by the event workers.
struct Lifecycle {
    buffer: UploadBuffer,
    requests: RequestService,
    chunked: ChunkedUploadDataHandler,
    scheduler: JobScheduler,
    verifier: Arc<dyn UploadVerifier>,
    protocol: Arc<dyn StorageProtocol>,
}

#[async_trait]
impl EventHandler<CreatedEvent> for Lifecycle {
    async fn handle(&self, event: CreatedEvent) -> anyhow::Result<()> {
        let result = self.on_created(&event.info, &event.session).await;
        if event.reply.send(result).is_err() {
            warn!(session_id = %event.info.id, "session creator went away before the verdict");
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<ProgressEvent> for Lifecycle {
    async fn handle(&self, event: ProgressEvent) -> anyhow::Result<()> {
        let ProgressEvent(session_id) = event;
        if let Some(data) = self.chunked.find_by_session(&session_id).await? {
            self.requests.touch(data.request_id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<TerminatedEvent> for Lifecycle {
    async fn handle(&self, event: TerminatedEvent) -> anyhow::Result<()> {
        let TerminatedEvent(session_id) = event;
        if let Some(data) = self.chunked.find_by_session(&session_id).await? {
            self.requests
                .delete_request(data.request_id)
                .await
                .context("deleting request of terminated session")?;
        }
        self.buffer
            .delete_session(&session_id)
            .await
            .context("deleting terminated session")?;
        debug!(session_id = %session_id, "session terminated");
        Ok(())
    }
}

#[async_trait]
impl EventHandler<CompletedEvent> for Lifecycle {
    async fn handle(&self, event: CompletedEvent) -> anyhow::Result<()> {
        let CompletedEvent(session_id) = event;
        let Some(data) = self.chunked.find_by_session(&session_id).await? else {
            warn!(session_id = %session_id, "completed session has no request");
            return Ok(());
        };
        if data.completed {
            debug!(session_id = %session_id, "completion already handled");
            return Ok(());
        }

        self.requests
            .update_status(data.request_id, RequestStatus::Processing)
            .await?;
        self.scheduler
            .create_job_if_not_exists(
                VERIFY_TASK,
                &VerifyArgs {
                    request_id: data.request_id,
                    session_id: session_id.clone(),
                },
                &[session_id.clone()],
            )
            .await
            .context("enqueueing verify stage")?;
        self.chunked
            .update(
                data.request_id,
                &ChunkedUploadData {
                    completed: true,
                    ..data
                },
            )
            .await?;
        info!(session_id = %session_id, "upload received; finalization queued");
        Ok(())
    }
}

impl Lifecycle {
    async fn on_created(&self, info: &SessionInfo, session: &NewSession) -> Result<i64, UploadError> {
        let approved = self.verifier.verify(session).await?;
        let request = self
            .requests
            .create_request(
                NewRequest {
                    protocol: self.protocol.name().to_string(),
                    hash: Some(approved.hash),
                    size: info.size,
                    mime_type: info.mime_type(),
                    source_ip: session.source_ip.clone(),
                    user_id: Some(approved.user_id),
                },
                &self.chunked,
                &ChunkedUploadData {
                    request_id: 0,
                    session_id: info.id.clone(),
                    completed: false,
                },
            )
            .await?;
        Ok(request.id)
    }
}

/// Everything the handler is built from.
pub struct ChunkedUploadDeps {
    pub buffer: UploadBuffer,
    pub requests: RequestService,
    pub chunked: ChunkedUploadDataHandler,
    pub scheduler: JobScheduler,
    pub verifier: Arc<dyn UploadVerifier>,
    pub protocol: Arc<dyn StorageProtocol>,
    pub locks: DistributedLock,
}

#[derive(Clone)]
pub struct ChunkedUploadHandler {
    buffer: UploadBuffer,
    locks: DistributedLock,
    settings: UploadSettings,
    created: EventQueue<CreatedEvent>,
    progress: EventQueue<ProgressEvent>,
    terminated: EventQueue<TerminatedEvent>,
    completed: EventQueue<CompletedEvent>,
}

impl ChunkedUploadHandler {
    /// Build the handler and start its event workers on `tasks`.
    pub fn start(
        deps: ChunkedUploadDeps,
        settings: UploadSettings,
        tasks: &mut JoinSet<()>,
        shutdown: CancellationToken,
    ) -> Self {
        let lifecycle = Arc::new(Lifecycle {
            buffer: deps.buffer.clone(),
            requests: deps.requests,
            chunked: deps.chunked,
            scheduler: deps.scheduler,
            verifier: deps.verifier,
            protocol: deps.protocol,
        });
        let capacity = settings.event_queue_capacity;
        let workers = settings.event_workers;
        let lifecycle_policy = settings.lifecycle_overflow;

        Self {
            created: EventQueue::<CreatedEvent>::start(
                "created",
                capacity,
                workers,
                lifecycle_policy,
                lifecycle.clone(),
                tasks,
                shutdown.clone(),
            ),
            progress: EventQueue::<ProgressEvent>::start(
                "progress",
                capacity,
                workers,
                settings.progress_overflow,
                lifecycle.clone(),
                tasks,
                shutdown.clone(),
            ),
            terminated: EventQueue::<TerminatedEvent>::start(
                "terminated",
                capacity,
                workers,
                lifecycle_policy,
                lifecycle.clone(),
                tasks,
                shutdown.clone(),
            ),
            completed: EventQueue::<CompletedEvent>::start(
                "completed",
                capacity,
                workers,
                lifecycle_policy,
                lifecycle,
                tasks,
                shutdown,
            ),
            buffer: deps.buffer,
            locks: deps.locks,
            settings,
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Open a session and wait for the verification verdict. A refused
    /// session is discarded before the error is returned.
    pub async fn create_session(&self, session: NewSession) -> Result<SessionInfo, TusError> {
        if session.size > self.settings.max_upload_size {
            return Err(UploadError::TooLarge {
                size: session.size,
                limit: self.settings.max_upload_size,
            }
            .into());
        }

        let info = self.buffer.create(session.size, session.metadata.clone()).await?;
        let (reply, verdict) = oneshot::channel();
        let dispatched = self
            .created
            .dispatch(CreatedEvent {
                info: info.clone(),
                session,
                reply,
            })
            .await;

        let outcome = if dispatched {
            verdict
                .await
                .map_err(|_| TusError::Internal(anyhow::anyhow!("session verification was dropped")))
        } else {
            Err(TusError::Internal(anyhow::anyhow!("session creation queue is unavailable")))
        };

        match outcome {
            Ok(Ok(request_id)) => {
                debug!(session_id = %info.id, request_id, size = info.size, "session created");
                if info.completed {
                    self.completed.dispatch(CompletedEvent(info.id.clone())).await;
                }
                Ok(info)
            }
            Ok(Err(err)) => {
                self.discard(&info.id).await;
                if err.is_rejection() {
                    warn!(session_id = %info.id, reason = %err, "session rejected");
                }
                Err(err.into())
            }
            Err(err) => {
                self.discard(&info.id).await;
                Err(err)
            }
        }
    }

    pub async fn session_status(&self, id: &str) -> Result<SessionInfo, TusError> {
        Ok(self.buffer.get_info(id).await?)
    }

    /// Append `body` at `offset` while holding the session lock. A release
    /// request from another holder stops the body read; what arrived so far
    /// is kept.
    pub async fn write<R>(&self, id: &str, offset: u64, body: R) -> Result<SessionInfo, TusError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let handle = self.lock_session(id).await?;
        let cancel = handle.release_requested();
        let result = self.buffer.write_chunk(id, offset, body, &cancel).await;
        if let Err(err) = self.locks.release(handle).await {
            warn!(session_id = id, error = %err, "failed to release session lock");
        }

        let outcome = result?;
        if outcome.interrupted {
            info!(session_id = id, offset = outcome.info.offset, "write preempted by another request");
        }
        if outcome.written > 0 {
            self.progress.dispatch(ProgressEvent(id.to_string())).await;
        }
        if outcome.info.completed {
            self.completed.dispatch(CompletedEvent(id.to_string())).await;
        }
        Ok(outcome.info)
    }

    /// Discard a session and everything it buffered.
    pub async fn terminate(&self, id: &str) -> Result<(), TusError> {
        let handle = self.lock_session(id).await?;
        let result = self.buffer.terminate(id).await;
        if let Err(err) = self.locks.release(handle).await {
            warn!(session_id = id, error = %err, "failed to release session lock");
        }
        result?;
        self.terminated.dispatch(TerminatedEvent(id.to_string())).await;
        Ok(())
    }

    async fn lock_session(&self, id: &str) -> Result<LockHandle, TusError> {
        let options = AcquireOptions::with_timeout(self.locks.settings().acquire_timeout);
        match self.locks.acquire(&session_lock_id(id), options).await {
            Ok(handle) => Ok(handle),
            Err(LockError::Busy(_)) | Err(LockError::Timeout(_)) => {
                Err(TusError::Locked(id.to_string()))
            }
            Err(err) => Err(TusError::Internal(err.into())),
        }
    }

    async fn discard(&self, id: &str) {
        if let Err(err) = self.buffer.delete_session(id).await {
            warn!(session_id = id, error = %err, "failed to discard refused session");
        }
    }
}
