//! Wiring of the portal's services.

use crate::{
    backends::ObjectBackend,
    config::{AppConfig, LockerMode},
    routes,
    services::{
        chunked_upload::{ChunkedUploadDeps, ChunkedUploadHandler, DefaultUploadVerifier},
        file_service::FileService,
        hashing::{ContentHasher, DefaultHasher},
        locker::{DbLockStore, DistributedLock, LockStore, MemoryLockStore},
        partial_uploads::PartialUploads,
        pipeline::{PipelineContext, register_pipeline, schedule_maintenance},
        protocol::{S5Protocol, StorageProtocol},
        request_service::{ChunkedUploadDataHandler, RequestService},
        scheduler::{JobScheduler, TaskRegistry},
        transfer::MultipartTransfer,
        upload_buffer::UploadBuffer,
        upload_service::UploadService,
    },
};
use anyhow::{Context, Result};
use axum::Router;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Router state.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub uploads: ChunkedUploadHandler,
    pub files: FileService,
    pub buffer: Arc<dyn ObjectBackend>,
    pub durable: Arc<dyn ObjectBackend>,
}

pub struct Portal {
    pub state: AppState,
    pub scheduler: JobScheduler,
    pub pipeline: Arc<PipelineContext>,
    base_path: String,
    max_post_size: u64,
    tasks: JoinSet<()>,
    shutdown: CancellationToken,
}

impl Portal {
    pub async fn build(
        config: &AppConfig,
        db: SqlitePool,
        buffer: Arc<dyn ObjectBackend>,
        durable: Arc<dyn ObjectBackend>,
    ) -> Result<Self> {
        let protocol: Arc<dyn StorageProtocol> = Arc::new(S5Protocol);
        let hasher: Arc<dyn ContentHasher> = Arc::new(DefaultHasher::default());

        buffer
            .create_bucket_if_not_exists(&config.upload.buffer_bucket)
            .await
            .context("creating buffer bucket")?;
        durable
            .create_bucket_if_not_exists(protocol.name())
            .await
            .context("creating durable bucket")?;

        let lock_store: Arc<dyn LockStore> = match config.lock.mode {
            LockerMode::Db => Arc::new(DbLockStore::new(db.clone())),
            LockerMode::Memory => Arc::new(MemoryLockStore::new()),
        };
        let locks = DistributedLock::new(lock_store, config.lock.clone());

        let partials = PartialUploads::new(db.clone());
        let requests = RequestService::new(db.clone());
        let chunked = ChunkedUploadDataHandler::new(db.clone());
        let uploads = UploadService::new(db.clone());
        let upload_buffer = UploadBuffer::new(
            buffer.clone(),
            &config.upload.buffer_bucket,
            partials.clone(),
            config.upload.buffer_part_size,
        );

        let pipeline = Arc::new(PipelineContext {
            requests: requests.clone(),
            chunked: chunked.clone(),
            uploads: uploads.clone(),
            buffer: upload_buffer.clone(),
            durable: durable.clone(),
            transfer: MultipartTransfer::new(durable.clone(), partials, config.transfer.clone()),
            hasher: hasher.clone(),
            protocol: protocol.clone(),
            locks: locks.clone(),
            settings: config.pipeline.clone(),
        });

        let mut registry = TaskRegistry::new();
        register_pipeline(&mut registry, pipeline.clone()).context("registering pipeline")?;
        let scheduler = JobScheduler::new(
            db.clone(),
            registry,
            Some(locks.clone()),
            config.scheduler.clone(),
        );

        let verifier = Arc::new(DefaultUploadVerifier::new(
            uploads,
            hasher.algorithm(),
            config.upload.max_upload_size,
        ));
        let mut tasks = JoinSet::new();
        let shutdown = CancellationToken::new();
        let handler = ChunkedUploadHandler::start(
            ChunkedUploadDeps {
                buffer: upload_buffer,
                requests,
                chunked,
                scheduler: scheduler.clone(),
                verifier,
                protocol,
                locks,
            },
            config.upload.clone(),
            &mut tasks,
            shutdown.clone(),
        );

        let files = FileService::new(pipeline.clone(), config.upload.max_post_size);

        Ok(Self {
            state: AppState {
                db,
                uploads: handler,
                files,
                buffer,
                durable,
            },
            scheduler,
            pipeline,
            base_path: config.upload.base_path.clone(),
            max_post_size: config.upload.max_post_size,
            tasks,
            shutdown,
        })
    }

    /// Re-attach persisted jobs and make sure maintenance is scheduled.
    pub async fn start(&self) -> Result<()> {
        let attached = self.scheduler.start().await.context("starting scheduler")?;
        schedule_maintenance(&self.scheduler, &self.pipeline.settings)
            .await
            .context("scheduling maintenance")?;
        info!(attached, "portal started");
        Ok(())
    }

    pub fn router(&self) -> Router {
        routes::routes::routes(&self.base_path, self.max_post_size).with_state(self.state.clone())
    }

    /// Stop the scheduler and drain the event workers.
    pub async fn shutdown(mut self) {
        self.scheduler.shutdown();
        self.shutdown.cancel();
        while self.tasks.join_next().await.is_some() {}
    }
}
