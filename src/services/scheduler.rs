//! Durable, tag-deduplicated job scheduling.
//!
//! Tasks are registered once on a [`TaskRegistry`] and the registry is handed
//! to [`JobScheduler::new`]. Every job is a [`JobRecord`] row first and a
//! running future second, so a restart re-attaches whatever was queued.
//!
//! The scheduler never retries. After a run (success, failure or panic) a
//! one-time record is deleted and a recurring one is re-armed; stages that
//! want another attempt enqueue a new job themselves. In clustered mode each
//! run holds the distributed lock `job:<uuid>`, so two nodes never execute the
//! same record at once.
//!
//! Recurring records keep one timer per node. The lock only keeps runs from
//! overlapping, so a cluster of N nodes runs an `Every` job up to N times per
//! interval; recurring tasks must be idempotent.

use crate::{
    config::SchedulerSettings,
    db::is_unique_violation,
    models::job::{JobDefinition, JobRecord, encode_tags},
    services::locker::{AcquireOptions, DistributedLock, LockError},
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use sqlx::SqlitePool;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task `{0}` is not registered")]
    UnknownTask(String),
    #[error("task `{0}` is already registered")]
    DuplicateTask(String),
    #[error("an identical `{0}` job already exists")]
    AlreadyExists(String),
    #[error("arguments do not match task `{function}`: {source}")]
    InvalidArgs {
        function: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt job record {uuid}: {source}")]
    CorruptRecord {
        uuid: Uuid,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Handed to every task run.
#[derive(Clone)]
pub struct JobContext {
    pub scheduler: JobScheduler,
    pub job_id: Uuid,
    pub function: String,
}

/// A named, independently schedulable unit of work.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    type Args: Serialize + DeserializeOwned + Send + 'static;

    async fn run(&self, args: Self::Args, ctx: JobContext) -> anyhow::Result<()>;
}

#[async_trait]
trait ErasedTask: Send + Sync {
    fn check_args(&self, function: &str, args: &str) -> Result<(), SchedulerError>;

    /// The outer error is a contract violation, the inner one a task failure.
    async fn run_json(
        &self,
        args: &str,
        ctx: JobContext,
    ) -> Result<anyhow::Result<()>, SchedulerError>;
}

struct TaskAdapter<T>(T);

#[async_trait]
impl<T: Task> ErasedTask for TaskAdapter<T> {
    fn check_args(&self, function: &str, args: &str) -> Result<(), SchedulerError> {
        serde_json::from_str::<T::Args>(args)
            .map(|_| ())
            .map_err(|source| SchedulerError::InvalidArgs {
                function: function.to_string(),
                source,
            })
    }

    async fn run_json(
        &self,
        args: &str,
        ctx: JobContext,
    ) -> Result<anyhow::Result<()>, SchedulerError> {
        let parsed = serde_json::from_str::<T::Args>(args).map_err(|source| {
            SchedulerError::InvalidArgs {
                function: ctx.function.clone(),
                source,
            }
        })?;
        Ok(self.0.run(parsed, ctx).await)
    }
}

struct RegisteredTask {
    handler: Arc<dyn ErasedTask>,
    definition: JobDefinition,
}

/// Name → task table, built once at startup.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` under `name`. `definition` is the schedule used by
    /// [`JobScheduler::create_job`].
    pub fn register<T: Task>(
        &mut self,
        name: &str,
        task: T,
        definition: JobDefinition,
    ) -> Result<(), SchedulerError> {
        if self.tasks.contains_key(name) {
            return Err(SchedulerError::DuplicateTask(name.to_string()));
        }
        self.tasks.insert(
            name.to_string(),
            RegisteredTask {
                handler: Arc::new(TaskAdapter(task)),
                definition,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}

enum RunOutcome {
    /// The task ran (successfully or not) or panicked.
    Finished,
    /// Another node holds the job lock.
    Skipped,
    /// The record disappeared before the run.
    Gone,
    /// Unknown task or undecodable args; the record is kept for operators.
    ContractViolation,
}

#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    db: SqlitePool,
    tasks: HashMap<String, RegisteredTask>,
    lock: Option<DistributedLock>,
    settings: SchedulerSettings,
    permits: Arc<Semaphore>,
    attached: Mutex<HashSet<Uuid>>,
    shutdown: CancellationToken,
}

impl JobScheduler {
    /// `lock` enables distributed execution; it is required when
    /// `settings.cluster_enabled` is set.
    pub fn new(
        db: SqlitePool,
        registry: TaskRegistry,
        lock: Option<DistributedLock>,
        settings: SchedulerSettings,
    ) -> Self {
        let lock = if settings.cluster_enabled { lock } else { None };
        Self {
            inner: Arc::new(Inner {
                db,
                tasks: registry.tasks,
                lock,
                permits: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
                settings,
                attached: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Re-attach every persisted record and, when clustered, start watching
    /// for records created by other nodes. Returns the number attached.
    pub async fn start(&self) -> Result<usize, SchedulerError> {
        let attached = self.attach_all().await?;
        info!(attached, "job scheduler started");

        if self.inner.lock.is_some() {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(scheduler.inner.settings.poll_interval);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = scheduler.inner.shutdown.cancelled() => return,
                        _ = interval.tick() => {}
                    }
                    if let Err(err) = scheduler.attach_all().await {
                        warn!(error = %err, "failed to poll job records");
                    }
                }
            });
        }
        Ok(attached)
    }

    /// Stop all schedule loops. Runs already in flight finish.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Persist a job and schedule it with its task's default definition.
    pub async fn create_job<A: Serialize + Sync>(
        &self,
        function: &str,
        args: &A,
        tags: &[String],
    ) -> Result<Uuid, SchedulerError> {
        let definition = self.registered(function)?.definition;
        let record = self.new_record(function, args, tags, definition)?;
        if !self.insert(&record).await? {
            return Err(SchedulerError::AlreadyExists(function.to_string()));
        }
        let uuid = record.uuid;
        debug!(job_id = %uuid, function, "job created");
        self.attach(record).await;
        Ok(uuid)
    }

    /// Create the job unless a record with the same function, args and tags
    /// exists. Returns the new id, or `None` when it was a duplicate.
    pub async fn create_job_if_not_exists<A: Serialize + Sync>(
        &self,
        function: &str,
        args: &A,
        tags: &[String],
    ) -> Result<Option<Uuid>, SchedulerError> {
        let definition = self.registered(function)?.definition;
        self.create_deduplicated(function, args, tags, definition)
            .await
    }

    /// Deduplicated creation with an explicit schedule, for deferred and
    /// recurring work.
    pub async fn create_job_scheduled<A: Serialize + Sync>(
        &self,
        function: &str,
        args: &A,
        tags: &[String],
        definition: JobDefinition,
    ) -> Result<Option<Uuid>, SchedulerError> {
        self.registered(function)?;
        self.create_deduplicated(function, args, tags, definition)
            .await
    }

    pub async fn get_job(&self, uuid: Uuid) -> Result<Option<JobRecord>, SchedulerError> {
        Ok(sqlx::query_as::<_, JobRecord>(
            "SELECT uuid, function, args, tags, definition, created_at
             FROM job_records WHERE uuid = ?",
        )
        .bind(uuid)
        .fetch_optional(&self.inner.db)
        .await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>, SchedulerError> {
        Ok(sqlx::query_as::<_, JobRecord>(
            "SELECT uuid, function, args, tags, definition, created_at
             FROM job_records ORDER BY created_at ASC",
        )
        .fetch_all(&self.inner.db)
        .await?)
    }

    fn registered(&self, function: &str) -> Result<&RegisteredTask, SchedulerError> {
        self.inner
            .tasks
            .get(function)
            .ok_or_else(|| SchedulerError::UnknownTask(function.to_string()))
    }

    fn new_record<A: Serialize + Sync>(
        &self,
        function: &str,
        args: &A,
        tags: &[String],
        definition: JobDefinition,
    ) -> Result<JobRecord, SchedulerError> {
        let args = serde_json::to_string(args)?;
        self.registered(function)?
            .handler
            .check_args(function, &args)?;
        Ok(JobRecord {
            uuid: Uuid::new_v4(),
            function: function.to_string(),
            args,
            tags: encode_tags(tags.iter().cloned()),
            definition: serde_json::to_string(&definition)?,
            created_at: Utc::now(),
        })
    }

    async fn insert(&self, record: &JobRecord) -> Result<bool, SchedulerError> {
        let result = sqlx::query(
            "INSERT INTO job_records (uuid, function, args, tags, definition, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(function, args, tags) DO NOTHING",
        )
        .bind(record.uuid)
        .bind(&record.function)
        .bind(&record.args)
        .bind(&record.tags)
        .bind(&record.definition)
        .bind(record.created_at)
        .execute(&self.inner.db)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_deduplicated<A: Serialize + Sync>(
        &self,
        function: &str,
        args: &A,
        tags: &[String],
        definition: JobDefinition,
    ) -> Result<Option<Uuid>, SchedulerError> {
        let record = self.new_record(function, args, tags, definition)?;
        if !self.insert(&record).await? {
            debug!(function, tags = %record.tags, "job already exists");
            return Ok(None);
        }
        let uuid = record.uuid;
        debug!(job_id = %uuid, function, "job created");
        self.attach(record).await;
        Ok(Some(uuid))
    }

    async fn attach_all(&self) -> Result<usize, SchedulerError> {
        let mut attached = 0;
        for record in self.list_jobs().await? {
            if self.attach(record).await {
                attached += 1;
            }
        }
        Ok(attached)
    }

    /// Start the schedule loop for `record` unless it is already running here.
    async fn attach(&self, record: JobRecord) -> bool {
        if !self.inner.attached.lock().await.insert(record.uuid) {
            return false;
        }
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.schedule_loop(record).await });
        true
    }

    async fn detach(&self, uuid: Uuid) {
        self.inner.attached.lock().await.remove(&uuid);
    }

    async fn schedule_loop(&self, record: JobRecord) {
        let uuid = record.uuid;
        let definition = match record.definition() {
            Ok(definition) => definition,
            Err(source) => {
                error!(
                    job_id = %uuid,
                    error = %SchedulerError::CorruptRecord { uuid, source },
                    "job record has an unreadable schedule"
                );
                return;
            }
        };

        match definition {
            JobDefinition::OneTime | JobDefinition::Delayed { .. } => {
                if let JobDefinition::Delayed { delay_ms } = definition {
                    let due = record.created_at + chrono::Duration::milliseconds(delay_ms as i64);
                    let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    if !self.sleep(wait).await {
                        return self.detach(uuid).await;
                    }
                }
                match self.execute(&record, true).await {
                    // the record went while the run still held its lock
                    RunOutcome::Finished => {}
                    RunOutcome::Skipped | RunOutcome::Gone => self.detach(uuid).await,
                    RunOutcome::ContractViolation => {}
                }
            }
            JobDefinition::Every { interval_ms } => loop {
                if !self.sleep(Duration::from_millis(interval_ms)).await {
                    return self.detach(uuid).await;
                }
                match self.execute(&record, false).await {
                    RunOutcome::Finished | RunOutcome::Skipped => {}
                    RunOutcome::Gone => return self.detach(uuid).await,
                    RunOutcome::ContractViolation => return,
                }
            },
        }
    }

    /// Returns false when the scheduler shut down first.
    async fn sleep(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    /// Run `record` once. A finished one-time record is deleted before the
    /// job lock is released, so no other node can pick it up again.
    async fn execute(&self, record: &JobRecord, one_time: bool) -> RunOutcome {
        let Ok(_permit) = self.inner.permits.clone().acquire_owned().await else {
            return RunOutcome::Skipped;
        };

        let handle = match &self.inner.lock {
            Some(lock) => {
                let options = AcquireOptions::single_attempt().without_release_request();
                match lock.acquire(&format!("job:{}", record.uuid), options).await {
                    Ok(handle) => Some(handle),
                    Err(LockError::Busy(_)) => {
                        debug!(job_id = %record.uuid, "job is running on another node");
                        return RunOutcome::Skipped;
                    }
                    Err(err) => {
                        warn!(job_id = %record.uuid, error = %err, "could not take job lock");
                        return RunOutcome::Skipped;
                    }
                }
            }
            None => None,
        };

        let outcome = self.run_locked(record).await;
        if one_time && matches!(outcome, RunOutcome::Finished) {
            self.delete_record(record.uuid).await;
        }

        if let (Some(lock), Some(handle)) = (&self.inner.lock, handle) {
            if let Err(err) = lock.release(handle).await {
                warn!(job_id = %record.uuid, error = %err, "failed to release job lock");
            }
        }
        outcome
    }

    async fn run_locked(&self, record: &JobRecord) -> RunOutcome {
        // another node may have finished it while we waited
        match self.get_job(record.uuid).await {
            Ok(Some(_)) => {}
            Ok(None) => return RunOutcome::Gone,
            Err(err) => {
                warn!(job_id = %record.uuid, error = %err, "failed to re-read job record");
                return RunOutcome::Skipped;
            }
        }

        let Some(task) = self.inner.tasks.get(&record.function) else {
            error!(
                job_id = %record.uuid,
                function = %record.function,
                "job references an unregistered task; record kept"
            );
            return RunOutcome::ContractViolation;
        };

        let ctx = JobContext {
            scheduler: self.clone(),
            job_id: record.uuid,
            function: record.function.clone(),
        };
        let handler = task.handler.clone();
        let args = record.args.clone();
        debug!(job_id = %record.uuid, function = %record.function, "job started");
        let joined = tokio::spawn(async move { handler.run_json(&args, ctx).await }).await;

        match joined {
            Ok(Ok(Ok(()))) => {
                debug!(job_id = %record.uuid, function = %record.function, "job finished");
                RunOutcome::Finished
            }
            Ok(Ok(Err(err))) => {
                error!(
                    job_id = %record.uuid,
                    function = %record.function,
                    error = ?err,
                    "job failed"
                );
                RunOutcome::Finished
            }
            Ok(Err(err)) => {
                error!(
                    job_id = %record.uuid,
                    function = %record.function,
                    error = %err,
                    "job arguments do not match the registered task; record kept"
                );
                RunOutcome::ContractViolation
            }
            Err(join_err) => {
                error!(
                    job_id = %record.uuid,
                    function = %record.function,
                    error = %join_err,
                    "job panicked"
                );
                RunOutcome::Finished
            }
        }
    }

    async fn delete_record(&self, uuid: Uuid) {
        if let Err(err) = sqlx::query("DELETE FROM job_records WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.inner.db)
            .await
        {
            warn!(job_id = %uuid, error = %err, "failed to delete job record");
        }
        self.detach(uuid).await;
    }
}
