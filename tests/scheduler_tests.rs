mod common;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use upload_portal::{
    config::{LockSettings, SchedulerSettings},
    db,
    models::job::JobDefinition,
    services::{
        locker::{DbLockStore, DistributedLock},
        scheduler::{JobContext, JobScheduler, SchedulerError, Task, TaskRegistry},
    },
};

#[derive(Serialize, Deserialize)]
struct CountArgs {
    label: String,
}

struct Counter(Arc<AtomicUsize>);

#[async_trait]
impl Task for Counter {
    type Args = CountArgs;

    async fn run(&self, args: CountArgs, _ctx: JobContext) -> anyhow::Result<()> {
        anyhow::ensure!(!args.label.is_empty(), "empty label");
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn scheduler(dir: &TempDir, runs: Arc<AtomicUsize>) -> JobScheduler {
    let db = common::test_db(dir).await;
    let mut registry = TaskRegistry::new();
    registry
        .register("count", Counter(runs), JobDefinition::delayed(Duration::from_millis(200)))
        .unwrap();
    JobScheduler::new(db, registry, None, SchedulerSettings::default())
}

fn args(label: &str) -> CountArgs {
    CountArgs {
        label: label.to_string(),
    }
}

#[tokio::test]
async fn identical_jobs_are_created_once() {
    let dir = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = scheduler(&dir, runs.clone()).await;
    let tags = vec!["session:1".to_string()];

    let first = scheduler
        .create_job_if_not_exists("count", &args("a"), &tags)
        .await
        .unwrap();
    let second = scheduler
        .create_job_if_not_exists("count", &args("a"), &tags)
        .await
        .unwrap();
    assert!(first.is_some());
    assert!(second.is_none());
    assert!(matches!(
        scheduler.create_job("count", &args("a"), &tags).await,
        Err(SchedulerError::AlreadyExists(_))
    ));

    // different tags make a different job
    let other = scheduler
        .create_job_if_not_exists("count", &args("a"), &["session:2".to_string()])
        .await
        .unwrap();
    assert!(other.is_some());
    assert_eq!(scheduler.list_jobs().await.unwrap().len(), 2);

    scheduler.shutdown();
}

#[tokio::test]
async fn one_time_record_is_removed_after_its_run() {
    let dir = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = scheduler(&dir, runs.clone()).await;

    let id = scheduler
        .create_job_scheduled("count", &args("now"), &[], JobDefinition::OneTime)
        .await
        .unwrap()
        .unwrap();

    let removed = common::wait_for(Duration::from_secs(3), || {
        let scheduler = scheduler.clone();
        async move { scheduler.get_job(id).await.unwrap().is_none() }
    })
    .await;
    assert!(removed);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    scheduler.shutdown();
}

#[tokio::test]
async fn recurring_job_keeps_running() {
    let dir = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = scheduler(&dir, runs.clone()).await;

    let id = scheduler
        .create_job_scheduled(
            "count",
            &args("tick"),
            &["maintenance".to_string()],
            JobDefinition::every(Duration::from_millis(30)),
        )
        .await
        .unwrap()
        .unwrap();

    let ticked = common::wait_for(Duration::from_secs(3), || {
        let runs = runs.clone();
        async move { runs.load(Ordering::SeqCst) >= 3 }
    })
    .await;
    assert!(ticked);
    assert!(scheduler.get_job(id).await.unwrap().is_some());
    scheduler.shutdown();
}

#[tokio::test]
async fn persisted_jobs_run_after_restart() {
    let dir = TempDir::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let before = scheduler(&dir, runs.clone()).await;
    before
        .create_job_if_not_exists("count", &args("survivor"), &[])
        .await
        .unwrap();
    // stop before the delay elapses
    before.shutdown();
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let after = scheduler(&dir, runs.clone()).await;
    assert_eq!(after.start().await.unwrap(), 1);
    let ran = common::wait_for(Duration::from_secs(3), || {
        let runs = runs.clone();
        async move { runs.load(Ordering::SeqCst) == 1 }
    })
    .await;
    assert!(ran);
    after.shutdown();
}

#[tokio::test]
async fn unknown_tasks_and_bad_arguments_are_refused() {
    let dir = TempDir::new().unwrap();
    let scheduler = scheduler(&dir, Arc::new(AtomicUsize::new(0))).await;

    assert!(matches!(
        scheduler.create_job("missing", &args("x"), &[]).await,
        Err(SchedulerError::UnknownTask(_))
    ));
    assert!(matches!(
        scheduler
            .create_job("count", &serde_json::json!({ "unexpected": 1 }), &[])
            .await,
        Err(SchedulerError::InvalidArgs { .. })
    ));
    assert!(scheduler.list_jobs().await.unwrap().is_empty());
}

/// Counts runs and the most runs in flight at once.
#[derive(Clone, Default)]
struct Tally {
    runs: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct Slow(Tally);

#[async_trait]
impl Task for Slow {
    type Args = CountArgs;

    async fn run(&self, _args: CountArgs, _ctx: JobContext) -> anyhow::Result<()> {
        let tally = &self.0;
        let now = tally.running.fetch_add(1, Ordering::SeqCst) + 1;
        tally.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        tally.running.fetch_sub(1, Ordering::SeqCst);
        tally.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One node of a cluster sharing the database at `dir`.
async fn node(dir: &TempDir, tally: Tally) -> JobScheduler {
    let url = format!("sqlite://{}", dir.path().join("portal.db").display());
    let pool = db::connect(&url, 4).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let mut registry = TaskRegistry::new();
    registry
        .register("slow", Slow(tally), JobDefinition::delayed(Duration::from_millis(200)))
        .unwrap();
    let locks = DistributedLock::new(
        Arc::new(DbLockStore::new(pool.clone())),
        LockSettings::default(),
    );
    JobScheduler::new(
        pool,
        registry,
        Some(locks),
        SchedulerSettings {
            cluster_enabled: true,
            poll_interval: Duration::from_millis(50),
            ..SchedulerSettings::default()
        },
    )
}

#[tokio::test]
async fn clustered_nodes_never_run_a_job_twice() {
    let dir = TempDir::new().unwrap();
    let tally = Tally::default();
    let first = node(&dir, tally.clone()).await;
    let second = node(&dir, tally.clone()).await;
    first.start().await.unwrap();
    second.start().await.unwrap();

    let id = first
        .create_job_scheduled("slow", &args("once"), &[], JobDefinition::OneTime)
        .await
        .unwrap()
        .unwrap();

    let removed = common::wait_for(Duration::from_secs(5), || {
        let first = first.clone();
        async move { first.get_job(id).await.unwrap().is_none() }
    })
    .await;
    assert!(removed);
    // give the second node a few more polls
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(tally.runs.load(Ordering::SeqCst), 1);
    assert_eq!(tally.peak.load(Ordering::SeqCst), 1);
    first.shutdown();
    second.shutdown();
}

#[tokio::test]
async fn clustered_node_picks_up_jobs_created_elsewhere() {
    let dir = TempDir::new().unwrap();
    let creator_tally = Tally::default();
    let worker_tally = Tally::default();
    let creator = node(&dir, creator_tally.clone()).await;
    let worker = node(&dir, worker_tally.clone()).await;
    worker.start().await.unwrap();

    creator
        .create_job_if_not_exists("slow", &args("handoff"), &[])
        .await
        .unwrap()
        .unwrap();
    // the creating node goes away before the delay elapses
    creator.shutdown();

    let ran = common::wait_for(Duration::from_secs(5), || {
        let runs = worker_tally.runs.clone();
        async move { runs.load(Ordering::SeqCst) == 1 }
    })
    .await;
    assert!(ran);
    assert_eq!(creator_tally.runs.load(Ordering::SeqCst), 0);
    let cleared = common::wait_for(Duration::from_secs(3), || {
        let worker = worker.clone();
        async move { worker.list_jobs().await.unwrap().is_empty() }
    })
    .await;
    assert!(cleared);
    worker.shutdown();
}
