//! Cooperative distributed mutual exclusion.
//!
//! A [`DistributedLock`] drives the acquire/poll/release protocol on top of a
//! [`LockStore`]. Acquisition is one atomic "insert, or take over if expired"
//! write; a busy acquirer flags the record with `release_requested` and polls
//! again. The holder runs a ticker that renews the lease and, once it sees the
//! flag, calls the release callback so it can wind down on its own terms.
//!
//! [`DbLockStore`] keeps records in the shared database and works across
//! nodes. [`MemoryLockStore`] keeps leases in-process for single-node
//! deployments.

use crate::{config::LockSettings, models::lock::LockRecord};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    /// Still held by someone else when the wait ran out.
    #[error("lock `{0}` is busy")]
    Busy(String),
    /// The caller gave up while waiting.
    #[error("timed out waiting for lock `{0}`")]
    Timeout(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// What the holder-side ticker observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderState {
    Held,
    ReleaseRequested,
    /// The record is gone or belongs to someone else.
    Lost,
}

/// Storage for lock records.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Atomically create the record, or take it over if it expired.
    async fn try_lock(&self, lock_id: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Flag the current holder's record.
    async fn request_release(&self, lock_id: &str) -> Result<(), LockError>;

    /// Report the holder's state and extend its lease while it is undisturbed.
    async fn heartbeat(
        &self,
        lock_id: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<HolderState, LockError>;

    /// Delete the record if `token` still holds it.
    async fn unlock(&self, lock_id: &str, token: &str) -> Result<(), LockError>;

    /// Delete the record whoever holds it.
    async fn purge(&self, lock_id: &str) -> Result<(), LockError>;

    async fn get(&self, lock_id: &str) -> Result<Option<LockRecord>, LockError>;
}

pub type ReleaseCallback = Arc<dyn Fn() + Send + Sync>;

/// Per-call acquisition options.
#[derive(Clone)]
pub struct AcquireOptions {
    /// Zero means a single attempt.
    pub timeout: Duration,
    pub cancel: Option<CancellationToken>,
    /// Invoked at most once when another party asks for the lock.
    pub on_release_requested: Option<ReleaseCallback>,
    /// Ask a busy holder to release. Job runners turn this off so that
    /// scanning nodes do not disturb a running job.
    pub request_release: bool,
}

impl AcquireOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: None,
            on_release_requested: None,
            request_release: true,
        }
    }

    pub fn single_attempt() -> Self {
        Self::with_timeout(Duration::ZERO)
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn on_release_requested(mut self, callback: ReleaseCallback) -> Self {
        self.on_release_requested = Some(callback);
        self
    }

    pub fn without_release_request(mut self) -> Self {
        self.request_release = false;
        self
    }
}

/// Proof of ownership. Pass it back to [`DistributedLock::release`].
pub struct LockHandle {
    lock_id: String,
    token: String,
    release_requested: CancellationToken,
    stop: CancellationToken,
    ticker: Option<JoinHandle<()>>,
}

impl LockHandle {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// Cancelled once another party asked for this lock.
    pub fn release_requested(&self) -> CancellationToken {
        self.release_requested.clone()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("lock_id", &self.lock_id)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    settings: LockSettings,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, settings: LockSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Acquire `lock_id`, polling until success, timeout or cancellation.
    ///
    /// Running out of time yields [`LockError::Busy`]. Cancellation yields
    /// [`LockError::Timeout`] and leaves the holder's record flagged, so the
    /// holder still observes the request and winds down.
    pub async fn acquire(
        &self,
        lock_id: &str,
        options: AcquireOptions,
    ) -> Result<LockHandle, LockError> {
        let token = format!("{}-{}", std::process::id(), Uuid::new_v4());
        let deadline = Instant::now() + options.timeout;
        let cancel = options.cancel.clone().unwrap_or_default();

        loop {
            if self.store.try_lock(lock_id, &token, self.settings.ttl).await? {
                debug!(lock_id, "lock acquired");
                return Ok(self.start_holder(lock_id, token, options.on_release_requested));
            }

            if options.request_release {
                self.store.request_release(lock_id).await?;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(lock_id, "lock busy");
                return Err(LockError::Busy(lock_id.to_string()));
            }
            let wait = self.settings.acquirer_poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    if options.request_release {
                        self.store.request_release(lock_id).await?;
                    }
                    return Err(LockError::Timeout(lock_id.to_string()));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Stop the holder ticker and delete the record.
    pub async fn release(&self, mut handle: LockHandle) -> Result<(), LockError> {
        handle.stop.cancel();
        if let Some(ticker) = handle.ticker.take() {
            let _ = ticker.await;
        }
        self.store.unlock(&handle.lock_id, &handle.token).await?;
        debug!(lock_id = %handle.lock_id, "lock released");
        Ok(())
    }

    /// Remove a lock record regardless of holder.
    pub async fn purge(&self, lock_id: &str) -> Result<(), LockError> {
        self.store.purge(lock_id).await
    }

    pub async fn record(&self, lock_id: &str) -> Result<Option<LockRecord>, LockError> {
        self.store.get(lock_id).await
    }

    fn start_holder(
        &self,
        lock_id: &str,
        token: String,
        callback: Option<ReleaseCallback>,
    ) -> LockHandle {
        let stop = CancellationToken::new();
        let release_requested = CancellationToken::new();
        let ticker = tokio::spawn(holder_ticker(
            self.store.clone(),
            lock_id.to_string(),
            token.clone(),
            self.settings.clone(),
            stop.clone(),
            release_requested.clone(),
            callback,
        ));
        LockHandle {
            lock_id: lock_id.to_string(),
            token,
            release_requested,
            stop,
            ticker: Some(ticker),
        }
    }
}

async fn holder_ticker(
    store: Arc<dyn LockStore>,
    lock_id: String,
    token: String,
    settings: LockSettings,
    stop: CancellationToken,
    release_requested: CancellationToken,
    callback: Option<ReleaseCallback>,
) {
    let mut interval = tokio::time::interval(settings.holder_poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = interval.tick() => {}
        }

        match store.heartbeat(&lock_id, &token, settings.ttl).await {
            Ok(HolderState::Held) => {}
            Ok(state) => {
                debug!(lock_id, ?state, "lock holder asked to release");
                release_requested.cancel();
                if let Some(callback) = &callback {
                    callback();
                }
                return;
            }
            Err(err) => warn!(lock_id, error = %err, "lock heartbeat failed"),
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lock records in the shared SQLite database.
#[derive(Clone)]
pub struct DbLockStore {
    db: SqlitePool,
}

impl DbLockStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LockStore for DbLockStore {
    async fn try_lock(&self, lock_id: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO lock_records (
                lock_id, holder_pid, holder_token, acquired_at, expires_at, release_requested
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0)
            ON CONFLICT(lock_id) DO UPDATE SET
                holder_pid = excluded.holder_pid,
                holder_token = excluded.holder_token,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at,
                release_requested = 0
            WHERE lock_records.expires_at <= ?4
            "#,
        )
        .bind(lock_id)
        .bind(i64::from(std::process::id()))
        .bind(token)
        .bind(now)
        .bind(now + ttl.as_millis() as i64)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn request_release(&self, lock_id: &str) -> Result<(), LockError> {
        sqlx::query("UPDATE lock_records SET release_requested = 1 WHERE lock_id = ?")
            .bind(lock_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn heartbeat(
        &self,
        lock_id: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<HolderState, LockError> {
        let renewed = sqlx::query(
            "UPDATE lock_records SET expires_at = ?
             WHERE lock_id = ? AND holder_token = ? AND release_requested = 0",
        )
        .bind(now_millis() + ttl.as_millis() as i64)
        .bind(lock_id)
        .bind(token)
        .execute(&self.db)
        .await?;
        if renewed.rows_affected() == 1 {
            return Ok(HolderState::Held);
        }

        let still_ours: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM lock_records WHERE lock_id = ? AND holder_token = ?",
        )
        .bind(lock_id)
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        Ok(if still_ours.is_some() {
            HolderState::ReleaseRequested
        } else {
            HolderState::Lost
        })
    }

    async fn unlock(&self, lock_id: &str, token: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM lock_records WHERE lock_id = ? AND holder_token = ?")
            .bind(lock_id)
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn purge(&self, lock_id: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM lock_records WHERE lock_id = ?")
            .bind(lock_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn get(&self, lock_id: &str) -> Result<Option<LockRecord>, LockError> {
        Ok(sqlx::query_as::<_, LockRecord>(
            "SELECT lock_id, holder_pid, holder_token, acquired_at, expires_at, release_requested
             FROM lock_records WHERE lock_id = ?",
        )
        .bind(lock_id)
        .fetch_optional(&self.db)
        .await?)
    }
}

/// Process-local leases.
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    records: Arc<Mutex<HashMap<String, LockRecord>>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_lock(&self, lock_id: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = now_millis();
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(lock_id) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        records.insert(
            lock_id.to_string(),
            LockRecord {
                lock_id: lock_id.to_string(),
                holder_pid: i64::from(std::process::id()),
                holder_token: token.to_string(),
                acquired_at: now,
                expires_at: now + ttl.as_millis() as i64,
                release_requested: false,
            },
        );
        Ok(true)
    }

    async fn request_release(&self, lock_id: &str) -> Result<(), LockError> {
        if let Some(record) = self.records.lock().await.get_mut(lock_id) {
            record.release_requested = true;
        }
        Ok(())
    }

    async fn heartbeat(
        &self,
        lock_id: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<HolderState, LockError> {
        let mut records = self.records.lock().await;
        Ok(match records.get_mut(lock_id) {
            Some(record) if record.holder_token == token => {
                if record.release_requested {
                    HolderState::ReleaseRequested
                } else {
                    record.expires_at = now_millis() + ttl.as_millis() as i64;
                    HolderState::Held
                }
            }
            _ => HolderState::Lost,
        })
    }

    async fn unlock(&self, lock_id: &str, token: &str) -> Result<(), LockError> {
        let mut records = self.records.lock().await;
        if records
            .get(lock_id)
            .is_some_and(|record| record.holder_token == token)
        {
            records.remove(lock_id);
        }
        Ok(())
    }

    async fn purge(&self, lock_id: &str) -> Result<(), LockError> {
        self.records.lock().await.remove(lock_id);
        Ok(())
    }

    async fn get(&self, lock_id: &str) -> Result<Option<LockRecord>, LockError> {
        Ok(self.records.lock().await.get(lock_id).cloned())
    }
}
