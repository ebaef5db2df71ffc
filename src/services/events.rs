//! Bounded lifecycle event queues drained by a fixed pool of workers.

use crate::config::OverflowPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Consumes events of one kind.
#[async_trait]
pub trait EventHandler<E>: Send + Sync + 'static {
    async fn handle(&self, event: E) -> anyhow::Result<()>;
}

/// Events are handled concurrently by `workers` tasks, so handlers must not
/// rely on ordering between events.
pub struct EventQueue<E> {
    name: &'static str,
    sender: mpsc::Sender<E>,
    policy: OverflowPolicy,
}

impl<E> Clone for EventQueue<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sender: self.sender.clone(),
            policy: self.policy,
        }
    }
}

impl<E: Send + 'static> EventQueue<E> {
    /// Start `workers` consumers on `tasks`. They exit when `shutdown` fires
    /// or every sender is gone.
    pub fn start(
        name: &'static str,
        capacity: usize,
        workers: usize,
        policy: OverflowPolicy,
        handler: Arc<dyn EventHandler<E>>,
        tasks: &mut JoinSet<()>,
        shutdown: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        for _ in 0..workers.max(1) {
            let receiver = receiver.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                loop {
                    let next = {
                        let mut rx = receiver.lock().await;
                        tokio::select! {
                            _ = shutdown.cancelled() => None,
                            event = rx.recv() => event,
                        }
                    };
                    let Some(event) = next else { break };
                    if let Err(err) = handler.handle(event).await {
                        error!(queue = name, error = %err, "event handler failed");
                    }
                }
            });
        }

        Self {
            name,
            sender,
            policy,
        }
    }

    /// Enqueue `event` according to the overflow policy. Returns `false` if
    /// it was discarded.
    pub async fn dispatch(&self, event: E) -> bool {
        match self.policy {
            OverflowPolicy::Block => {
                if self.sender.send(event).await.is_err() {
                    warn!(queue = self.name, "event queue closed; event discarded");
                    return false;
                }
                true
            }
            OverflowPolicy::Drop => match self.sender.try_send(event) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(queue = self.name, "event queue full; event dropped");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(queue = self.name, "event queue closed; event discarded");
                    false
                }
            },
        }
    }
}
