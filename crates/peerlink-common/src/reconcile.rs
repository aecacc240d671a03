//! Reconciler trait and the controller loop that drives it.
//!
//! A controller owns one [`WorkQueue`] of resource keys. Each key is
//! reconciled against the full desired state of that resource; failures are
//! requeued with per-key exponential backoff when retryable and dropped
//! (after logging) otherwise.

use async_trait::async_trait;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::error::PeerlinkResult;
use crate::workqueue::WorkQueue;

/// Outcome of a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Requeue {
    /// Nothing further to do until the next trigger.
    #[default]
    Done,
    /// Look at the key again after the given delay.
    After(Duration),
}

/// A level-triggered reconciler for one resource type.
///
/// `reconcile` must recompute the desired state of `key` from scratch; it
/// may be called any number of times for the same key.
#[async_trait]
pub trait Reconciler: Send + Sync {
    type Key: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static;

    /// Returns the name of this reconciler (for logging).
    fn name(&self) -> &str;

    async fn reconcile(&self, key: &Self::Key) -> PeerlinkResult<Requeue>;
}

/// Drives a [`Reconciler`] from a work queue until cancelled.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<R::Key>>,
    backoff: Backoff<R::Key>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            reconciler,
            queue: Arc::new(WorkQueue::new()),
            backoff: Backoff::new(base_delay, max_delay),
        }
    }

    /// Handle used by watchers to enqueue keys.
    pub fn queue(&self) -> Arc<WorkQueue<R::Key>> {
        Arc::clone(&self.queue)
    }

    /// Processes a single key. Exposed for tests that step the loop manually.
    pub async fn process(&self, key: R::Key) {
        let name = self.reconciler.name();
        match self.reconciler.reconcile(&key).await {
            Ok(requeue) => {
                self.backoff.forget(&key);
                if let Requeue::After(delay) = requeue {
                    debug!(controller = name, key = %key, ?delay, "Requeue requested");
                    self.queue.add_after(key.clone(), delay);
                }
            }
            Err(e) if e.is_retryable() => {
                let delay = self.backoff.next_delay(&key);
                warn!(
                    controller = name,
                    key = %key,
                    error = %e,
                    retry_in = ?delay,
                    "Reconcile failed, will retry"
                );
                self.queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                self.backoff.forget(&key);
                error!(controller = name, key = %key, error = %e, "Reconcile failed permanently");
            }
        }
        self.queue.done(&key);
    }

    /// Runs the loop, one key at a time, until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let name = self.reconciler.name().to_string();
        info!(controller = %name, "Controller started");
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => break,
                key = self.queue.next() => key,
            };
            self.process(key).await;
        }
        info!(controller = %name, "Controller stopped");
    }
}
