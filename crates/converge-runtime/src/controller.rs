//! Reconcile workers
//!
//! A [`ReconcileLoop`] runs a fixed pool of workers for the duration of one
//! leadership term. Each worker takes a key from the [`WorkQueue`], reads the
//! newest cached object for it, hands both to the [`Reconciler`] and turns
//! the result into a queue transition:
//!
//! | Result                | Queue                                    |
//! |-----------------------|------------------------------------------|
//! | `Ok(Done)`            | `forget`, `done`                         |
//! | `Ok(RequeueAfter(d))` | `forget`, `done`, `add_after(d)`         |
//! | `Err(Transient)`      | `done`, `add_rate_limited`               |
//! | `Err(Conflict)`       | `done`, `add` (attempts unchanged)       |
//! | `Err(NotFound)`       | `forget`, `done`                         |
//! | `Err(Permanent)`      | `forget`, `done`, logged, not retried    |

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::cache::{CachedObject, Store};
use crate::key::ResourceKey;
use crate::metrics;
use crate::shutdown::ShutdownSignal;
use crate::workqueue::WorkQueue;

/// Default time in-flight reconciliations may keep running after a term ends.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// What to do with a key after a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged; wait for the next change.
    Done,
    /// Converged for now; look again after the delay.
    RequeueAfter(Duration),
}

impl Action {
    pub fn done() -> Self {
        Self::Done
    }

    pub fn requeue(delay: Duration) -> Self {
        Self::RequeueAfter(delay)
    }
}

/// Failure classification. The class, not the message, decides the retry.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// May succeed later; retried with backoff, indefinitely.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Lost an optimistic write race; retried at once.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// The object disappeared; nothing left to converge.
    #[error("not found: {0}")]
    NotFound(String),

    /// Will not recover without a change to the object.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl ReconcileError {
    pub fn transient(reason: impl std::fmt::Display) -> Self {
        Self::Transient(reason.to_string())
    }

    pub fn permanent(reason: impl std::fmt::Display) -> Self {
        Self::Permanent(reason.to_string())
    }

    fn outcome(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Permanent(_) => "permanent",
        }
    }
}

pub type ReconcileResult = Result<Action, ReconcileError>;

/// Resource-specific convergence logic.
///
/// Must be idempotent: the same key can be reconciled any number of times,
/// and a reconciliation may be aborted part way and run again. `object` is
/// `None` when the resource is no longer in the cache.
#[async_trait]
pub trait Reconciler<T: Send + Sync + 'static>: Send + Sync + 'static {
    async fn reconcile(&self, key: &ResourceKey, object: Option<Arc<T>>) -> ReconcileResult;
}

/// Marks a dequeued key as finished if its reconciliation never completes,
/// e.g. because the worker was aborted, and queues it again.
struct InFlight {
    queue: WorkQueue,
    key: Option<ResourceKey>,
}

impl InFlight {
    fn new(queue: &WorkQueue, key: &ResourceKey) -> Self {
        Self {
            queue: queue.clone(),
            key: Some(key.clone()),
        }
    }

    fn complete(mut self) {
        self.key = None;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            warn!(key = %key, "Reconciliation interrupted, requeueing");
            self.queue.done(&key);
            self.queue.add(key);
        }
    }
}

/// Worker pool that drains a [`WorkQueue`] through a [`Reconciler`].
pub struct ReconcileLoop<T, R> {
    queue: WorkQueue,
    store: Store<T>,
    reconciler: Arc<R>,
    workers: usize,
    grace_period: Duration,
}

impl<T, R> Clone for ReconcileLoop<T, R> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            store: self.store.clone(),
            reconciler: Arc::clone(&self.reconciler),
            workers: self.workers,
            grace_period: self.grace_period,
        }
    }
}

impl<T, R> ReconcileLoop<T, R>
where
    T: Send + Sync + 'static,
    R: Reconciler<T>,
{
    pub fn new(queue: WorkQueue, store: Store<T>, reconciler: Arc<R>) -> Self {
        Self {
            queue,
            store,
            reconciler,
            workers: 1,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Number of concurrent workers; at least one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Run the workers for one term.
    ///
    /// Returns once `term` has fired and every in-flight reconciliation has
    /// finished or was aborted after the grace period, or earlier if the
    /// queue shuts down and all workers exit.
    pub async fn run_term(&self, term: ShutdownSignal) {
        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            workers.spawn(self.clone().worker(id, term.clone()));
        }
        info!(workers = self.workers, "Reconcile workers started");

        let all_exited = drain(&mut workers);
        tokio::select! {
            _ = term.triggered() => {}
            _ = all_exited => {
                info!("Reconcile workers exited");
                return;
            }
        }

        debug!(
            in_flight = workers.len(),
            grace_ms = self.grace_period.as_millis() as u64,
            "Term ended, waiting for in-flight reconciliations"
        );
        let grace = tokio::time::sleep(self.grace_period);
        tokio::pin!(grace);
        tokio::select! {
            _ = drain(&mut workers) => {}
            _ = &mut grace => {
                warn!(
                    aborted = workers.len(),
                    "Grace period elapsed, aborting in-flight reconciliations"
                );
                workers.abort_all();
                drain(&mut workers).await;
            }
        }
        info!("Reconcile workers stopped");
    }

    async fn worker(self, id: usize, term: ShutdownSignal) {
        loop {
            let key = tokio::select! {
                biased;
                _ = term.triggered() => break,
                key = self.queue.get() => key,
            };
            let Some(key) = key else {
                break;
            };
            if term.is_triggered() {
                // Dequeued as the term ended: hand it back untouched.
                self.queue.done(&key);
                self.queue.add(key);
                break;
            }
            self.process(id, key).await;
        }
        debug!(worker = id, "Reconcile worker stopped");
    }

    async fn process(&self, worker: usize, key: ResourceKey) {
        let guard = InFlight::new(&self.queue, &key);
        let cached = self.store.get(&key);
        let version = cached.as_ref().map(|obj| obj.version().get());
        let object = cached.map(CachedObject::into_payload);

        let span = info_span!("reconcile", key = %key, version, worker);
        let started = Instant::now();
        let result = AssertUnwindSafe(self.reconciler.reconcile(&key, object))
            .catch_unwind()
            .instrument(span.clone())
            .await
            .unwrap_or_else(|_| Err(ReconcileError::transient("reconciler panicked")));

        let outcome = span.in_scope(|| self.settle(&key, result));
        metrics::record_reconcile(outcome, started.elapsed());
        guard.complete();
    }

    /// Apply the queue transition for `result`; returns the metric label.
    fn settle(&self, key: &ResourceKey, result: ReconcileResult) -> &'static str {
        match result {
            Ok(Action::Done) => {
                self.queue.forget(key);
                self.queue.done(key);
                debug!("Reconciled");
                "success"
            }
            Ok(Action::RequeueAfter(delay)) => {
                self.queue.forget(key);
                self.queue.done(key);
                self.queue.add_after(key.clone(), delay);
                debug!(delay_ms = delay.as_millis() as u64, "Reconciled, requeue requested");
                "success"
            }
            Err(e @ ReconcileError::Transient(_)) => {
                self.queue.done(key);
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(
                    error = %e,
                    attempt = self.queue.num_requeues(key),
                    delay_ms = delay.as_millis() as u64,
                    "Reconcile failed, will retry"
                );
                e.outcome()
            }
            Err(e @ ReconcileError::Conflict(_)) => {
                self.queue.done(key);
                self.queue.add(key.clone());
                debug!(error = %e, "Write conflict, requeueing");
                e.outcome()
            }
            Err(e @ ReconcileError::NotFound(_)) => {
                self.queue.forget(key);
                self.queue.done(key);
                debug!(error = %e, "Object gone, nothing to do");
                e.outcome()
            }
            Err(e @ ReconcileError::Permanent(_)) => {
                self.queue.forget(key);
                self.queue.done(key);
                error!(error = %e, "Permanent reconcile failure, waiting for a change");
                e.outcome()
            }
        }
    }
}

async fn drain(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "Reconcile worker panicked");
            }
        }
    }
}
