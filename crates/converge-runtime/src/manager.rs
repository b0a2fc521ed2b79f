//! Assembly of one control loop.
//!
//! ```text
//!   ListWatch ──▶ ResourceWatcher ──keys──▶ forwarder ──add──▶ WorkQueue
//!                      │ Store                                   │
//!                      └───────────────▶ ReconcileLoop ◀─────────┘
//!                                             ▲ terms
//!                                      LeaderElector
//! ```
//!
//! Shutdown order: work stops first (watcher, forwarder, probes and the
//! current term), in-flight reconciliations get the grace period, and only
//! then does the elector step down and release the lease.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use kube::Resource;
use tokio::sync::{mpsc, watch};
use tokio::task::{Id, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::controller::{ReconcileLoop, Reconciler};
use crate::error::{ConfigError, Error, Result};
use crate::health::{self, HealthSignal, DEFAULT_HEARTBEAT_INTERVAL};
use crate::key::ResourceKey;
use crate::leader::{LeaderElector, LeadershipState, LeaseStore};
use crate::metrics;
use crate::registry::TypeRegistry;
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::watcher::{ListWatch, ResourceWatcher};
use crate::workqueue::WorkQueue;

/// Runs a watcher, work queue, reconcile loop, leader election and health
/// probes for a single resource type.
pub struct Manager<S, R> {
    config: ManagerConfig,
    source: S,
    reconciler: Arc<R>,
    lease_store: Option<Arc<dyn LeaseStore>>,
}

impl<S, R> Manager<S, R>
where
    S: ListWatch,
    S::Object: Resource<DynamicType = ()>,
    R: Reconciler<S::Object>,
{
    /// Fails if the watched type is not in `registry`.
    pub fn new(config: ManagerConfig, registry: &TypeRegistry, source: S, reconciler: R) -> Result<Self> {
        let gvk = registry.ensure_registered::<S::Object>()?;
        debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "Watched type registered");
        Ok(Self {
            config,
            source,
            reconciler: Arc::new(reconciler),
            lease_store: None,
        })
    }

    /// Lease storage used when leader election is enabled.
    pub fn with_lease_store(mut self, store: impl LeaseStore + 'static) -> Self {
        self.lease_store = Some(Arc::new(store));
        self
    }

    /// Run until `shutdown` fires or a component fails.
    ///
    /// Returns after in-flight reconciliations have finished or were aborted
    /// at the end of the grace period.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<()> {
        let Manager {
            config,
            source,
            reconciler,
            lease_store,
        } = self;

        let elector = match (config.leader_election.enabled(), lease_store) {
            (true, Some(store)) => Some(Arc::new(LeaderElector::new(
                store,
                config.leader_election.clone(),
            ))),
            (true, None) => {
                return Err(ConfigError::Invalid {
                    name: "lease_store",
                    reason: "leader election is enabled but no lease store was provided"
                        .to_string(),
                }
                .into())
            }
            (false, _) => None,
        };

        let stop = Shutdown::new();
        let election_stop = Shutdown::new();

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let watcher = ResourceWatcher::new(source, notify_tx);
        let store = watcher.store();
        let queue = WorkQueue::new(config.backoff);
        let control = ReconcileLoop::new(queue.clone(), store.clone(), reconciler)
            .with_workers(config.workers)
            .with_grace_period(config.shutdown_grace);

        let (leadership, _always_leader) = match &elector {
            Some(elector) => (elector.subscribe(), None),
            None => {
                let (tx, rx) = watch::channel(LeadershipState::Leader);
                (rx, Some(tx))
            }
        };
        let health = Arc::new(HealthSignal::new(store.sync_flag(), leadership));

        let (term_tx, term_rx) = mpsc::unbounded_channel();
        let mut tasks = Tasks::default();

        tasks.spawn("watcher", {
            let signal = stop.signal();
            async move {
                watcher.run(signal).await;
                Ok(())
            }
        });
        tasks.spawn("forwarder", forward_keys(notify_rx, queue.clone(), stop.signal()));
        tasks.spawn("heartbeat", {
            let health = Arc::clone(&health);
            let signal = stop.signal();
            async move {
                health.run_heartbeat(DEFAULT_HEARTBEAT_INTERVAL, signal).await;
                Ok(())
            }
        });
        tasks.spawn("health", {
            let addr = config.health_addr;
            let signal = stop.signal();
            async move {
                health::run_health_server(health, addr, signal)
                    .await
                    .map_err(Error::Health)
            }
        });
        tasks.spawn("reconciler", {
            let signal = stop.signal();
            async move {
                supervise_terms(control, term_rx, signal).await;
                Ok(())
            }
        });

        match elector {
            Some(elector) => {
                let signal = election_stop.signal();
                tasks.spawn("leader-election", async move {
                    elector
                        .run(
                            signal,
                            move |term| {
                                if term_tx.send(term).is_err() {
                                    warn!("Reconcile loop is gone, cannot start term");
                                }
                            },
                            || info!("Leadership lost, reconciliation halted"),
                        )
                        .await;
                    Ok(())
                });
            }
            None => {
                info!("Leader election disabled, leading until shutdown");
                metrics::set_leader(true);
                // A single term that lasts until shutdown.
                let _ = term_tx.send(stop.signal());
            }
        }

        info!(
            workers = config.workers,
            leader_election = config.leader_election.enabled(),
            "Manager started"
        );

        let mut failure: Option<Error> = None;
        loop {
            tokio::select! {
                _ = shutdown.triggered(), if !stop.is_triggered() => {
                    info!("Shutdown requested, stopping manager");
                    stop.trigger();
                }
                joined = tasks.join_next() => {
                    let Some((name, outcome)) = joined else {
                        break;
                    };
                    if let Some(e) = unexpected(name, outcome, stop.is_triggered()) {
                        error!(task = name, error = %e, "Manager component failed");
                        failure.get_or_insert(e);
                        stop.trigger();
                    }
                    if name == "reconciler" {
                        // Nothing is in flight any more; the elector may step down.
                        election_stop.trigger();
                    }
                }
            }
        }

        queue.shut_down();
        info!("Manager stopped");
        failure.map_or(Ok(()), Err)
    }
}

/// Classify a finished component. Anything ending before shutdown is a failure.
fn unexpected(
    name: &'static str,
    outcome: std::result::Result<Result<()>, tokio::task::JoinError>,
    stopping: bool,
) -> Option<Error> {
    match outcome {
        Ok(Ok(())) if stopping => None,
        Ok(Ok(())) => Some(Error::TaskFailed {
            task: name,
            reason: "exited before shutdown".to_string(),
        }),
        Ok(Err(e)) => Some(e),
        Err(e) => Some(Error::TaskFailed {
            task: name,
            reason: e.to_string(),
        }),
    }
}

/// Feed watcher notifications into the queue.
async fn forward_keys(
    mut keys: mpsc::UnboundedReceiver<ResourceKey>,
    queue: WorkQueue,
    stop: ShutdownSignal,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            _ = stop.triggered() => break,
            key = keys.recv() => match key {
                Some(key) => queue.add(key),
                None => break,
            },
        }
    }
    Ok(())
}

/// Run one term at a time. A new term never starts before the previous
/// one's in-flight work has drained.
async fn supervise_terms<T, R>(
    control: ReconcileLoop<T, R>,
    mut terms: mpsc::UnboundedReceiver<ShutdownSignal>,
    stop: ShutdownSignal,
) where
    T: Send + Sync + 'static,
    R: Reconciler<T>,
{
    loop {
        let term = tokio::select! {
            biased;
            _ = stop.triggered() => break,
            term = terms.recv() => match term {
                Some(term) => term,
                None => break,
            },
        };
        info!("Leadership term started");
        control.run_term(term.or(stop.clone())).await;
        info!("Leadership term ended");
    }
}

/// Named component tasks.
#[derive(Default)]
struct Tasks {
    set: JoinSet<Result<()>>,
    names: HashMap<Id, &'static str>,
}

impl Tasks {
    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = self.set.spawn(task);
        self.names.insert(handle.id(), name);
    }

    async fn join_next(
        &mut self,
    ) -> Option<(&'static str, std::result::Result<Result<()>, tokio::task::JoinError>)> {
        let joined = self.set.join_next_with_id().await?;
        let (id, outcome) = match joined {
            Ok((id, result)) => (id, Ok(result)),
            Err(e) => (e.id(), Err(e)),
        };
        let name = self.names.remove(&id).unwrap_or("unknown");
        Some((name, outcome))
    }
}
