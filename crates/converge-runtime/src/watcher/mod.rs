//! List-then-watch synchronization of the local cache.
//!
//! The [`ResourceWatcher`] drives a [`ListWatch`] source:
//!
//! 1. full list, applied as a snapshot against the existing cache;
//! 2. watch from the list's collection version, applying events one by one;
//! 3. on any disconnect, error, or expired version, back to 1.
//!
//! Every change accepted by the cache emits exactly one [`ResourceKey`] on
//! the notification channel. Payloads are never sent: consumers re-read the
//! store when they act, so they always see the newest cached version.

pub mod kube;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

use crate::cache::{Change, Store, StoreWriter, Version, Versioned};
use crate::key::ResourceKey;
use crate::metrics;
use crate::retry::Backoff;
use crate::shutdown::ShutdownSignal;

pub use self::kube::KubeListWatch;
pub use self::memory::InMemoryListWatch;

/// A full list of the collection at a given collection version.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub items: Vec<Versioned<T>>,
    pub version: Version,
}

/// Incremental change delivered by a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(Versioned<T>),
    Modified(Versioned<T>),
    Deleted { key: ResourceKey, version: Version },
    /// Progress marker; carries no object.
    Bookmark(Version),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch version is too old, relist required")]
    Gone,
    #[error("Kubernetes API error: {0}")]
    Api(#[from] ::kube::Error),
    #[error("watch stream error: {0}")]
    Stream(String),
    #[error("object {key} has unusable version: {reason}")]
    InvalidVersion { key: String, reason: String },
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

pub type EventStream<T> = BoxStream<'static, Result<WatchEvent<T>, WatchError>>;

/// External list/watch store for one resource type.
#[async_trait]
pub trait ListWatch: Send + Sync + 'static {
    type Object: Send + Sync + 'static;

    /// Full snapshot of the collection.
    async fn list(&self) -> Result<Snapshot<Self::Object>, WatchError>;

    /// Stream of changes strictly after `from`.
    async fn watch(&self, from: Version) -> Result<EventStream<Self::Object>, WatchError>;
}

/// A watch that ends sooner than this counts as a failure for relist backoff.
const MIN_HEALTHY_WATCH: std::time::Duration = std::time::Duration::from_secs(1);

/// Keeps a [`Store`] synchronized with a [`ListWatch`] source.
pub struct ResourceWatcher<S: ListWatch> {
    source: S,
    writer: StoreWriter<S::Object>,
    notify: UnboundedSender<ResourceKey>,
    relist_backoff: Backoff,
}

impl<S: ListWatch> ResourceWatcher<S> {
    /// Create a watcher that reports accepted changes on `notify`.
    pub fn new(source: S, notify: UnboundedSender<ResourceKey>) -> Self {
        Self {
            source,
            writer: StoreWriter::new(),
            notify,
            relist_backoff: Backoff::new(
                std::time::Duration::from_millis(200),
                std::time::Duration::from_secs(30),
            ),
        }
    }

    /// Override the delay policy used after failed list or watch calls.
    pub fn with_relist_backoff(mut self, backoff: Backoff) -> Self {
        self.relist_backoff = backoff;
        self
    }

    /// Read handle to the cache this watcher maintains.
    pub fn store(&self) -> Store<S::Object> {
        self.writer.store()
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: ShutdownSignal) {
        let mut failures: u32 = 0;

        info!("Starting resource watcher");

        loop {
            if shutdown.is_triggered() {
                break;
            }

            let listed = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                listed = self.source.list() => listed,
            };
            let list_version = match listed {
                Ok(snapshot) => self.apply_snapshot(snapshot),
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.relist_backoff.delay(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "List failed, retrying"
                    );
                    if sleep_or_shutdown(delay, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let watched = tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                watched = self.source.watch(list_version) => watched,
            };
            let mut stream = match watched {
                Ok(stream) => stream,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.relist_backoff.delay(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        from_version = %list_version,
                        "Watch failed to start, relisting"
                    );
                    if sleep_or_shutdown(delay, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            let watch_started = tokio::time::Instant::now();

            let reason = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.triggered() => {
                        info!("Resource watcher stopped");
                        return;
                    }
                    event = stream.next() => match event {
                        Some(Ok(event)) => self.apply_event(event),
                        Some(Err(WatchError::Gone)) => break "expired",
                        Some(Err(e)) => {
                            warn!(error = %e, "Watch stream error");
                            break "error";
                        }
                        None => break "closed",
                    },
                }
            };
            if watch_started.elapsed() >= MIN_HEALTHY_WATCH {
                failures = 0;
                info!(reason, "Watch stream ended, relisting");
                continue;
            }

            failures = failures.saturating_add(1);
            let delay = self.relist_backoff.delay(failures);
            warn!(
                reason,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Watch stream ended immediately, relisting after backoff"
            );
            if sleep_or_shutdown(delay, &shutdown).await {
                break;
            }
        }

        info!("Resource watcher stopped");
    }

    fn apply_snapshot(&self, snapshot: Snapshot<S::Object>) -> Version {
        let list_version = snapshot.version;
        let listed = snapshot.items.len();
        let changes = self.writer.apply_snapshot(snapshot.items, list_version);

        metrics::record_relist();
        info!(
            version = %list_version,
            objects = listed,
            changes = changes.len(),
            "Applied full list"
        );

        for (key, change) in changes {
            self.emit(key, change);
        }
        self.writer.mark_synced();
        list_version
    }

    fn apply_event(&self, event: WatchEvent<S::Object>) {
        let (key, accepted) = match event {
            WatchEvent::Added(item) | WatchEvent::Modified(item) => {
                let key = item.key.clone();
                let version = item.version;
                let accepted = self.writer.apply_upsert(item);
                if accepted.is_none() {
                    debug!(key = %key, version = %version, "Discarded stale event");
                }
                (key, accepted)
            }
            WatchEvent::Deleted { key, version } => {
                let accepted = self.writer.apply_delete(&key, version);
                (key, accepted)
            }
            WatchEvent::Bookmark(version) => {
                trace!(version = %version, "Watch bookmark");
                return;
            }
        };
        if let Some(change) = accepted {
            self.emit(key, change);
        }
    }

    fn emit(&self, key: ResourceKey, change: Change) {
        metrics::record_watch_event(change.as_str());
        trace!(key = %key, change = change.as_str(), "Cache changed");
        if self.notify.send(key).is_err() {
            debug!("Notification receiver dropped");
        }
    }
}

/// Sleep for `delay`; returns true if shutdown fired first.
async fn sleep_or_shutdown(delay: std::time::Duration, shutdown: &ShutdownSignal) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.triggered() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
