//! In-memory list/watch source.
//!
//! Behaves like an API server collection: a global version counter, an event
//! history that watches replay from, and hooks to drop connections, expire
//! old versions or fail list calls. Intended for tests and local runs; no
//! persistence and no cross-process visibility.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::{EventStream, ListWatch, Snapshot, WatchError, WatchEvent};
use crate::cache::{Version, Versioned};
use crate::key::ResourceKey;

type Subscriber<T> = mpsc::UnboundedSender<Result<WatchEvent<T>, WatchError>>;

struct SourceState<T> {
    objects: BTreeMap<ResourceKey, (Version, T)>,
    history: Vec<(Version, WatchEvent<T>)>,
    version: u64,
    compacted_at: u64,
    subscribers: Vec<Subscriber<T>>,
    failing_lists: u32,
    list_calls: usize,
}

/// Shared, cloneable in-memory collection.
pub struct InMemoryListWatch<T> {
    state: Arc<Mutex<SourceState<T>>>,
    watchers_changed: Arc<Notify>,
}

impl<T> Clone for InMemoryListWatch<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            watchers_changed: Arc::clone(&self.watchers_changed),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for InMemoryListWatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> InMemoryListWatch<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState {
                objects: BTreeMap::new(),
                history: Vec::new(),
                version: 0,
                compacted_at: 0,
                subscribers: Vec::new(),
                failing_lists: 0,
                list_calls: 0,
            })),
            watchers_changed: Arc::new(Notify::new()),
        }
    }

    /// Create or replace an object; returns its new version.
    pub fn upsert(&self, key: ResourceKey, object: T) -> Version {
        let mut state = self.state.lock();
        state.version += 1;
        let version = Version::new(state.version);
        let existed = state
            .objects
            .insert(key.clone(), (version, object.clone()))
            .is_some();
        let item = Versioned::new(key, version, object);
        let event = if existed {
            WatchEvent::Modified(item)
        } else {
            WatchEvent::Added(item)
        };
        publish(&mut state, version, event);
        version
    }

    /// Remove an object; returns the deletion version if it existed.
    pub fn delete(&self, key: &ResourceKey) -> Option<Version> {
        let mut state = self.state.lock();
        state.objects.remove(key)?;
        state.version += 1;
        let version = Version::new(state.version);
        publish(
            &mut state,
            version,
            WatchEvent::Deleted {
                key: key.clone(),
                version,
            },
        );
        Some(version)
    }

    /// Close every open watch stream.
    pub fn disconnect(&self) {
        self.state.lock().subscribers.clear();
    }

    /// Forget the event history; watches from older versions get `Gone`.
    pub fn compact(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.compacted_at = state.version;
    }

    /// Make the next `count` list calls fail.
    pub fn fail_next_lists(&self, count: u32) {
        self.state.lock().failing_lists = count;
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub fn watcher_count(&self) -> usize {
        self.state
            .lock()
            .subscribers
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Wait until at least `count` watch streams are open.
    pub async fn wait_for_watchers(&self, count: usize) {
        loop {
            let notified = self.watchers_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.watcher_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

fn publish<T: Clone>(state: &mut SourceState<T>, version: Version, event: WatchEvent<T>) {
    state
        .subscribers
        .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    state.history.push((version, event));
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> ListWatch for InMemoryListWatch<T> {
    type Object = T;

    async fn list(&self) -> Result<Snapshot<T>, WatchError> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(WatchError::Unavailable("injected list failure".to_string()));
        }
        let items = state
            .objects
            .iter()
            .map(|(key, (version, object))| Versioned::new(key.clone(), *version, object.clone()))
            .collect();
        Ok(Snapshot {
            items,
            version: Version::new(state.version),
        })
    }

    async fn watch(&self, from: Version) -> Result<EventStream<T>, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            if from.get() < state.compacted_at {
                let _ = tx.send(Err(WatchError::Gone));
            } else {
                for (version, event) in &state.history {
                    if *version > from {
                        let _ = tx.send(Ok(event.clone()));
                    }
                }
                state.subscribers.push(tx);
            }
        }
        self.watchers_changed.notify_waiters();

        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }
}
