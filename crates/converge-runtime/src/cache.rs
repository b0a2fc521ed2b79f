//! Versioned local cache of watched objects
//!
//! Readers get a cheap [`Store`] handle; only the watcher holds the writer.
//! Every write is version-gated inside a single write-lock critical section:
//! an object is replaced only by a strictly newer version, and deleted keys
//! keep a tombstone so a late, stale event cannot bring them back.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::key::ResourceKey;

/// Monotonically increasing version token of an object or collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(u64);

impl Version {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// An object as delivered by a list or watch call.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub key: ResourceKey,
    pub version: Version,
    pub object: T,
}

impl<T> Versioned<T> {
    pub fn new(key: ResourceKey, version: Version, object: T) -> Self {
        Self {
            key,
            version,
            object,
        }
    }
}

/// A cached object. The payload is shared, never copied.
#[derive(Debug)]
pub struct CachedObject<T> {
    key: ResourceKey,
    version: Version,
    payload: Arc<T>,
}

impl<T> Clone for CachedObject<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            version: self.version,
            payload: Arc::clone(&self.payload),
        }
    }
}

impl<T> CachedObject<T> {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn payload(&self) -> &Arc<T> {
        &self.payload
    }

    pub fn into_payload(self) -> Arc<T> {
        self.payload
    }
}

/// Kind of change accepted into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Updated,
    Deleted,
}

impl Change {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// Shared flag set once the cache has completed its first full list.
#[derive(Debug, Clone, Default)]
pub struct SyncFlag(Arc<AtomicBool>);

impl SyncFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

struct StoreState<T> {
    objects: HashMap<ResourceKey, CachedObject<T>>,
    tombstones: HashMap<ResourceKey, Version>,
}

impl<T> StoreState<T> {
    fn upsert(&mut self, item: Versioned<T>) -> Option<Change> {
        if let Some(&deleted_at) = self.tombstones.get(&item.key) {
            if item.version <= deleted_at {
                return None;
            }
        }
        let change = match self.objects.get(&item.key) {
            Some(existing) if item.version <= existing.version => return None,
            Some(_) => Change::Updated,
            None => Change::Added,
        };
        self.tombstones.remove(&item.key);
        self.objects.insert(
            item.key.clone(),
            CachedObject {
                key: item.key,
                version: item.version,
                payload: Arc::new(item.object),
            },
        );
        Some(change)
    }

    fn delete(&mut self, key: &ResourceKey, version: Version) -> Option<Change> {
        let last_seen = match self.objects.get(key) {
            Some(existing) if version < existing.version => return None,
            Some(existing) => Some(existing.version),
            None => None,
        };
        let floor = self.tombstones.get(key).copied().into_iter().chain(last_seen);
        let tombstone = floor.fold(version, Version::max);
        self.tombstones.insert(key.clone(), tombstone);
        self.objects.remove(key).map(|_| Change::Deleted)
    }
}

/// Read handle to the cache.
pub struct Store<T> {
    state: Arc<RwLock<StoreState<T>>>,
    synced: SyncFlag,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            synced: self.synced.clone(),
        }
    }
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState {
                objects: HashMap::new(),
                tombstones: HashMap::new(),
            })),
            synced: SyncFlag::default(),
        }
    }
}

impl<T> Store<T> {
    /// Current object for `key`, or `None` if it is not (or no longer) cached.
    pub fn get(&self, key: &ResourceKey) -> Option<CachedObject<T>> {
        self.state.read().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.state.read().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the initial list has been applied.
    pub fn has_synced(&self) -> bool {
        self.synced.is_set()
    }

    pub fn sync_flag(&self) -> SyncFlag {
        self.synced.clone()
    }
}

/// Write side of the cache, owned by the watcher.
pub(crate) struct StoreWriter<T> {
    store: Store<T>,
}

impl<T> StoreWriter<T> {
    pub(crate) fn new() -> Self {
        Self {
            store: Store::default(),
        }
    }

    pub(crate) fn store(&self) -> Store<T> {
        self.store.clone()
    }

    pub(crate) fn apply_upsert(&self, item: Versioned<T>) -> Option<Change> {
        self.store.state.write().upsert(item)
    }

    pub(crate) fn apply_delete(&self, key: &ResourceKey, version: Version) -> Option<Change> {
        self.store.state.write().delete(key, version)
    }

    /// Reconcile the cache against a full list taken at `list_version`.
    ///
    /// Returns the changes the list implies relative to the cache. Cached
    /// objects newer than the list are kept, since the list may lag behind
    /// events already applied.
    pub(crate) fn apply_snapshot(
        &self,
        items: Vec<Versioned<T>>,
        list_version: Version,
    ) -> Vec<(ResourceKey, Change)> {
        let mut state = self.store.state.write();
        let mut changes = Vec::new();
        let mut listed = HashSet::with_capacity(items.len());

        for item in items {
            let key = item.key.clone();
            listed.insert(key.clone());
            if let Some(change) = state.upsert(item) {
                changes.push((key, change));
            }
        }

        let vanished: Vec<ResourceKey> = state
            .objects
            .iter()
            .filter(|(key, obj)| !listed.contains(*key) && obj.version < list_version)
            .map(|(key, _)| key.clone())
            .collect();
        for key in vanished {
            if let Some(change) = state.delete(&key, list_version) {
                changes.push((key, change));
            }
        }

        // Everything after this list is newer than list_version.
        state.tombstones.retain(|_, deleted_at| *deleted_at > list_version);
        changes
    }

    pub(crate) fn mark_synced(&self) {
        self.store.synced.set();
    }
}
