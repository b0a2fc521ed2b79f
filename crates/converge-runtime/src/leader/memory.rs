//! In-memory lease store.
//!
//! ## Limitations
//!
//! - **Single-process only**: replicas must share one instance (clones share state)
//! - **No persistence**: all leases are lost when the process exits

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::lease::{Lease, LeaseError, LeaseStore, StoredLease};

#[derive(Debug, Default)]
struct Leases {
    records: HashMap<String, StoredLease>,
    next_version: u64,
}

impl Leases {
    fn store(&mut self, name: &str, lease: &Lease) -> StoredLease {
        self.next_version += 1;
        let stored = StoredLease {
            lease: lease.clone(),
            version: self.next_version.to_string(),
        };
        self.records.insert(name.to_string(), stored.clone());
        stored
    }
}

/// Lease store backed by a shared map with a monotonically increasing version.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLeaseStore {
    leases: Arc<Mutex<Leases>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryLeaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record, bypassing the store interface.
    pub fn snapshot(&self, name: &str) -> Option<StoredLease> {
        self.leases.lock().records.get(name).cloned()
    }

    /// Make every subsequent create/update fail with a store error until reset.
    /// Simulates losing connectivity to the lease backend.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), LeaseError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LeaseError::Store("lease store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<StoredLease>, LeaseError> {
        Ok(self.snapshot(name))
    }

    async fn create(&self, name: &str, lease: &Lease) -> Result<StoredLease, LeaseError> {
        self.check_writable()?;
        let mut leases = self.leases.lock();
        if leases.records.contains_key(name) {
            return Err(LeaseError::Conflict);
        }
        Ok(leases.store(name, lease))
    }

    async fn update(
        &self,
        name: &str,
        lease: &Lease,
        expected_version: &str,
    ) -> Result<StoredLease, LeaseError> {
        self.check_writable()?;
        let mut leases = self.leases.lock();
        match leases.records.get(name) {
            Some(current) if current.version == expected_version => Ok(leases.store(name, lease)),
            _ => Err(LeaseError::Conflict),
        }
    }
}
