//! Lease records and the store they live in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A time-bounded exclusive claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Current holder; `None` once released.
    pub holder: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub duration: Duration,
    /// Number of times the lease changed hands.
    pub transitions: u32,
}

impl Lease {
    /// Instant after which the lease is free to be taken.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let duration = chrono::Duration::from_std(self.duration).unwrap_or(chrono::Duration::MAX);
        self.renewed_at
            .checked_add_signed(duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder.as_deref() == Some(identity)
    }

    /// Held by someone and not yet expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.holder.is_some() && !self.is_expired(now)
    }
}

/// A lease as stored, with the version used for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLease {
    pub lease: Lease,
    pub version: String,
}

#[derive(Debug, Error)]
pub enum LeaseError {
    /// The record changed since it was read, or already exists.
    #[error("lease was modified concurrently")]
    Conflict,
    #[error("Kubernetes API error: {0}")]
    Api(#[from] ::kube::Error),
    #[error("lease store error: {0}")]
    Store(String),
}

/// Shared lease storage supporting optimistic, conditional writes only.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<StoredLease>, LeaseError>;

    /// Create the record; [`LeaseError::Conflict`] if it already exists.
    async fn create(&self, name: &str, lease: &Lease) -> Result<StoredLease, LeaseError>;

    /// Replace the record only if its version still equals `expected_version`.
    async fn update(
        &self,
        name: &str,
        lease: &Lease,
        expected_version: &str,
    ) -> Result<StoredLease, LeaseError>;
}

#[async_trait]
impl<S: LeaseStore + ?Sized> LeaseStore for Arc<S> {
    async fn get(&self, name: &str) -> Result<Option<StoredLease>, LeaseError> {
        (**self).get(name).await
    }

    async fn create(&self, name: &str, lease: &Lease) -> Result<StoredLease, LeaseError> {
        (**self).create(name, lease).await
    }

    async fn update(
        &self,
        name: &str,
        lease: &Lease,
        expected_version: &str,
    ) -> Result<StoredLease, LeaseError> {
        (**self).update(name, lease, expected_version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, duration_secs: u64) -> Lease {
        let renewed_at = Utc::now() - chrono::Duration::seconds(renewed_secs_ago);
        Lease {
            holder: holder.map(str::to_string),
            acquired_at: renewed_at,
            renewed_at,
            duration: Duration::from_secs(duration_secs),
            transitions: 0,
        }
    }

    #[test]
    fn lease_expires_after_duration() {
        assert!(!lease(Some("a"), 5, 15).is_expired(Utc::now()));
        assert!(lease(Some("a"), 20, 15).is_expired(Utc::now()));
    }

    #[test]
    fn released_lease_is_not_active() {
        let released = lease(None, 0, 15);
        assert!(!released.is_expired(Utc::now()));
        assert!(!released.is_active(Utc::now()));
        assert!(lease(Some("a"), 0, 15).is_active(Utc::now()));
    }

    #[test]
    fn holder_check() {
        let held = lease(Some("pod-a"), 0, 15);
        assert!(held.is_held_by("pod-a"));
        assert!(!held.is_held_by("pod-b"));
    }

    #[test]
    fn huge_duration_does_not_overflow() {
        let forever = lease(Some("a"), 0, u64::MAX);
        assert!(!forever.is_expired(Utc::now()));
    }
}
