//! Leader-elected reconciliation control loop.
//!
//! A [`Manager`] keeps a local cache of one resource type in sync with a
//! list/watch source, queues the key of every changed object, and, while
//! this replica holds the lease, runs a [`Reconciler`] for each key until it
//! converges. Keys are deduplicated, retried with capped exponential backoff
//! and never reconciled by two workers at once.

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod key;
pub mod leader;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod shutdown;
pub mod watcher;
pub mod workqueue;

pub use cache::{CachedObject, Store, Version, Versioned};
pub use config::ManagerConfig;
pub use controller::{Action, ReconcileError, ReconcileLoop, ReconcileResult, Reconciler};
pub use error::{ConfigError, Error, Result};
pub use health::HealthSignal;
pub use key::ResourceKey;
pub use leader::{
    InMemoryLeaseStore, KubeLeaseStore, LeaderElectionConfig, LeaderElector, LeadershipState,
    LeaseStore,
};
pub use manager::Manager;
pub use registry::TypeRegistry;
pub use retry::Backoff;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use watcher::{InMemoryListWatch, KubeListWatch, ListWatch, ResourceWatcher};
pub use workqueue::WorkQueue;
