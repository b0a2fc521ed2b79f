//! Lease-based leader election.
//!
//! At most one replica holds the lease at a time. The holder renews it every
//! `renew_interval`; standbys poll at the same rate and take over once the
//! lease expires or is released.
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │  Pod A (Leader) │     │ Pod B (Follower)│
//! │  term active    │     │  polling lease  │
//! └────────┬────────┘     └────────┬────────┘
//!          │ renew                 │ try_acquire
//!          ▼                       ▼
//!     ┌─────────────────────────────────┐
//!     │   Lease: newresource-controller │
//!     └─────────────────────────────────┘
//! ```
//!
//! Each period of leadership is a *term*. The term signal handed to
//! `on_acquired` is triggered before anything else happens on loss, so work
//! started under an old term stops before a new leader can exist.

pub mod kube;
mod lease;
pub mod memory;

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::parse_duration_env;
use crate::error::ConfigError;
use crate::metrics;
use crate::shutdown::{Shutdown, ShutdownSignal};

pub use self::kube::KubeLeaseStore;
pub use self::lease::{Lease, LeaseError, LeaseStore, StoredLease};
pub use self::memory::InMemoryLeaseStore;

#[cfg(test)]
pub use self::lease::MockLeaseStore;

/// Lease name used when none is configured.
pub const DEFAULT_LEASE_NAME: &str = "newresource-controller";

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration for leader election.
///
/// Fields are private to enforce invariants. Use [`LeaderElectionConfig::from_env()`]
/// or [`LeaderElectionConfig::new()`].
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    enabled: bool,
    lease_name: String,
    namespace: String,
    holder_id: String,
    lease_duration: Duration,
    renew_deadline: Duration,
    renew_interval: Duration,
}

impl LeaderElectionConfig {
    /// Create an enabled configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `lease_name`, `namespace` or `holder_id` is empty
    /// - `renew_interval >= renew_deadline`
    /// - `renew_deadline >= lease_duration` (the lease could expire while
    ///   the holder still believes it leads)
    pub fn new(
        lease_name: String,
        namespace: String,
        holder_id: String,
        lease_duration: Duration,
        renew_deadline: Duration,
        renew_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if lease_name.is_empty() {
            return Err(ConfigError::Empty("lease_name"));
        }
        if namespace.is_empty() {
            return Err(ConfigError::Empty("namespace"));
        }
        if holder_id.is_empty() {
            return Err(ConfigError::Empty("holder_id"));
        }
        if renew_interval.is_zero() || renew_interval >= renew_deadline {
            return Err(ConfigError::Invalid {
                name: "renew_interval",
                reason: format!(
                    "{renew_interval:?} must be non-zero and less than renew_deadline ({renew_deadline:?})"
                ),
            });
        }
        if renew_deadline >= lease_duration {
            return Err(ConfigError::Invalid {
                name: "renew_deadline",
                reason: format!(
                    "{renew_deadline:?} must be less than lease_duration ({lease_duration:?})"
                ),
            });
        }

        Ok(Self {
            enabled: true,
            lease_name,
            namespace,
            holder_id,
            lease_duration,
            renew_deadline,
            renew_interval,
        })
    }

    /// Create a disabled configuration: the process leads from start to shutdown.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            namespace: String::new(),
            holder_id: String::new(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LEADER_ELECTION_ENABLED`: "true" to enable (default: false)
    /// - `LEADER_ELECTION_LEASE_NAME`: Lease name (default: newresource-controller)
    /// - `POD_NAMESPACE`: Namespace for the lease (required if enabled)
    /// - `POD_NAME`: This pod's name, used as holder identity (required if enabled)
    /// - `LEADER_ELECTION_LEASE_DURATION`: TTL in seconds (default: 15)
    /// - `LEADER_ELECTION_RENEW_DEADLINE`: Give-up bound in seconds (default: 10)
    /// - `LEADER_ELECTION_RENEW_INTERVAL`: Renewal interval in seconds (default: 2)
    pub fn from_env() -> Result<Self, ConfigError> {
        let enabled = std::env::var("LEADER_ELECTION_ENABLED")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if !enabled {
            return Ok(Self::disabled());
        }

        let lease_name = std::env::var("LEADER_ELECTION_LEASE_NAME")
            .unwrap_or_else(|_| DEFAULT_LEASE_NAME.to_string());

        let namespace =
            std::env::var("POD_NAMESPACE").map_err(|_| ConfigError::Missing("POD_NAMESPACE"))?;

        let holder_id = std::env::var("POD_NAME").map_err(|_| ConfigError::Missing("POD_NAME"))?;

        let lease_duration =
            parse_duration_env("LEADER_ELECTION_LEASE_DURATION", DEFAULT_LEASE_DURATION);
        let renew_deadline =
            parse_duration_env("LEADER_ELECTION_RENEW_DEADLINE", DEFAULT_RENEW_DEADLINE);
        let renew_interval =
            parse_duration_env("LEADER_ELECTION_RENEW_INTERVAL", DEFAULT_RENEW_INTERVAL);

        Self::new(
            lease_name,
            namespace,
            holder_id,
            lease_duration,
            renew_deadline,
            renew_interval,
        )
    }

    /// Whether leader election is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Name of the Lease resource.
    pub fn lease_name(&self) -> &str {
        &self.lease_name
    }

    /// Namespace for the Lease resource.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Identity of this replica (from POD_NAME env var).
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Time before lease expires if not renewed.
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// How long the leader keeps retrying a failed renewal before giving up.
    pub fn renew_deadline(&self) -> Duration {
        self.renew_deadline
    }

    /// How often to renew the lease, and how often followers retry.
    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }
}

/// Leadership as observed by this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    /// No lease observation yet.
    Unknown,
    Leader,
    Follower,
}

impl LeadershipState {
    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }

    pub fn is_leader(self) -> bool {
        self == Self::Leader
    }
}

/// Outcome of a single acquisition or renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireResult {
    pub acquired: bool,
    /// Holder recorded in the lease after the attempt, if known.
    pub holder: Option<String>,
}

enum TermEnd {
    Lost,
    Shutdown,
}

/// Drives the lease for one identity.
pub struct LeaderElector<S> {
    store: S,
    config: LeaderElectionConfig,
    state: watch::Sender<LeadershipState>,
}

impl<S: LeaseStore> LeaderElector<S> {
    pub fn new(store: S, config: LeaderElectionConfig) -> Self {
        let (state, _) = watch::channel(LeadershipState::Unknown);
        Self {
            store,
            config,
            state,
        }
    }

    pub fn config(&self) -> &LeaderElectionConfig {
        &self.config
    }

    /// Observe leadership changes.
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LeadershipState {
        *self.state.borrow()
    }

    /// Take or renew the lease if it is absent, expired, released or already
    /// ours. Every write is conditional on the version just read, so two
    /// identities racing for a free lease cannot both succeed.
    pub async fn try_acquire_or_renew(&self) -> Result<AcquireResult, LeaseError> {
        let name = self.config.lease_name();
        let identity = self.config.holder_id();
        let now = Utc::now();

        let Some(current) = self.store.get(name).await? else {
            let lease = Lease {
                holder: Some(identity.to_string()),
                acquired_at: now,
                renewed_at: now,
                duration: self.config.lease_duration(),
                transitions: 0,
            };
            return self.write(self.store.create(name, &lease).await, None);
        };

        let ours = current.lease.is_held_by(identity);
        if !ours && current.lease.is_active(now) {
            return Ok(AcquireResult {
                acquired: false,
                holder: current.lease.holder,
            });
        }

        let lease = if ours {
            Lease {
                renewed_at: now,
                duration: self.config.lease_duration(),
                ..current.lease.clone()
            }
        } else {
            Lease {
                holder: Some(identity.to_string()),
                acquired_at: now,
                renewed_at: now,
                duration: self.config.lease_duration(),
                transitions: current.lease.transitions.saturating_add(1),
            }
        };
        let written = self.store.update(name, &lease, &current.version).await;
        self.write(written, current.lease.holder)
    }

    fn write(
        &self,
        written: Result<StoredLease, LeaseError>,
        previous_holder: Option<String>,
    ) -> Result<AcquireResult, LeaseError> {
        match written {
            Ok(stored) => Ok(AcquireResult {
                acquired: true,
                holder: stored.lease.holder,
            }),
            // Someone else wrote first.
            Err(LeaseError::Conflict) => Ok(AcquireResult {
                acquired: false,
                holder: previous_holder,
            }),
            Err(e) => Err(e),
        }
    }

    /// Clear the holder if we still hold the lease. Returns whether it was released.
    pub async fn release(&self) -> Result<bool, LeaseError> {
        let name = self.config.lease_name();
        let Some(current) = self.store.get(name).await? else {
            return Ok(false);
        };
        if !current.lease.is_held_by(self.config.holder_id()) {
            return Ok(false);
        }
        let lease = Lease {
            holder: None,
            renewed_at: Utc::now(),
            ..current.lease.clone()
        };
        match self.store.update(name, &lease, &current.version).await {
            Ok(_) => Ok(true),
            Err(LeaseError::Conflict) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run elections until `shutdown` fires.
    ///
    /// `on_acquired` receives the signal of the new term and must return
    /// quickly (spawn the work). On loss the term signal is triggered, the
    /// state becomes [`LeadershipState::Follower`] and only then is `on_lost`
    /// called. Lost leadership is followed by a new election, never by exit.
    pub async fn run<A, L>(&self, shutdown: ShutdownSignal, mut on_acquired: A, mut on_lost: L)
    where
        A: FnMut(ShutdownSignal) + Send,
        L: FnMut() + Send,
    {
        info!(
            lease = self.config.lease_name(),
            namespace = self.config.namespace(),
            identity = self.config.holder_id(),
            "Starting leader election"
        );

        while let Some(renewed) = self.wait_for_leadership(&shutdown).await {
            let term = Shutdown::new();
            self.publish(LeadershipState::Leader);
            info!(identity = self.config.holder_id(), "Leadership acquired");
            on_acquired(term.signal());

            let end = self.hold(&shutdown, renewed).await;

            term.trigger();
            self.publish(LeadershipState::Follower);
            on_lost();

            if let TermEnd::Shutdown = end {
                match self.release().await {
                    Ok(true) => info!("Lease released"),
                    Ok(false) => debug!("Lease no longer held, nothing to release"),
                    Err(e) => warn!(error = %e, "Failed to release lease"),
                }
                break;
            }
        }

        info!("Leader election stopped");
    }

    /// Follower phase. Returns when the winning attempt started, or `None`
    /// if shutdown fired first.
    async fn wait_for_leadership(&self, shutdown: &ShutdownSignal) -> Option<Instant> {
        let mut last_holder: Option<String> = None;

        loop {
            if shutdown.is_triggered() {
                return None;
            }

            let started = Instant::now();
            match self.try_acquire_or_renew().await {
                Ok(result) if result.acquired => return Some(started),
                Ok(result) => {
                    self.publish(LeadershipState::Follower);
                    if result.holder != last_holder {
                        info!(
                            current_holder = result.holder.as_deref().unwrap_or("unknown"),
                            "Another replica is leader, waiting"
                        );
                        last_holder = result.holder;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to check leadership, retrying");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.triggered() => return None,
                _ = tokio::time::sleep(self.config.renew_interval()) => {}
            }
        }
    }

    /// Leader phase. Renews until the lease is lost or shutdown fires.
    ///
    /// `renewed` is when the last successful write started, which is no later
    /// than the `renewed_at` it stamped. Measuring the deadline from there
    /// keeps a slow write from stretching this replica's term past the
    /// lease's real expiry.
    async fn hold(&self, shutdown: &ShutdownSignal, renewed: Instant) -> TermEnd {
        let renew_deadline = self.config.renew_deadline();
        let mut last_renewal = renewed;
        let mut interval = tokio::time::interval(self.config.renew_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            let deadline = last_renewal + renew_deadline;
            tokio::select! {
                biased;
                _ = shutdown.triggered() => return TermEnd::Shutdown,
                _ = tokio::time::sleep_until(deadline) => {
                    error!(
                        deadline_ms = renew_deadline.as_millis() as u64,
                        "Lease not renewed before the renew deadline"
                    );
                    return TermEnd::Lost;
                }
                _ = interval.tick() => {}
            }

            let started = Instant::now();
            let attempt = tokio::time::timeout_at(deadline, self.try_acquire_or_renew()).await;

            match attempt {
                Ok(Ok(result)) if result.acquired => {
                    last_renewal = started;
                    trace!("Lease renewed");
                }
                Ok(Ok(result)) => {
                    error!(
                        new_holder = result.holder.as_deref().unwrap_or("unknown"),
                        "Lost leadership to another replica"
                    );
                    return TermEnd::Lost;
                }
                Ok(Err(e)) if Instant::now() < deadline => {
                    warn!(
                        error = %e,
                        since_renewal_ms = last_renewal.elapsed().as_millis() as u64,
                        deadline_ms = renew_deadline.as_millis() as u64,
                        "Transient lease renewal failure, will retry"
                    );
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Failed to renew lease before the renew deadline");
                    return TermEnd::Lost;
                }
                Err(_) => {
                    error!(
                        deadline_ms = renew_deadline.as_millis() as u64,
                        "Lease renewal timed out at the renew deadline"
                    );
                    return TermEnd::Lost;
                }
            }
        }
    }

    fn publish(&self, state: LeadershipState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            metrics::set_leader(state.is_leader());
            debug!(from = ?previous, to = ?state, "Leadership state changed");
        }
    }
}
