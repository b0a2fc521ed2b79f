//! Environment-driven runtime configuration.
//!
//! Unparsable values fall back to their defaults with a warning; missing
//! required values and violated relationships are [`ConfigError`]s.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;
use crate::leader::LeaderElectionConfig;
use crate::retry::Backoff;

const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8081";
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_BACKOFF_BASE_MS: u64 = 5;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 1000;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Everything the [`Manager`](crate::Manager) needs to run one control loop.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// `None` disables the metrics endpoint.
    pub metrics_addr: Option<SocketAddr>,
    pub health_addr: SocketAddr,
    pub leader_election: LeaderElectionConfig,
    pub workers: usize,
    pub backoff: Backoff,
    /// How long in-flight reconciliations may run after their term ends.
    pub shutdown_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            metrics_addr: DEFAULT_METRICS_ADDR.parse().ok(),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            leader_election: LeaderElectionConfig::disabled(),
            workers: DEFAULT_WORKERS,
            backoff: Backoff::default(),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `METRICS_BIND_ADDRESS`: Prometheus listener, `0` disables (default: 0.0.0.0:8080)
    /// - `HEALTH_PROBE_BIND_ADDRESS`: probe listener (default: 0.0.0.0:8081)
    /// - `WORKER_COUNT`: concurrent reconciliations (default: 1)
    /// - `BACKOFF_BASE_MS`, `BACKOFF_MAX_SECS`: retry delay bounds (default: 5ms, 1000s)
    /// - `SHUTDOWN_GRACE_SECS`: in-flight grace period (default: 30)
    /// - leader election variables, see [`LeaderElectionConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let metrics_raw =
            std::env::var("METRICS_BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_METRICS_ADDR.into());
        let metrics_addr = if metrics_raw == "0" {
            None
        } else {
            Some(parse_addr("METRICS_BIND_ADDRESS", &metrics_raw)?)
        };

        let health_raw = std::env::var("HEALTH_PROBE_BIND_ADDRESS")
            .unwrap_or_else(|_| DEFAULT_HEALTH_ADDR.into());
        let health_addr = parse_addr("HEALTH_PROBE_BIND_ADDRESS", &health_raw)?;

        let workers = parse_env("WORKER_COUNT", DEFAULT_WORKERS);
        let base = Duration::from_millis(parse_env("BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS));
        let max = parse_duration_env(
            "BACKOFF_MAX_SECS",
            Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
        );
        let shutdown_grace = parse_duration_env(
            "SHUTDOWN_GRACE_SECS",
            Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        );

        Self {
            metrics_addr,
            health_addr,
            leader_election: LeaderElectionConfig::from_env()?,
            workers,
            backoff: Backoff::new(base, max),
            shutdown_grace,
        }
        .validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                name: "WORKER_COUNT",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.backoff.base().is_zero() {
            return Err(ConfigError::Invalid {
                name: "BACKOFF_BASE_MS",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(self)
    }
}

/// Parse `host:port`, or `:port` meaning every interface.
fn parse_addr(name: &'static str, raw: &str) -> Result<SocketAddr, ConfigError> {
    let normalized;
    let raw = match raw.strip_prefix(':') {
        Some(port) => {
            normalized = format!("0.0.0.0:{port}");
            normalized.as_str()
        }
        None => raw,
    };
    raw.parse().map_err(|e| ConfigError::Invalid {
        name,
        reason: format!("'{raw}': {e}"),
    })
}

/// Parse an environment variable, falling back to `default` with a warning.
pub(crate) fn parse_env<T>(var_name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match std::env::var(var_name) {
        Ok(v) => match v.parse::<T>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    env_var = var_name,
                    value = %v,
                    error = %e,
                    default = %default,
                    "Failed to parse env var, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a duration in whole seconds from an environment variable.
pub(crate) fn parse_duration_env(var_name: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_env(var_name, default.as_secs()))
}
