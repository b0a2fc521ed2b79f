//! Crate-level errors.

use thiserror::Error;

/// Invalid or missing configuration. Fatal: detected before anything runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("{0} required when leader election is enabled")]
    Missing(&'static str),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("resource type {0} is not registered")]
    UnregisteredType(String),

    #[error("failed to serve health probes: {0}")]
    Health(#[source] std::io::Error),

    #[error("{task} task failed: {reason}")]
    TaskFailed { task: &'static str, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
