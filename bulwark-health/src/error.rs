//! Error types for the health subsystem

use bulwark_config::ConfigError;
use bulwark_resilience::ShutdownError;
use thiserror::Error;

/// Reasons a single probe did not succeed.
///
/// These never escape [`crate::HealthCheckService::probe`]; they are folded
/// into the `error` text of a [`crate::HealthCheckResult`].
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("timeout")]
    Timeout,

    #[error("no probe target registered")]
    NoTarget,

    #[error("cache round-trip mismatch")]
    CacheMismatch,

    #[error("probe panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Target(#[from] anyhow::Error),
}

/// Errors returned by the health manager's public API
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("service '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("service '{0}' is not registered")]
    UnknownService(String),

    #[error("invalid service configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("health manager is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

pub type HealthResult<T> = Result<T, HealthError>;
