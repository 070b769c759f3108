//! Errors surfaced by the application context

use bulwark_config::ConfigError;
use bulwark_health::HealthError;
use bulwark_recovery::RecoveryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("service '{0}' has no entry in health.services")]
    UnknownService(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("recovery shutdown failed: {recovery}; health shutdown failed: {health}")]
    ShutdownFailed {
        recovery: RecoveryError,
        health: HealthError,
    },
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
