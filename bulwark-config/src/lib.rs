//! Domain-driven configuration management for bulwark
//!
//! Configuration is split by functional domain (health probing, recovery,
//! sync jobs, logging), each with its own defaults and validation, and can be
//! loaded from YAML with environment variable overrides.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    health::{HealthConfig, ServiceConfig},
    logging::{LogFormat, LogLevel, LoggingConfig},
    recovery::{RecoveryConfig, RetryDefaults},
    sync::SyncConfig,
    BulwarkConfig,
};

// Re-export utilities
pub use domains::utils::{serde_duration, serde_duration_ms};
