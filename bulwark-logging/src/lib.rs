//! Structured logging infrastructure for bulwark
//!
//! Installs a `tracing` subscriber from [`LoggingConfig`] and defines the
//! severity scale shared by health alerts and recovery failure categories.

pub mod init;
pub mod severity;

// Re-export main types for convenience
pub use bulwark_config::{LogFormat, LogLevel, LoggingConfig};
pub use init::{init_logging_from_config, init_simple_tracing};
pub use severity::ErrorSeverity;
