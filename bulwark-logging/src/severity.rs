//! Error severity levels for logging

use serde::{Deserialize, Serialize};

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn should_alert(&self) -> bool {
        matches!(self, ErrorSeverity::High | ErrorSeverity::Critical)
    }

    pub fn should_retry(&self) -> bool {
        !matches!(self, ErrorSeverity::Critical)
    }

    /// Matching `tracing` level for this severity
    pub fn tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Info => tracing::Level::INFO,
            ErrorSeverity::Low => tracing::Level::DEBUG,
            ErrorSeverity::Medium => tracing::Level::WARN,
            ErrorSeverity::High | ErrorSeverity::Critical => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorSeverity::Info => "info",
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}
