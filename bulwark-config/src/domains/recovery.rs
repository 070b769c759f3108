//! Error recovery configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::validation::{Validatable, validate_positive, validate_range};
use crate::error::ConfigResult;

/// Recovery engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Whether the recovery engine accepts and processes operations
    #[serde(default = "crate::domains::utils::default_true")]
    pub enabled: bool,

    /// Delay between recovery worker ticks
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_worker_interval")]
    pub worker_interval: Duration,

    /// Maximum operations pulled per worker tick
    #[serde(default = "default_worker_batch_size")]
    pub worker_batch_size: usize,

    /// Capacity of each priority queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Default retry behaviour for scheduled operations
    #[serde(default)]
    pub retry: RetryDefaults,

    /// Upper bound on a single command execution
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_execution_timeout")]
    pub execution_timeout: Duration,

    /// Fraction of successful operations that get a consistency check
    #[serde(default = "default_consistency_check_sample_rate")]
    pub consistency_check_sample_rate: f64,

    /// Dead-letter queue capacity
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    /// Interval of the service recovery monitor
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_monitor_interval")]
    pub monitor_interval: Duration,

    /// Time granted to background loops to stop during shutdown
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_shutdown_grace_period")]
    pub shutdown_grace_period: Duration,

    /// Critical operations executed synchronously during shutdown
    #[serde(default = "default_shutdown_drain_limit")]
    pub shutdown_drain_limit: usize,
}

/// Retry settings applied to operations that do not carry their own policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryDefaults {
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_base_delay")]
    pub base_delay: Duration,

    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_max_delay")]
    pub max_delay: Duration,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "crate::domains::utils::default_true")]
    pub jitter_enabled: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_interval: default_worker_interval(),
            worker_batch_size: default_worker_batch_size(),
            queue_capacity: default_queue_capacity(),
            retry: RetryDefaults::default(),
            execution_timeout: default_execution_timeout(),
            consistency_check_sample_rate: default_consistency_check_sample_rate(),
            dead_letter_capacity: default_dead_letter_capacity(),
            monitor_interval: default_monitor_interval(),
            shutdown_grace_period: default_shutdown_grace_period(),
            shutdown_drain_limit: default_shutdown_drain_limit(),
        }
    }
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retry_attempts: default_max_retry_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_enabled: true,
        }
    }
}

impl Validatable for RecoveryConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.worker_interval.as_millis(), "worker_interval", self.domain_name())?;
        validate_positive(self.worker_batch_size, "worker_batch_size", self.domain_name())?;
        validate_positive(self.queue_capacity, "queue_capacity", self.domain_name())?;
        validate_positive(self.execution_timeout.as_secs(), "execution_timeout", self.domain_name())?;
        validate_range(
            self.consistency_check_sample_rate,
            0.0,
            1.0,
            "consistency_check_sample_rate",
            self.domain_name(),
        )?;
        validate_positive(self.dead_letter_capacity, "dead_letter_capacity", self.domain_name())?;
        validate_positive(self.monitor_interval.as_secs(), "monitor_interval", self.domain_name())?;

        self.retry.validate()?;

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "recovery"
    }
}

impl Validatable for RetryDefaults {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_retry_attempts, "max_retry_attempts", self.domain_name())?;
        validate_positive(self.base_delay.as_millis(), "base_delay", self.domain_name())?;

        if self.backoff_multiplier < 1.0 || self.backoff_multiplier.is_nan() {
            return Err(self.validation_error(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }

        if self.base_delay > self.max_delay {
            return Err(self.validation_error(format!(
                "base_delay ({:?}) cannot exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "recovery.retry"
    }
}

// Default value functions
fn default_worker_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_worker_batch_size() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_execution_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_consistency_check_sample_rate() -> f64 {
    0.1
}

fn default_dead_letter_capacity() -> usize {
    1000
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_drain_limit() -> usize {
    10
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_config_defaults() {
        let config = RecoveryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.worker_batch_size, 10);
        assert_eq!(config.shutdown_drain_limit, 10);
        assert_eq!(config.retry.max_retry_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sample_rate_out_of_range() {
        let config = RecoveryConfig {
            consistency_check_sample_rate: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_defaults_validation() {
        let mut retry = RetryDefaults::default();
        assert!(retry.validate().is_ok());

        retry.backoff_multiplier = 0.5;
        assert!(retry.validate().is_err());

        retry.backoff_multiplier = 2.0;
        retry.base_delay = Duration::from_secs(600);
        assert!(retry.validate().is_err());
    }

    #[test]
    fn test_retry_yaml_in_milliseconds() {
        let yaml = r#"
max_retry_attempts: 5
base_delay: 250
max_delay: 10000
jitter_enabled: false
"#;
        let retry: RetryDefaults = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(retry.max_retry_attempts, 5);
        assert_eq!(retry.base_delay, Duration::from_millis(250));
        assert_eq!(retry.max_delay, Duration::from_secs(10));
        assert_eq!(retry.backoff_multiplier, 2.0);
        assert!(!retry.jitter_enabled);
    }
}
