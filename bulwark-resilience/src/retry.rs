//! Retry policy for scheduled recovery operations

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::BackoffCalculator;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated before the operation is dead-lettered
    pub max_retry_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor applied per recorded failure
    pub backoff_multiplier: f64,

    /// Whether to perturb delays by ±10%
    pub jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retry_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_retry_attempts,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    /// Whether another attempt is permitted after `retry_count` failures
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retry_attempts
    }

    /// Delay before the next attempt, given `retry_count` recorded failures
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let calculator = BackoffCalculator::new(
            self.base_delay,
            self.max_delay,
            self.backoff_multiplier,
            self.jitter_enabled,
        );

        calculator.calculate_delay(retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retry_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(300));
        assert!(policy.jitter_enabled);
    }

    #[test]
    fn test_retry_schedule_without_jitter() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1)).with_jitter(false);

        // After the first and second failures
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));

        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_builder_overrides() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .with_multiplier(3.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
    }

    #[test]
    fn test_policy_serde() {
        let json = r#"{
            "max_retry_attempts": 4,
            "base_delay": "500ms",
            "max_delay": "1m",
            "backoff_multiplier": 1.5,
            "jitter_enabled": false
        }"#;
        let policy: RetryPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.backoff_multiplier, 1.5);
    }
}
