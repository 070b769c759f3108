//! Aggregate recovery statistics per recovery type

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::operation::RecoveryType;

/// Counters for one recovery type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub dead_lettered: u64,
    pub consistency_failures: u64,
    pub avg_execution_ms: f64,
    #[serde(skip)]
    executions: u64,
    #[serde(skip)]
    total_execution: Duration,
}

impl TypeStats {
    pub fn success_rate(&self) -> f64 {
        let finished = self.successes + self.failures;
        if finished == 0 {
            return 100.0;
        }
        self.successes as f64 * 100.0 / finished as f64
    }

    fn record_execution(&mut self, elapsed: Duration) {
        self.executions += 1;
        self.total_execution += elapsed;
        self.avg_execution_ms = self.total_execution.as_secs_f64() * 1000.0 / self.executions as f64;
    }
}

/// Statistics for every recovery type seen so far
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    by_type: BTreeMap<RecoveryType, TypeStats>,
}

impl RecoveryStats {
    fn entry(&mut self, recovery_type: RecoveryType) -> &mut TypeStats {
        self.by_type.entry(recovery_type).or_default()
    }

    pub fn record_attempt(&mut self, recovery_type: RecoveryType) {
        self.entry(recovery_type).attempts += 1;
    }

    pub fn record_success(&mut self, recovery_type: RecoveryType, elapsed: Duration) {
        let stats = self.entry(recovery_type);
        stats.successes += 1;
        stats.record_execution(elapsed);
    }

    /// `elapsed` is `None` when the command never ran
    pub fn record_failure(&mut self, recovery_type: RecoveryType, elapsed: Option<Duration>) {
        let stats = self.entry(recovery_type);
        stats.failures += 1;
        if let Some(elapsed) = elapsed {
            stats.record_execution(elapsed);
        }
    }

    pub fn record_dead_letter(&mut self, recovery_type: RecoveryType) {
        self.entry(recovery_type).dead_lettered += 1;
    }

    pub fn record_consistency_failure(&mut self, recovery_type: RecoveryType) {
        self.entry(recovery_type).consistency_failures += 1;
    }

    pub fn get(&self, recovery_type: RecoveryType) -> Option<&TypeStats> {
        self.by_type.get(&recovery_type)
    }

    pub fn snapshot(&self) -> BTreeMap<RecoveryType, TypeStats> {
        self.by_type.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_average() {
        let mut stats = RecoveryStats::default();
        stats.record_attempt(RecoveryType::DelayedRetry);
        stats.record_success(RecoveryType::DelayedRetry, Duration::from_millis(10));
        stats.record_attempt(RecoveryType::DelayedRetry);
        stats.record_failure(RecoveryType::DelayedRetry, Some(Duration::from_millis(30)));
        stats.record_attempt(RecoveryType::DelayedRetry);
        stats.record_failure(RecoveryType::DelayedRetry, None);
        stats.record_dead_letter(RecoveryType::DelayedRetry);

        let delayed = stats.get(RecoveryType::DelayedRetry).unwrap();
        assert_eq!(delayed.attempts, 3);
        assert_eq!(delayed.successes, 1);
        assert_eq!(delayed.failures, 2);
        assert_eq!(delayed.dead_lettered, 1);
        assert!((delayed.avg_execution_ms - 20.0).abs() < 1e-9);
        assert!((delayed.success_rate() - 100.0 / 3.0).abs() < 1e-9);

        assert!(stats.get(RecoveryType::Manual).is_none());
    }

    #[test]
    fn test_snapshot_serializes_by_type() {
        let mut stats = RecoveryStats::default();
        stats.record_attempt(RecoveryType::BackgroundSync);
        stats.record_consistency_failure(RecoveryType::BackgroundSync);

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["background_sync"]["attempts"], 1);
        assert_eq!(json["background_sync"]["consistency_failures"], 1);
        assert!(json["background_sync"].get("executions").is_none());
    }
}
