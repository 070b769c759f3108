//! Rolling per-service health statistics
//!
//! Every registered service owns a bounded history of latencies and probe
//! outcomes. The history drives the availability flag, the trailing success
//! rate, the health classification and alert records.

use bulwark_config::{HealthConfig, ServiceConfig};
use bulwark_logging::ErrorSeverity;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::probe::HealthCheckResult;

/// Health classification of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthClassification {
    /// Never checked
    Unknown,
    Healthy,
    /// Available but with recent failures or a success rate below 95%
    Degraded,
    /// Unavailable or behind an open breaker
    Critical,
}

impl std::fmt::Display for HealthClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthClassification::Unknown => "unknown",
            HealthClassification::Healthy => "healthy",
            HealthClassification::Degraded => "degraded",
            HealthClassification::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Current statistics for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub service: String,
    #[serde(with = "humantime_serde", default)]
    pub last_latency: Option<Duration>,
    /// Percentage of successful checks over the trailing window
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub is_available: bool,
    pub circuit_breaker_open: bool,
    pub total_checks: u64,
    pub total_failures: u64,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl HealthMetrics {
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            last_latency: None,
            success_rate: 100.0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            is_available: true,
            circuit_breaker_open: false,
            total_checks: 0,
            total_failures: 0,
            last_checked: None,
            last_error: None,
        }
    }

    pub fn classification(&self) -> HealthClassification {
        if self.total_checks == 0 && !self.circuit_breaker_open {
            HealthClassification::Unknown
        } else if !self.is_available || self.circuit_breaker_open {
            HealthClassification::Critical
        } else if self.consecutive_failures > 0 || self.success_rate < 95.0 {
            HealthClassification::Degraded
        } else {
            HealthClassification::Healthy
        }
    }
}

/// Condition that raised an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ConsecutiveFailures,
    HighLatency,
    LowSuccessRate,
}

/// Alert record kept for later aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub service: String,
    pub kind: AlertKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Nearest-rank response time percentiles
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResponseTimePercentiles {
    #[serde(with = "humantime_serde")]
    pub p50: Duration,
    #[serde(with = "humantime_serde")]
    pub p95: Duration,
    #[serde(with = "humantime_serde")]
    pub p99: Duration,
    #[serde(with = "humantime_serde")]
    pub average: Duration,
    pub samples: usize,
}

impl ResponseTimePercentiles {
    fn from_samples(samples: &VecDeque<Duration>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = samples.iter().copied().collect();
        sorted.sort_unstable();

        let total: Duration = sorted.iter().sum();
        let count = sorted.len();

        Some(Self {
            p50: nearest_rank(&sorted, 50.0),
            p95: nearest_rank(&sorted, 95.0),
            p99: nearest_rank(&sorted, 99.0),
            average: total / count as u32,
            samples: count,
        })
    }
}

fn nearest_rank(sorted: &[Duration], percentile: f64) -> Duration {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// History bounds and alert thresholds shared by every service
#[derive(Debug, Clone)]
struct MetricsLimits {
    latency_history_size: usize,
    result_history_size: usize,
    success_rate_window: usize,
    alert_retention: usize,
    latency_critical_threshold: Duration,
    success_rate_alert_threshold: f64,
}

impl From<&HealthConfig> for MetricsLimits {
    fn from(config: &HealthConfig) -> Self {
        Self {
            latency_history_size: config.latency_history_size,
            result_history_size: config.result_history_size,
            success_rate_window: config.success_rate_window,
            alert_retention: config.alert_retention,
            latency_critical_threshold: config.latency_critical_threshold,
            success_rate_alert_threshold: config.success_rate_alert_threshold,
        }
    }
}

struct ServiceMetrics {
    failure_threshold: u32,
    success_threshold: u32,
    metrics: HealthMetrics,
    latencies: VecDeque<Duration>,
    results: VecDeque<HealthCheckResult>,
    alerts: VecDeque<HealthAlert>,
}

impl ServiceMetrics {
    fn new(config: &ServiceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            metrics: HealthMetrics::new(&config.name),
            latencies: VecDeque::new(),
            results: VecDeque::new(),
            alerts: VecDeque::new(),
        }
    }

    fn success_rate(&self, window: usize) -> f64 {
        let considered = self.results.len().min(window);
        if considered == 0 {
            return 100.0;
        }
        let successes = self
            .results
            .iter()
            .rev()
            .take(considered)
            .filter(|r| r.healthy)
            .count();
        successes as f64 * 100.0 / considered as f64
    }

    fn raise(&mut self, limits: &MetricsLimits, kind: AlertKind, severity: ErrorSeverity, message: String) -> HealthAlert {
        warn!(service = %self.metrics.service, ?kind, %severity, "{}", message);
        let alert = HealthAlert {
            service: self.metrics.service.clone(),
            kind,
            severity,
            message,
            raised_at: Utc::now(),
        };
        push_bounded(&mut self.alerts, alert.clone(), limits.alert_retention);
        alert
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, limit: usize) {
    queue.push_back(item);
    while queue.len() > limit {
        queue.pop_front();
    }
}

/// Per-service rolling statistics, availability and alerting
pub struct MetricsManager {
    limits: MetricsLimits,
    services: RwLock<HashMap<String, Arc<Mutex<ServiceMetrics>>>>,
}

impl MetricsManager {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            limits: MetricsLimits::from(config),
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a service. Existing history is discarded.
    pub fn register(&self, config: &ServiceConfig) {
        self.services.write().insert(
            config.name.clone(),
            Arc::new(Mutex::new(ServiceMetrics::new(config))),
        );
    }

    pub fn is_registered(&self, service: &str) -> bool {
        self.services.read().contains_key(service)
    }

    fn entry(&self, service: &str) -> Option<Arc<Mutex<ServiceMetrics>>> {
        self.services.read().get(service).cloned()
    }

    /// Fold a probe result into the service's statistics.
    ///
    /// Returns the alerts the result raised. Short-circuited results only
    /// update the breaker flag.
    pub fn record(&self, result: &HealthCheckResult) -> Vec<HealthAlert> {
        let Some(entry) = self.entry(&result.service) else {
            return Vec::new();
        };
        let mut state = entry.lock();

        if result.circuit_breaker_open {
            state.metrics.circuit_breaker_open = true;
            return Vec::new();
        }

        let limits = &self.limits;
        push_bounded(&mut state.latencies, result.latency, limits.latency_history_size);
        push_bounded(&mut state.results, result.clone(), limits.result_history_size);

        let failure_threshold = state.failure_threshold;
        let success_threshold = state.success_threshold;
        let metrics = &mut state.metrics;
        metrics.total_checks += 1;
        metrics.last_latency = Some(result.latency);
        metrics.last_checked = Some(result.timestamp);

        if result.healthy {
            metrics.consecutive_successes += 1;
            metrics.consecutive_failures = 0;
            metrics.last_error = None;
            if !metrics.is_available && metrics.consecutive_successes >= success_threshold {
                metrics.is_available = true;
                info!(service = %metrics.service, "Service marked available again");
            }
        } else {
            metrics.consecutive_failures += 1;
            metrics.consecutive_successes = 0;
            metrics.total_failures += 1;
            metrics.last_error = result.error.clone();
            if metrics.is_available && metrics.consecutive_failures >= failure_threshold {
                metrics.is_available = false;
                warn!(
                    service = %metrics.service,
                    consecutive_failures = metrics.consecutive_failures,
                    "Service marked unavailable"
                );
            }
        }

        let success_rate = state.success_rate(limits.success_rate_window);
        state.metrics.success_rate = success_rate;

        let mut raised = Vec::new();
        let consecutive_failures = state.metrics.consecutive_failures;
        if consecutive_failures > failure_threshold {
            raised.push(state.raise(
                limits,
                AlertKind::ConsecutiveFailures,
                ErrorSeverity::High,
                format!(
                    "{} consecutive failed health checks (threshold {})",
                    consecutive_failures, failure_threshold
                ),
            ));
        }
        if result.latency > limits.latency_critical_threshold {
            raised.push(state.raise(
                limits,
                AlertKind::HighLatency,
                ErrorSeverity::Medium,
                format!(
                    "Health check took {}ms (threshold {}ms)",
                    result.latency.as_millis(),
                    limits.latency_critical_threshold.as_millis()
                ),
            ));
        }
        if success_rate < limits.success_rate_alert_threshold {
            raised.push(state.raise(
                limits,
                AlertKind::LowSuccessRate,
                ErrorSeverity::High,
                format!(
                    "Success rate {:.1}% below {:.0}%",
                    success_rate, limits.success_rate_alert_threshold
                ),
            ));
        }

        raised
    }

    /// Mirror the breaker's open flag into the metrics
    pub fn set_circuit_breaker_open(&self, service: &str, open: bool) {
        if let Some(entry) = self.entry(service) {
            entry.lock().metrics.circuit_breaker_open = open;
        }
    }

    pub fn metrics(&self, service: &str) -> Option<HealthMetrics> {
        self.entry(service).map(|entry| entry.lock().metrics.clone())
    }

    /// Metrics of every service, sorted by name
    pub fn all_metrics(&self) -> Vec<HealthMetrics> {
        let entries: Vec<_> = self.services.read().values().cloned().collect();
        let mut all: Vec<HealthMetrics> = entries
            .iter()
            .map(|entry| entry.lock().metrics.clone())
            .collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    pub fn classification(&self, service: &str) -> HealthClassification {
        self.metrics(service)
            .map(|m| m.classification())
            .unwrap_or(HealthClassification::Unknown)
    }

    pub fn response_time_percentiles(&self, service: &str) -> Option<ResponseTimePercentiles> {
        let entry = self.entry(service)?;
        let state = entry.lock();
        ResponseTimePercentiles::from_samples(&state.latencies)
    }

    /// Most recent probe results, newest first
    pub fn recent_results(&self, service: &str, limit: usize) -> Vec<HealthCheckResult> {
        self.entry(service)
            .map(|entry| entry.lock().results.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Alerts for one service, newest first
    pub fn alerts(&self, service: &str) -> Vec<HealthAlert> {
        self.entry(service)
            .map(|entry| entry.lock().alerts.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Alerts across all services, newest first
    pub fn recent_alerts(&self, limit: usize) -> Vec<HealthAlert> {
        let entries: Vec<_> = self.services.read().values().cloned().collect();
        let mut alerts: Vec<HealthAlert> = entries
            .iter()
            .flat_map(|entry| entry.lock().alerts.iter().cloned().collect::<Vec<_>>())
            .collect();
        alerts.sort_by(|a, b| b.raised_at.cmp(&a.raised_at));
        alerts.truncate(limit);
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MetricsManager {
        let manager = MetricsManager::new(&HealthConfig::default());
        manager.register(&ServiceConfig::new("cache").with_thresholds(3, 2));
        manager
    }

    fn ok(latency_ms: u64) -> HealthCheckResult {
        HealthCheckResult::healthy("cache", Duration::from_millis(latency_ms), Default::default())
    }

    fn fail() -> HealthCheckResult {
        HealthCheckResult::failed("cache", Duration::from_millis(10), "connection reset")
    }

    #[test]
    fn test_unknown_until_first_check() {
        let manager = manager();
        assert_eq!(manager.classification("cache"), HealthClassification::Unknown);
        assert_eq!(manager.classification("ghost"), HealthClassification::Unknown);

        manager.record(&ok(5));
        assert_eq!(manager.classification("cache"), HealthClassification::Healthy);
    }

    #[test]
    fn test_availability_thresholds() {
        let manager = manager();
        manager.record(&fail());
        manager.record(&fail());
        let metrics = manager.metrics("cache").unwrap();
        assert!(metrics.is_available);
        assert_eq!(manager.classification("cache"), HealthClassification::Degraded);

        manager.record(&fail());
        assert!(!manager.metrics("cache").unwrap().is_available);
        assert_eq!(manager.classification("cache"), HealthClassification::Critical);

        manager.record(&ok(5));
        assert!(!manager.metrics("cache").unwrap().is_available);
        manager.record(&ok(5));
        let metrics = manager.metrics("cache").unwrap();
        assert!(metrics.is_available);
        assert_eq!(metrics.consecutive_successes, 2);
        assert_eq!(metrics.total_failures, 3);
    }

    #[test]
    fn test_success_rate_uses_trailing_window() {
        let config = HealthConfig {
            success_rate_window: 4,
            ..Default::default()
        };
        let manager = MetricsManager::new(&config);
        manager.register(&ServiceConfig::new("cache"));

        manager.record(&fail());
        manager.record(&fail());
        for _ in 0..3 {
            manager.record(&ok(1));
        }
        // Window holds fail, ok, ok, ok
        assert_eq!(manager.metrics("cache").unwrap().success_rate, 75.0);
        assert_eq!(manager.classification("cache"), HealthClassification::Degraded);
    }

    #[test]
    fn test_alerts_raised_and_retained() {
        let config = HealthConfig {
            latency_critical_threshold: Duration::from_millis(100),
            alert_retention: 2,
            ..Default::default()
        };
        let manager = MetricsManager::new(&config);
        manager.register(&ServiceConfig::new("cache").with_thresholds(1, 1));

        let raised = manager.record(&fail());
        let kinds: Vec<AlertKind> = raised.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::LowSuccessRate]);

        let raised = manager.record(&fail());
        let kinds: Vec<AlertKind> = raised.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::ConsecutiveFailures, AlertKind::LowSuccessRate]);

        let raised = manager.record(&ok(250));
        assert!(raised.iter().any(|a| a.kind == AlertKind::HighLatency));

        let alerts = manager.alerts("cache");
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].kind, AlertKind::LowSuccessRate);
        assert_eq!(manager.recent_alerts(1).len(), 1);
    }

    #[test]
    fn test_consecutive_failure_alert_only_past_threshold() {
        let manager = MetricsManager::new(&HealthConfig::default());
        manager.register(&ServiceConfig::new("cache").with_thresholds(3, 1));

        let has_streak_alert =
            |raised: &[HealthAlert]| raised.iter().any(|a| a.kind == AlertKind::ConsecutiveFailures);

        for _ in 0..3 {
            assert!(!has_streak_alert(&manager.record(&fail())));
        }
        assert!(!manager.metrics("cache").unwrap().is_available);

        let raised = manager.record(&fail());
        assert!(has_streak_alert(&raised));
        let alert = raised
            .iter()
            .find(|a| a.kind == AlertKind::ConsecutiveFailures)
            .unwrap();
        assert!(alert.message.contains("4 consecutive"));
    }

    #[test]
    fn test_short_circuit_only_sets_breaker_flag() {
        let manager = manager();
        manager.record(&ok(5));
        manager.record(&HealthCheckResult::short_circuited("cache", Duration::from_secs(30)));

        let metrics = manager.metrics("cache").unwrap();
        assert!(metrics.circuit_breaker_open);
        assert_eq!(metrics.total_checks, 1);
        assert_eq!(metrics.consecutive_failures, 0);
        assert_eq!(manager.classification("cache"), HealthClassification::Critical);

        manager.set_circuit_breaker_open("cache", false);
        assert_eq!(manager.classification("cache"), HealthClassification::Healthy);
    }

    #[test]
    fn test_response_time_percentiles() {
        let manager = manager();
        assert!(manager.response_time_percentiles("cache").is_none());

        for ms in 1..=100 {
            manager.record(&ok(ms));
        }
        let p = manager.response_time_percentiles("cache").unwrap();
        assert_eq!(p.samples, 100);
        assert_eq!(p.p50, Duration::from_millis(50));
        assert_eq!(p.p95, Duration::from_millis(95));
        assert_eq!(p.p99, Duration::from_millis(99));
        assert_eq!(p.average, Duration::from_micros(50_500));
    }

    #[test]
    fn test_histories_are_bounded() {
        let config = HealthConfig {
            latency_history_size: 3,
            result_history_size: 2,
            ..Default::default()
        };
        let manager = MetricsManager::new(&config);
        manager.register(&ServiceConfig::new("cache"));
        for ms in 1..=10 {
            manager.record(&ok(ms));
        }

        assert_eq!(manager.response_time_percentiles("cache").unwrap().samples, 3);
        let recent = manager.recent_results("cache", 10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].latency, Duration::from_millis(10));
    }
}
