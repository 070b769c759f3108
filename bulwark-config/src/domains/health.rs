//! Health probing configuration

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use crate::validation::{Validatable, validate_positive, validate_required_string};
use crate::error::ConfigResult;

/// Health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Probe latency above which a high-latency alert fires
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_latency_critical_threshold")]
    pub latency_critical_threshold: Duration,

    /// Number of latency samples kept per service
    #[serde(default = "default_latency_history_size")]
    pub latency_history_size: usize,

    /// Number of probe results kept per service
    #[serde(default = "default_result_history_size")]
    pub result_history_size: usize,

    /// Number of trailing results used for the success rate
    #[serde(default = "default_success_rate_window")]
    pub success_rate_window: usize,

    /// Number of alerts retained per service
    #[serde(default = "default_alert_retention")]
    pub alert_retention: usize,

    /// Success rate (percent) below which a low-success-rate alert fires
    #[serde(default = "default_success_rate_alert_threshold")]
    pub success_rate_alert_threshold: f64,

    /// Monitored services
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Per-service probing and circuit breaker configuration.
///
/// Immutable once the service is registered with the health manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service identifier
    pub name: String,

    /// Interval between health checks
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_health_check_interval")]
    pub health_check_interval: Duration,

    /// Probe timeout
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_probe_timeout")]
    pub timeout: Duration,

    /// Consecutive failures before the service is marked unavailable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before an unavailable service is marked available again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Failures before the circuit breaker opens
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// Cooldown before an open breaker allows a half-open trial
    #[serde(with = "crate::domains::utils::serde_duration", default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_timeout: Duration,

    /// Whether losing this service degrades the whole system
    #[serde(default = "crate::domains::utils::default_false")]
    pub critical_service: bool,

    /// Services this one depends on
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            latency_critical_threshold: default_latency_critical_threshold(),
            latency_history_size: default_latency_history_size(),
            result_history_size: default_result_history_size(),
            success_rate_window: default_success_rate_window(),
            alert_retention: default_alert_retention(),
            success_rate_alert_threshold: default_success_rate_alert_threshold(),
            services: Vec::new(),
        }
    }
}

impl HealthConfig {
    /// Look up a service configuration by name
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}

impl ServiceConfig {
    /// Create a service configuration with default thresholds
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health_check_interval: default_health_check_interval(),
            timeout: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_timeout: default_circuit_breaker_timeout(),
            critical_service: false,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_thresholds(mut self, failure_threshold: u32, success_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self.success_threshold = success_threshold;
        self
    }

    pub fn with_circuit_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_timeout = cooldown;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical_service = true;
        self
    }

    pub fn depends_on(mut self, service: impl Into<String>) -> Self {
        self.dependencies.insert(service.into());
        self
    }
}

impl Validatable for HealthConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(
            self.latency_critical_threshold.as_millis(),
            "latency_critical_threshold",
            self.domain_name(),
        )?;
        validate_positive(self.latency_history_size, "latency_history_size", self.domain_name())?;
        validate_positive(self.result_history_size, "result_history_size", self.domain_name())?;
        validate_positive(self.success_rate_window, "success_rate_window", self.domain_name())?;
        validate_positive(self.alert_retention, "alert_retention", self.domain_name())?;
        crate::validation::validate_range(
            self.success_rate_alert_threshold,
            0.0,
            100.0,
            "success_rate_alert_threshold",
            self.domain_name(),
        )?;

        let mut seen = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !seen.insert(service.name.as_str()) {
                return Err(self.validation_error(format!(
                    "service '{}' is configured more than once",
                    service.name
                )));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "health"
    }
}

impl Validatable for ServiceConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.name, "name", self.domain_name())?;
        validate_positive(
            self.health_check_interval.as_millis(),
            "health_check_interval",
            self.domain_name(),
        )?;
        validate_positive(self.timeout.as_millis(), "timeout", self.domain_name())?;
        validate_positive(self.failure_threshold, "failure_threshold", self.domain_name())?;
        validate_positive(self.success_threshold, "success_threshold", self.domain_name())?;
        validate_positive(
            self.circuit_breaker_threshold,
            "circuit_breaker_threshold",
            self.domain_name(),
        )?;
        validate_positive(
            self.circuit_breaker_timeout.as_millis(),
            "circuit_breaker_timeout",
            self.domain_name(),
        )?;

        if self.dependencies.contains(&self.name) {
            return Err(self.validation_error(format!(
                "service '{}' cannot depend on itself",
                self.name
            )));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "health.services"
    }
}

// Default value functions
fn default_latency_critical_threshold() -> Duration {
    Duration::from_millis(5000)
}

fn default_latency_history_size() -> usize {
    1000
}

fn default_result_history_size() -> usize {
    500
}

fn default_success_rate_window() -> usize {
    100
}

fn default_alert_retention() -> usize {
    100
}

fn default_success_rate_alert_threshold() -> f64 {
    80.0
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_timeout() -> Duration {
    Duration::from_secs(60)
}
