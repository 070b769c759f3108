//! System-wide health aggregation

use bulwark_resilience::CircuitBreakerSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::metrics::{HealthClassification, HealthMetrics};

/// Overall operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemMode {
    FullyOperational,
    DegradedPerformance,
    LimitedFunctionality,
    EmergencyMode,
}

impl SystemMode {
    /// Pick the mode from counts of unhealthy services.
    ///
    /// `down` includes `critical_down`; `degraded` counts services that are
    /// up but not healthy.
    pub fn assess(critical_down: usize, down: usize, degraded: usize, total: usize) -> Self {
        if critical_down >= 2 {
            SystemMode::EmergencyMode
        } else if critical_down == 1 || down * 2 > total {
            SystemMode::LimitedFunctionality
        } else if degraded > 0 || down > 0 {
            SystemMode::DegradedPerformance
        } else {
            SystemMode::FullyOperational
        }
    }
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SystemMode::FullyOperational => "fully operational",
            SystemMode::DegradedPerformance => "degraded performance",
            SystemMode::LimitedFunctionality => "limited functionality",
            SystemMode::EmergencyMode => "emergency mode",
        };
        write!(f, "{}", s)
    }
}

/// Status of one registered service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: String,
    pub classification: HealthClassification,
    pub critical: bool,
    pub dependencies: BTreeSet<String>,
    pub metrics: HealthMetrics,
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
    /// Interval between checks, used for recovery estimates
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    pub success_threshold: u32,
}

impl ServiceStatus {
    pub fn is_down(&self) -> bool {
        self.classification == HealthClassification::Critical
    }

    fn remaining_cooldown(&self) -> Option<Duration> {
        self.circuit_breaker
            .as_ref()
            .filter(|b| b.is_open)
            .and_then(|b| b.retry_in)
    }
}

/// Aggregate health of every registered service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthReport {
    pub mode: SystemMode,
    pub services: Vec<ServiceStatus>,
    /// Critical-flagged services that are down
    pub critical_down: Vec<String>,
    pub degraded: Vec<String>,
    pub recommendations: Vec<String>,
    #[serde(with = "humantime_serde", default)]
    pub estimated_recovery: Option<Duration>,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealthReport {
    pub fn from_services(services: Vec<ServiceStatus>) -> Self {
        let total = services
            .iter()
            .filter(|s| s.classification != HealthClassification::Unknown)
            .count();
        let down: Vec<&ServiceStatus> = services.iter().filter(|s| s.is_down()).collect();
        let critical_down: Vec<String> = down
            .iter()
            .filter(|s| s.critical)
            .map(|s| s.service.clone())
            .collect();
        let degraded: Vec<String> = services
            .iter()
            .filter(|s| s.classification == HealthClassification::Degraded)
            .map(|s| s.service.clone())
            .collect();

        let mode = SystemMode::assess(critical_down.len(), down.len(), degraded.len(), total);
        let recommendations = recommendations(&services);
        let estimated_recovery = estimate_recovery(&down);

        Self {
            mode,
            critical_down,
            degraded,
            recommendations,
            estimated_recovery,
            services,
            checked_at: Utc::now(),
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceStatus> {
        self.services.iter().find(|s| s.service == name)
    }
}

fn recommendations(services: &[ServiceStatus]) -> Vec<String> {
    let mut out = Vec::new();

    for status in services.iter().filter(|s| s.is_down()) {
        if status.critical {
            out.push(format!(
                "Restore critical service '{}' ({})",
                status.service,
                status.metrics.last_error.as_deref().unwrap_or("unavailable")
            ));
        } else {
            out.push(format!("Investigate unavailable service '{}'", status.service));
        }

        let dependents: Vec<&str> = services
            .iter()
            .filter(|other| other.dependencies.contains(&status.service))
            .map(|other| other.service.as_str())
            .collect();
        if !dependents.is_empty() {
            out.push(format!(
                "Expect reduced functionality in {} while '{}' is down",
                dependents.join(", "),
                status.service
            ));
        }

        if let Some(retry_in) = status.remaining_cooldown() {
            out.push(format!(
                "Circuit breaker for '{}' is open, next trial in {}s",
                status.service,
                retry_in.as_secs()
            ));
        }
    }

    for status in services
        .iter()
        .filter(|s| s.classification == HealthClassification::Degraded)
    {
        out.push(format!(
            "Monitor degraded service '{}' (success rate {:.1}%)",
            status.service, status.metrics.success_rate
        ));
    }

    out
}

/// Longest remaining breaker cooldown among down services, otherwise the
/// time needed for the slowest of them to pass its success threshold.
fn estimate_recovery(down: &[&ServiceStatus]) -> Option<Duration> {
    if down.is_empty() {
        return None;
    }

    let cooldown = down.iter().filter_map(|s| s.remaining_cooldown()).max();
    cooldown.or_else(|| {
        down.iter()
            .map(|s| s.check_interval.saturating_mul(s.success_threshold))
            .max()
    })
}
