//! Health monitoring for bulwark
//!
//! - [`HealthCheckService`] runs single timeout-bounded probes
//! - [`MetricsManager`] keeps rolling per-service statistics and alerts
//! - [`ServiceHealthManager`] runs one probing loop per service and
//!   aggregates a [`SystemHealthReport`]
//!
//! Probe failures never surface as errors; they are always folded into a
//! [`HealthCheckResult`].

pub mod error;
pub mod manager;
pub mod metrics;
pub mod probe;
pub mod system;

pub use error::{HealthError, HealthResult, ProbeError};
pub use manager::ServiceHealthManager;
pub use metrics::{
    AlertKind, HealthAlert, HealthClassification, HealthMetrics, MetricsManager,
    ResponseTimePercentiles,
};
pub use probe::{
    CacheTarget, HealthCheckResult, HealthCheckService, HealthProbe, HttpProviderTarget,
    ProbeExtra, ProbeTarget, ProviderTarget, StorageTarget, CACHE_PROBE_TTL,
};
pub use system::{ServiceStatus, SystemHealthReport, SystemMode};
