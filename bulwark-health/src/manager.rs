//! Service registration and periodic probing
//!
//! [`ServiceHealthManager`] owns the probe service, the metrics manager and
//! the circuit breakers. Each registered service gets one background loop
//! that consults its breaker, probes, records the result and sleeps for the
//! service's check interval.

use bulwark_config::{HealthConfig, ServiceConfig, Validatable};
use bulwark_interfaces::{ServiceAvailability, ServiceHealthSnapshot};
use bulwark_resilience::{
    CallPermission, CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerSnapshot,
    ShutdownCoordinator, ShutdownListener, ShutdownReport,
};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{HealthError, HealthResult};
use crate::metrics::{HealthAlert, HealthClassification, MetricsManager, ResponseTimePercentiles};
use crate::probe::{HealthCheckResult, HealthCheckService, ProbeTarget};
use crate::system::{ServiceStatus, SystemHealthReport};

/// Everything one service's loop needs
#[derive(Clone)]
struct ServiceProbe {
    config: ServiceConfig,
    checker: Arc<HealthCheckService>,
    metrics: Arc<MetricsManager>,
    breakers: Arc<CircuitBreakerManager>,
}

impl ServiceProbe {
    /// One iteration: breaker, probe, metrics, breaker update
    async fn check_once(&self) -> HealthCheckResult {
        let name = self.config.name.as_str();

        let result = match self.breakers.check_state(name) {
            CallPermission::Rejected { retry_in } => {
                debug!(service = name, retry_in_ms = retry_in.as_millis() as u64, "Probe short-circuited by open breaker");
                HealthCheckResult::short_circuited(name, retry_in)
            }
            permission => {
                if permission == CallPermission::Trial {
                    info!(service = name, "Sending half-open trial probe");
                }
                self.checker.probe(name, self.config.timeout).await
            }
        };

        self.metrics.record(&result);
        if !result.circuit_breaker_open {
            self.breakers.record(name, result.healthy);
            self.metrics
                .set_circuit_breaker_open(name, !self.breakers.is_available(name));
        }

        result
    }

    async fn run(self, mut listener: ShutdownListener) {
        info!(
            service = %self.config.name,
            interval_secs = self.config.health_check_interval.as_secs(),
            "Health check loop started"
        );
        loop {
            self.check_once().await;
            if listener
                .sleep_or_shutdown(self.config.health_check_interval)
                .await
            {
                break;
            }
        }
        info!(service = %self.config.name, "Health check loop stopped");
    }
}

/// Registers services, probes them periodically and aggregates their health
pub struct ServiceHealthManager {
    config: HealthConfig,
    checker: Arc<HealthCheckService>,
    metrics: Arc<MetricsManager>,
    breakers: Arc<CircuitBreakerManager>,
    services: RwLock<BTreeMap<String, ServiceConfig>>,
    shutdown: ShutdownCoordinator,
}

impl ServiceHealthManager {
    pub fn new(config: HealthConfig) -> Self {
        let metrics = Arc::new(MetricsManager::new(&config));
        Self {
            config,
            checker: Arc::new(HealthCheckService::new()),
            metrics,
            breakers: Arc::new(CircuitBreakerManager::new()),
            services: RwLock::new(BTreeMap::new()),
            shutdown: ShutdownCoordinator::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsManager> {
        &self.metrics
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Register a service and start its periodic probing loop
    pub fn register(&self, config: ServiceConfig, target: ProbeTarget) -> HealthResult<()> {
        let probe = self.add_service(config, target)?;
        let name = format!("health-check:{}", probe.config.name);
        self.shutdown.spawn(name, move |listener| probe.run(listener))?;
        Ok(())
    }

    /// Register a service without a background loop; checks happen only
    /// through [`ServiceHealthManager::force_check`].
    pub fn register_on_demand(&self, config: ServiceConfig, target: ProbeTarget) -> HealthResult<()> {
        self.add_service(config, target).map(|_| ())
    }

    fn add_service(&self, config: ServiceConfig, target: ProbeTarget) -> HealthResult<ServiceProbe> {
        if self.shutdown.is_shutting_down() {
            return Err(HealthError::ShuttingDown);
        }
        config.validate()?;

        let mut services = self.services.write();
        if services.contains_key(&config.name) {
            return Err(HealthError::AlreadyRegistered(config.name));
        }

        self.metrics.register(&config);
        self.breakers.register(
            config.name.clone(),
            CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker_threshold,
                timeout: config.circuit_breaker_timeout,
            },
        );
        self.checker.register_target(config.name.clone(), target.clone());
        services.insert(config.name.clone(), config.clone());

        info!(
            service = %config.name,
            target = target.kind(),
            critical = config.critical_service,
            "Registered service for health monitoring"
        );

        Ok(ServiceProbe {
            config,
            checker: self.checker.clone(),
            metrics: self.metrics.clone(),
            breakers: self.breakers.clone(),
        })
    }

    fn probe_for(&self, service: &str) -> HealthResult<ServiceProbe> {
        let config = self
            .services
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| HealthError::UnknownService(service.to_string()))?;
        Ok(ServiceProbe {
            config,
            checker: self.checker.clone(),
            metrics: self.metrics.clone(),
            breakers: self.breakers.clone(),
        })
    }

    /// Run one check now, honouring the breaker like the periodic loop does
    pub async fn force_check(&self, service: &str) -> HealthResult<HealthCheckResult> {
        let probe = self.probe_for(service)?;
        Ok(probe.check_once().await)
    }

    /// Check every registered service concurrently, in name order
    pub async fn check_all(&self) -> Vec<HealthCheckResult> {
        let probes: Vec<ServiceProbe> = self
            .registered()
            .iter()
            .filter_map(|service| self.probe_for(service).ok())
            .collect();
        join_all(probes.iter().map(|probe| probe.check_once())).await
    }

    /// Manually close a service's breaker
    pub fn reset_circuit_breaker(&self, service: &str) -> HealthResult<()> {
        if !self.breakers.reset(service) {
            return Err(HealthError::UnknownService(service.to_string()));
        }
        self.metrics.set_circuit_breaker_open(service, false);
        Ok(())
    }

    pub fn registered(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    pub fn service_config(&self, service: &str) -> Option<ServiceConfig> {
        self.services.read().get(service).cloned()
    }

    pub fn classification(&self, service: &str) -> HealthClassification {
        self.metrics.classification(service)
    }

    pub fn circuit_breaker(&self, service: &str) -> Option<CircuitBreakerSnapshot> {
        self.breakers.snapshot(service)
    }

    pub fn service_status(&self, service: &str) -> Option<ServiceStatus> {
        let config = self.service_config(service)?;
        self.status_for(&config)
    }

    fn status_for(&self, config: &ServiceConfig) -> Option<ServiceStatus> {
        let metrics = self.metrics.metrics(&config.name)?;
        Some(ServiceStatus {
            service: config.name.clone(),
            classification: metrics.classification(),
            critical: config.critical_service,
            dependencies: config.dependencies.clone(),
            metrics,
            circuit_breaker: self.breakers.snapshot(&config.name),
            check_interval: config.health_check_interval,
            success_threshold: config.success_threshold,
        })
    }

    pub fn response_time_percentiles(&self, service: &str) -> Option<ResponseTimePercentiles> {
        self.metrics.response_time_percentiles(service)
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<HealthAlert> {
        self.metrics.recent_alerts(limit)
    }

    /// Aggregate health of every registered service
    pub fn system_health(&self) -> SystemHealthReport {
        let configs: Vec<ServiceConfig> = self.services.read().values().cloned().collect();
        let statuses = configs
            .iter()
            .filter_map(|config| self.status_for(config))
            .collect();
        let report = SystemHealthReport::from_services(statuses);

        if !report.critical_down.is_empty() {
            warn!(
                mode = %report.mode,
                critical_down = ?report.critical_down,
                "Critical services unavailable"
            );
        }
        report
    }

    /// Number of probing loops still running
    pub fn active_loops(&self) -> usize {
        self.shutdown.active_task_count()
    }

    /// Stop every probing loop and wait for them to finish
    pub async fn shutdown(&self) -> HealthResult<ShutdownReport> {
        info!("Stopping health check loops");
        Ok(self.shutdown.shutdown().await?)
    }
}

impl ServiceAvailability for ServiceHealthManager {
    fn is_available(&self, service: &str) -> bool {
        match self.metrics.metrics(service) {
            Some(metrics) => metrics.is_available && self.breakers.is_available(service),
            None => true,
        }
    }

    fn registered_services(&self) -> Vec<String> {
        self.registered()
    }

    fn health_snapshot(&self) -> Vec<ServiceHealthSnapshot> {
        self.metrics
            .all_metrics()
            .into_iter()
            .map(|m| ServiceHealthSnapshot {
                available: m.is_available && self.breakers.is_available(&m.service),
                circuit_breaker_open: !self.breakers.is_available(&m.service),
                consecutive_failures: m.consecutive_failures,
                success_rate: m.success_rate,
                last_checked: m.last_checked,
                service: m.service,
            })
            .collect()
    }
}
