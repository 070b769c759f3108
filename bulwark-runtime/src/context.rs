//! Long-lived application context owning the health and recovery services

use bulwark_config::{BulwarkConfig, ConfigLoader};
use bulwark_health::{ProbeTarget, ServiceHealthManager};
use bulwark_interfaces::ServiceAvailability;
use bulwark_recovery::{ErrorRecoverySystem, RecoveryShutdownReport, SyncJob, SyncJobManager};
use bulwark_resilience::ShutdownReport;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{RuntimeError, RuntimeResult};

/// Outcome of [`ResilienceContext::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextShutdownReport {
    pub recovery: RecoveryShutdownReport,
    pub health: ShutdownReport,
}

impl ContextShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.health.is_clean()
            && self.recovery.loops.is_clean()
            && self.recovery.sync_loops.is_clean()
    }
}

/// Health monitoring and error recovery wired together
pub struct ResilienceContext {
    config: BulwarkConfig,
    health: Arc<ServiceHealthManager>,
    recovery: Arc<ErrorRecoverySystem>,
}

impl ResilienceContext {
    pub fn new(config: BulwarkConfig) -> Self {
        let health = Arc::new(ServiceHealthManager::new(config.health.clone()));
        let availability: Arc<dyn ServiceAvailability> = health.clone();
        let recovery = Arc::new(ErrorRecoverySystem::new(
            config.recovery.clone(),
            config.sync.clone(),
            availability,
        ));

        Self {
            config,
            health,
            recovery,
        }
    }

    /// Load, override from `BULWARK_*` variables and validate a config file
    pub fn from_file(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let config = ConfigLoader::new().from_file(path)?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &BulwarkConfig {
        &self.config
    }

    pub fn health(&self) -> &Arc<ServiceHealthManager> {
        &self.health
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoverySystem> {
        &self.recovery
    }

    pub fn sync_jobs(&self) -> &Arc<SyncJobManager> {
        self.recovery.sync_jobs()
    }

    /// Start probing a configured service
    pub fn register_service(&self, name: &str, target: ProbeTarget) -> RuntimeResult<()> {
        let config = self
            .config
            .health
            .service(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownService(name.to_string()))?;
        self.health.register(config, target)?;
        Ok(())
    }

    /// Register a configured service that is only checked on demand
    pub fn register_service_on_demand(&self, name: &str, target: ProbeTarget) -> RuntimeResult<()> {
        let config = self
            .config
            .health
            .service(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownService(name.to_string()))?;
        self.health.register_on_demand(config, target)?;
        Ok(())
    }

    /// Schedule the job built by `make_job` whenever `service` recovers
    pub fn resync_on_recovery<F>(&self, service: &str, make_job: F)
    where
        F: Fn(&str) -> SyncJob + Send + Sync + 'static,
    {
        let sync_jobs = self.sync_jobs().clone();
        self.recovery.register_recovery_callback(service, move |recovered| {
            if let Err(e) = sync_jobs.schedule(make_job(recovered)) {
                warn!(service = %recovered, error = %e, "Could not schedule resync job");
            }
        });
    }

    /// Spawn the recovery, monitor and sync loops
    pub fn start(&self) -> RuntimeResult<()> {
        self.recovery.start()?;
        info!(
            services = self.health.registered().len(),
            "Resilience context started"
        );
        Ok(())
    }

    /// Stop recovery first so the final drain still sees live health data,
    /// then stop the probing loops. Health is stopped even when recovery
    /// fails to.
    pub async fn shutdown(&self) -> RuntimeResult<ContextShutdownReport> {
        let recovery = self.recovery.shutdown().await;
        let health = self.health.shutdown().await;

        match (recovery, health) {
            (Ok(recovery), Ok(health)) => {
                info!("Resilience context stopped");
                Ok(ContextShutdownReport { recovery, health })
            }
            (Err(recovery), Ok(_)) => {
                warn!(error = %recovery, "Recovery shutdown failed");
                Err(recovery.into())
            }
            (Ok(_), Err(health)) => {
                warn!(error = %health, "Health shutdown failed");
                Err(health.into())
            }
            (Err(recovery), Err(health)) => Err(RuntimeError::ShutdownFailed { recovery, health }),
        }
    }
}
