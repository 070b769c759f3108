//! Domain-specific configuration modules

pub mod health;
pub mod logging;
pub mod recovery;
pub mod sync;
pub mod utils;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main bulwark configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BulwarkConfig {
    /// Health probing and circuit breaker configuration
    #[serde(default)]
    pub health: health::HealthConfig,

    /// Recovery engine configuration
    #[serde(default)]
    pub recovery: recovery::RecoveryConfig,

    /// Sync job configuration
    #[serde(default)]
    pub sync: sync::SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl BulwarkConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.health.validate()?;
        self.recovery.validate()?;
        self.sync.validate()?;
        self.logging.validate()?;

        let known: std::collections::HashSet<&str> =
            self.health.services.iter().map(|s| s.name.as_str()).collect();
        for service in &self.health.services {
            for dependency in &service.dependencies {
                if !known.contains(dependency.as_str()) {
                    log::warn!(
                        "Service '{}' depends on '{}', which is not monitored",
                        service.name,
                        dependency
                    );
                }
            }
        }

        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let mut config = BulwarkConfig::default();
        config.health.services = vec![
            health::ServiceConfig::new("cache").critical(),
            health::ServiceConfig::new("storage").critical(),
            health::ServiceConfig::new("embeddings").depends_on("cache"),
        ];
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
