//! Background sync job configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::validation::{Validatable, validate_positive};
use crate::error::ConfigResult;

/// Sync job manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delay between sync worker ticks
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_sync_interval")]
    pub sync_interval: Duration,

    /// Maximum jobs started per sync worker tick
    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: usize,

    /// Finished jobs retained for status queries
    #[serde(default = "default_job_history_limit")]
    pub job_history_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: default_sync_interval(),
            sync_batch_size: default_sync_batch_size(),
            job_history_limit: default_job_history_limit(),
        }
    }
}

impl Validatable for SyncConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.sync_interval.as_millis(), "sync_interval", self.domain_name())?;
        validate_positive(self.sync_batch_size, "sync_batch_size", self.domain_name())?;
        validate_positive(self.job_history_limit, "job_history_limit", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "sync"
    }
}

fn default_sync_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_sync_batch_size() -> usize {
    5
}

fn default_job_history_limit() -> usize {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_batch_size, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = SyncConfig {
            sync_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
