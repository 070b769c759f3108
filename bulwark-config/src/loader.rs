//! Configuration loading and environment variable handling

use crate::domains::BulwarkConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "BULWARK".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<BulwarkConfig> {
        let content = std::fs::read_to_string(path)?;
        self.from_yaml_str(&content)
    }

    /// Load configuration from YAML text with environment overrides
    pub fn from_yaml_str(&self, content: &str) -> ConfigResult<BulwarkConfig> {
        let mut config: BulwarkConfig = serde_yaml::from_str(content)?;

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config)?;

        // Validate all domains
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<BulwarkConfig> {
        let mut config = BulwarkConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<BulwarkConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut BulwarkConfig) -> ConfigResult<()> {
        self.apply_health_overrides(&mut config.health)?;
        self.apply_recovery_overrides(&mut config.recovery)?;
        self.apply_sync_overrides(&mut config.sync)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply health config overrides
    fn apply_health_overrides(
        &self,
        config: &mut crate::domains::health::HealthConfig,
    ) -> ConfigResult<()> {
        if let Some(millis) = self.parse_env::<u64>("LATENCY_CRITICAL_MS")? {
            config.latency_critical_threshold = Duration::from_millis(millis);
        }
        Ok(())
    }

    /// Apply recovery config overrides
    fn apply_recovery_overrides(
        &self,
        config: &mut crate::domains::recovery::RecoveryConfig,
    ) -> ConfigResult<()> {
        if let Some(enabled) = self.parse_env("RECOVERY_ENABLED")? {
            config.enabled = enabled;
        }

        if let Some(batch) = self.parse_env("WORKER_BATCH_SIZE")? {
            config.worker_batch_size = batch;
        }

        if let Some(capacity) = self.parse_env("QUEUE_CAPACITY")? {
            config.queue_capacity = capacity;
        }

        if let Some(attempts) = self.parse_env("MAX_RETRY_ATTEMPTS")? {
            config.retry.max_retry_attempts = attempts;
        }

        if let Some(rate) = self.parse_env("CONSISTENCY_SAMPLE_RATE")? {
            config.consistency_check_sample_rate = rate;
        }

        if let Some(capacity) = self.parse_env("DEAD_LETTER_CAPACITY")? {
            config.dead_letter_capacity = capacity;
        }

        Ok(())
    }

    /// Apply sync config overrides
    fn apply_sync_overrides(
        &self,
        config: &mut crate::domains::sync::SyncConfig,
    ) -> ConfigResult<()> {
        if let Some(batch) = self.parse_env("SYNC_BATCH_SIZE")? {
            config.sync_batch_size = batch;
        }
        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Parse a prefixed environment variable if it is set
    fn parse_env<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e))),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
