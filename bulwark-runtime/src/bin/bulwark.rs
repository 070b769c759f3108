//! bulwark command line

use anyhow::{Context, Result};
use bulwark_config::{BulwarkConfig, ConfigLoader};
use bulwark_logging::{init_logging_from_config, init_simple_tracing, LoggingConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a sample configuration file
    SampleConfig,

    /// Load and validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(value_name = "PATH")]
        config_file: PathBuf,

        /// Print the effective configuration as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(log_level: Option<&String>) -> Result<()> {
    let mut logging = LoggingConfig::default();
    if let Some(level) = log_level {
        match level.parse() {
            Ok(level) => logging.level = level,
            Err(_) => return init_simple_tracing(level),
        }
    }
    init_logging_from_config(&logging)
}

fn handle_validate(config_file: &PathBuf, json: bool) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        anyhow::bail!("Configuration file not found: {:?}", config_file);
    }

    let config: BulwarkConfig = match ConfigLoader::new().from_file(config_file) {
        Ok(config) => config,
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            error!("Configuration validation failed: {}", e);
            return Err(e.into());
        }
    };

    if json {
        let rendered = serde_json::to_string_pretty(&config).context("Failed to render configuration")?;
        println!("{}", rendered);
    } else {
        let critical = config
            .health
            .services
            .iter()
            .filter(|s| s.critical_service)
            .count();
        println!("Configuration file is valid");
        println!(
            "  services: {} ({} critical)",
            config.health.services.len(),
            critical
        );
        println!(
            "  recovery: enabled={} batch={} queue_capacity={} max_retries={}",
            config.recovery.enabled,
            config.recovery.worker_batch_size,
            config.recovery.queue_capacity,
            config.recovery.retry.max_retry_attempts
        );
        println!("  sync: batch={}", config.sync.sync_batch_size);
    }
    info!("Configuration validation passed");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_ref())?;

    match &cli.command {
        Commands::SampleConfig => {
            print!("{}", BulwarkConfig::generate_sample());
            Ok(())
        }
        Commands::Validate { config_file, json } => handle_validate(config_file, *json),
    }
}
