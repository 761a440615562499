//! Configuration management for the TN agent.
//!
//! This module provides centralized configuration management with support for:
//! - CLI argument parsing
//! - Environment variable overrides (`TN_CLUSTER_NAME`, `TN_MONITORING_PORT`, `RUST_LOG`)
//! - JSON5 configuration files
//! - Configuration validation before any network side effect

pub mod app_config;
pub mod cli;

pub use app_config::{AppConfig, LogLevel, default_tn_config};
pub use cli::CliConfig;

use anyhow::Result;

/// Main configuration manager that combines all configuration sources
#[derive(Debug, Clone)]
pub struct ConfigManager {
    pub app: AppConfig,
}

impl ConfigManager {
    /// Creates a new configuration manager from CLI arguments and environment
    pub fn from_cli_and_env() -> Result<Self> {
        let cli_config = CliConfig::from_args()?;
        let app_config = AppConfig::from_cli(&cli_config)?;
        Ok(Self { app: app_config })
    }

    /// Validates the entire configuration
    pub fn validate(&self) -> Result<()> {
        self.app.validate()
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self) -> Result<()> {
        self.app.init_logging()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_manager_validation() {
        let matches = CliConfig::build_cli()
            .try_get_matches_from(["tn-agent", "--cluster-name", "core01"])
            .unwrap();
        let cli_config = CliConfig::from_matches(&matches).unwrap();
        let app_config = AppConfig::from_cli_with_env(&cli_config, |_| None).unwrap();

        let config_manager = ConfigManager { app: app_config };

        assert!(config_manager.validate().is_ok());
        assert_eq!(config_manager.app.tn.cluster_name, "core01");
    }
}
