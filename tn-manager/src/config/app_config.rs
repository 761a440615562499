//! Application configuration for the TN manager.
//!
//! Merges the JSON5 manager file (or built-in defaults), environment
//! variables and CLI overrides into the agent list, the monitoring settings
//! and the runtime [`ManagerOptions`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tn_shared::serde_helpers;

use super::cli::CliConfig;
use crate::client::parse_endpoint;
use crate::collector::DEFAULT_MAX_SAMPLES;
use crate::compliance::{DEFAULT_COMPLIANCE_THRESHOLD, DEFAULT_TOLERANCE};
use crate::manager::ManagerOptions;

/// Environment variable consulted for the export directory.
pub const ENV_EXPORT_DIR: &str = "TN_EXPORT_DIR";

fn default_true() -> bool {
    true
}

/// One agent of the manager file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overlay address of the cluster; the endpoint host is used when absent
    #[serde(default, rename = "clusterIP", skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringConfig {
    #[serde(with = "serde_helpers::duration")]
    pub metrics_interval: Duration,
    pub max_samples: usize,
    pub export_directory: Option<PathBuf>,
    /// Export a report every `export_interval` while running
    pub enable_continuous: bool,
    #[serde(with = "serde_helpers::duration")]
    pub export_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(30),
            max_samples: DEFAULT_MAX_SAMPLES,
            export_directory: None,
            enable_continuous: false,
            export_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComplianceConfig {
    pub threshold: f64,
    pub tolerance: f64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_COMPLIANCE_THRESHOLD,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Layout of the JSON5 manager file
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerFileConfig {
    pub agents: Vec<AgentEntry>,
    pub monitoring: MonitoringConfig,
    pub compliance: ComplianceConfig,
}

impl ManagerFileConfig {
    pub fn from_json5(content: &str) -> Result<Self> {
        json5::from_str(content).map_err(|e| anyhow::anyhow!("{}", e))
    }
}

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Application configuration structure
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub agents: Vec<AgentEntry>,
    pub monitoring: MonitoringConfig,
    pub log_level: LogLevel,
    pub options: ManagerOptions,
}

impl AppConfig {
    /// Create application configuration from CLI config and the process environment
    pub fn from_cli(cli_config: &CliConfig) -> Result<Self> {
        Self::from_cli_with_env(cli_config, |key| env::var(key).ok())
    }

    /// Same as [`AppConfig::from_cli`] with an explicit environment lookup.
    pub fn from_cli_with_env<F>(cli_config: &CliConfig, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = if cli_config.verbose {
            LogLevel::Debug
        } else {
            match lookup("RUST_LOG") {
                Some(level_str) => Self::parse_log_level(&level_str),
                None => LogLevel::Info,
            }
        };

        let file = match &cli_config.config_file {
            Some(path) => Self::load_file(path)?,
            None => ManagerFileConfig::default(),
        };
        let ManagerFileConfig {
            mut agents,
            mut monitoring,
            compliance,
        } = file;

        // Flag agents replace file agents of the same name
        for arg in &cli_config.agents {
            agents.retain(|a| a.name != arg.name);
            agents.push(AgentEntry {
                name: arg.name.clone(),
                endpoint: arg.endpoint.clone(),
                enabled: true,
                cluster_ip: None,
            });
        }

        match &cli_config.export_dir {
            Some(dir) => monitoring.export_directory = Some(dir.clone()),
            None => {
                if let Some(dir) = lookup(ENV_EXPORT_DIR).filter(|d| !d.is_empty()) {
                    monitoring.export_directory = Some(PathBuf::from(dir));
                }
            }
        }

        if let Some(secs) = cli_config.collection_interval_secs {
            monitoring.metrics_interval = Duration::from_secs(secs);
        }

        let options = ManagerOptions {
            compliance_threshold: cli_config
                .compliance_threshold
                .unwrap_or(compliance.threshold),
            tolerance: cli_config.tolerance.unwrap_or(compliance.tolerance),
            request_timeout: Duration::from_secs(cli_config.request_timeout_secs),
            collection_interval: monitoring.metrics_interval,
            max_samples: monitoring.max_samples,
            ..ManagerOptions::default()
        };

        Ok(Self {
            agents,
            monitoring,
            log_level,
            options,
        })
    }

    fn load_file(path: &Path) -> Result<ManagerFileConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        ManagerFileConfig::from_json5(&content)
            .with_context(|| format!("failed to parse configuration file {}", path.display()))
    }

    /// Parse log level from string
    fn parse_log_level(level_str: &str) -> LogLevel {
        // Extract the main log level from complex RUST_LOG format
        let main_level = level_str
            .split(',')
            .next()
            .unwrap_or(level_str)
            .split('=')
            .next()
            .unwrap_or(level_str)
            .to_lowercase();

        match main_level.as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    /// Agents that should be registered at startup.
    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentEntry> {
        self.agents.iter().filter(|a| a.enabled)
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self) -> Result<()> {
        tracing_subscriber::fmt()
            .with_max_level(self.log_level.as_tracing_level())
            .with_target(false)
            .with_level(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(true)
            .event_format(
                tracing_subscriber::fmt::format()
                    .with_target(false)
                    .compact(),
            )
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))?;

        tracing::info!("Logging initialized with level: {:?}", self.log_level);
        Ok(())
    }

    /// Validate application configuration
    pub fn validate(&self) -> Result<()> {
        let threshold = self.options.compliance_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(anyhow::anyhow!(
                "Compliance threshold must be between 0 and 100, got {}",
                threshold
            ));
        }
        let tolerance = self.options.tolerance;
        if !(0.0..1.0).contains(&tolerance) {
            return Err(anyhow::anyhow!(
                "Tolerance must be a fraction in [0, 1), got {}",
                tolerance
            ));
        }
        if self.options.request_timeout.is_zero() {
            return Err(anyhow::anyhow!("Request timeout must be greater than 0"));
        }
        if self.monitoring.metrics_interval.is_zero() {
            return Err(anyhow::anyhow!("Metrics interval must be greater than 0"));
        }
        if self.monitoring.max_samples == 0 {
            return Err(anyhow::anyhow!("maxSamples must be greater than 0"));
        }
        if self.monitoring.enable_continuous {
            if self.monitoring.export_directory.is_none() {
                return Err(anyhow::anyhow!(
                    "Continuous export needs an export directory"
                ));
            }
            if self.monitoring.export_interval.is_zero() {
                return Err(anyhow::anyhow!("Export interval must be greater than 0"));
            }
        }

        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(anyhow::anyhow!("Agent name cannot be empty"));
            }
            if !names.insert(agent.name.as_str()) {
                return Err(anyhow::anyhow!("Agent '{}' is listed twice", agent.name));
            }
            parse_endpoint(&agent.endpoint)
                .map_err(|e| anyhow::anyhow!("Agent '{}': {}", agent.name, e))?;
            if let Some(ip) = &agent.cluster_ip {
                tn_shared::parse_ip("clusterIP", ip)
                    .map_err(|e| anyhow::anyhow!("Agent '{}': {}", agent.name, e))?;
            }
        }

        Ok(())
    }
}
