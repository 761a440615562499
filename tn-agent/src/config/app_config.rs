//! Application configuration for the TN agent.
//!
//! Merges the JSON5 configuration file (or built-in defaults), environment
//! variables and CLI overrides into the [`TnConfig`] the agent starts with,
//! plus the runtime [`AgentOptions`] and the log level.

use anyhow::{Context, Result};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tn_shared::{BandwidthPolicy, Filter, NetworkInterface, TnConfig, Validate, VxlanConfig};

use super::cli::CliConfig;
use crate::agent::AgentOptions;

/// Environment variable consulted for the cluster name.
pub const ENV_CLUSTER_NAME: &str = "TN_CLUSTER_NAME";
/// Environment variable consulted for the monitoring port.
pub const ENV_MONITORING_PORT: &str = "TN_MONITORING_PORT";

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
    pub tn: TnConfig,
    pub bind_address: IpAddr,
    pub log_level: LogLevel,
    pub options: AgentOptions,
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

        let mut tn = match &cli_config.config_file {
            Some(path) => Self::load_tn_config(path)?,
            None => default_tn_config(),
        };

        match &cli_config.cluster_name {
            Some(name) => tn.cluster_name = name.clone(),
            None => {
                if let Some(name) = lookup(ENV_CLUSTER_NAME).filter(|n| !n.is_empty()) {
                    tn.cluster_name = name;
                }
            }
        }

        match cli_config.port {
            Some(port) => tn.monitoring_port = port,
            None => {
                if let Some(raw) = lookup(ENV_MONITORING_PORT) {
                    tn.monitoring_port = raw.trim().parse().with_context(|| {
                        format!("{} must be a port number, got '{}'", ENV_MONITORING_PORT, raw)
                    })?;
                }
            }
        }

        if let Some(local_ip) = &cli_config.local_ip {
            tn.vxlan.local_ip = local_ip.clone();
        }

        let bind_address: IpAddr = cli_config
            .bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", cli_config.bind))?;

        let options = AgentOptions {
            health_interval: Duration::from_secs(cli_config.health_interval_secs),
            monitor_interval: Duration::from_secs(cli_config.monitor_interval_secs),
            command_timeout: Duration::from_secs(cli_config.command_timeout_secs),
            ..AgentOptions::default()
        };

        Ok(Self {
            tn,
            bind_address,
            log_level,
            options,
        })
    }

    fn load_tn_config(path: &Path) -> Result<TnConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        TnConfig::from_json5(&content)
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

    /// Socket address of the HTTP API.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.tn.monitoring_port)
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
        self.tn
            .validate()
            .map_err(|e| anyhow::anyhow!("TN configuration error: {}", e))?;

        if self.options.health_interval.is_zero() {
            return Err(anyhow::anyhow!("Health interval must be greater than 0"));
        }
        if self.options.monitor_interval.is_zero() {
            return Err(anyhow::anyhow!("Monitor interval must be greater than 0"));
        }
        if self.options.command_timeout.is_zero() {
            return Err(anyhow::anyhow!("Command timeout must be greater than 0"));
        }

        Ok(())
    }
}

/// Configuration used when no file is given: one physical uplink, VNI 1000
/// and a 10 Mbps shaped class with light netem impairment.
pub fn default_tn_config() -> TnConfig {
    TnConfig {
        cluster_name: "tn-agent".to_string(),
        network_cidr: "10.244.0.0/24".to_string(),
        vxlan: VxlanConfig {
            vni: 1000,
            remote_ips: Vec::new(),
            local_ip: "192.168.1.10".to_string(),
            port: tn_shared::DEFAULT_VXLAN_PORT,
            mtu: tn_shared::DEFAULT_VXLAN_MTU,
            device_name: "vxlan0".to_string(),
            learning: false,
            physical_interface: None,
        },
        bandwidth_policy: BandwidthPolicy {
            downlink_mbps: 10.0,
            uplink_mbps: 10.0,
            latency_ms: 10.0,
            jitter_ms: 2.0,
            loss_percent: 0.1,
            priority: 2,
            queue_class: "htb".to_string(),
            burst: String::new(),
            filters: vec![Filter {
                protocol: "tcp".to_string(),
                class_id: "1:10".to_string(),
                priority: 10,
                ..Filter::default()
            }],
        },
        qos_class: "default".to_string(),
        interfaces: vec![NetworkInterface {
            name: "eth0".to_string(),
            kind: "physical".to_string(),
            mtu: 1500,
            state: "up".to_string(),
            ..NetworkInterface::default()
        }],
        monitoring_port: 8080,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn cli(args: &[&str]) -> CliConfig {
        let mut argv = vec!["tn-agent"];
        argv.extend_from_slice(args);
        let matches = CliConfig::build_cli().try_get_matches_from(argv).unwrap();
        CliConfig::from_matches(&matches).unwrap()
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(AppConfig::parse_log_level("info"), LogLevel::Info);
        assert_eq!(AppConfig::parse_log_level("debug"), LogLevel::Debug);
        assert_eq!(AppConfig::parse_log_level("warn"), LogLevel::Warn);
        assert_eq!(AppConfig::parse_log_level("error"), LogLevel::Error);
        assert_eq!(AppConfig::parse_log_level("trace"), LogLevel::Trace);
        assert_eq!(AppConfig::parse_log_level("invalid"), LogLevel::Info);
    }

    #[test]
    fn test_log_level_complex_parsing() {
        assert_eq!(
            AppConfig::parse_log_level("info,tower_http=warn,hyper=warn"),
            LogLevel::Info
        );
        assert_eq!(
            AppConfig::parse_log_level("debug,some_crate=info"),
            LogLevel::Debug
        );
    }

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::from_cli_with_env(&cli(&[]), env_of(&[])).unwrap();
        assert_eq!(config.tn.cluster_name, "tn-agent");
        assert_eq!(config.tn.monitoring_port, 8080);
        assert_eq!(config.tn.vxlan.vni, 1000);
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.options.monitor_interval, Duration::from_secs(5));
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_used_only_when_flag_absent() {
        let env = env_of(&[
            (ENV_CLUSTER_NAME, "from-env"),
            (ENV_MONITORING_PORT, "9100"),
            ("RUST_LOG", "warn,hyper=error"),
        ]);
        let config = AppConfig::from_cli_with_env(&cli(&[]), &env).unwrap();
        assert_eq!(config.tn.cluster_name, "from-env");
        assert_eq!(config.tn.monitoring_port, 9100);
        assert_eq!(config.log_level, LogLevel::Warn);

        let config = AppConfig::from_cli_with_env(
            &cli(&["--cluster-name", "from-flag", "--port", "9200", "-v"]),
            &env,
        )
        .unwrap();
        assert_eq!(config.tn.cluster_name, "from-flag");
        assert_eq!(config.tn.monitoring_port, 9200);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_invalid_env_port_is_rejected() {
        let result =
            AppConfig::from_cli_with_env(&cli(&[]), env_of(&[(ENV_MONITORING_PORT, "http")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                // edge site
                clusterName: "edge02",
                monitoringPort: 8180,
                vxlan: {{ vni: 42, localIP: "10.0.0.2", remoteIPs: ["10.0.0.3"] }},
                bandwidthPolicy: {{ downlinkMbps: 4.57, uplinkMbps: 4.57, latencyMs: 16.1 }},
            }}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = AppConfig::from_cli_with_env(
            &cli(&["--config", &path, "--local-ip", "10.0.0.9"]),
            env_of(&[]),
        )
        .unwrap();
        assert_eq!(config.tn.cluster_name, "edge02");
        assert_eq!(config.tn.monitoring_port, 8180);
        assert_eq!(config.tn.vxlan.vni, 42);
        assert_eq!(config.tn.vxlan.local_ip, "10.0.0.9");
        assert_eq!(config.tn.vxlan.remote_ips, vec!["10.0.0.3".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = AppConfig::from_cli_with_env(
            &cli(&["--config", "/nonexistent/tn-agent.json5"]),
            env_of(&[]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_failures() {
        let config = AppConfig::from_cli_with_env(&cli(&["--local-ip", "not-an-ip"]), env_of(&[]))
            .unwrap();
        assert!(config.validate().is_err());

        let config = AppConfig::from_cli_with_env(
            &cli(&["--monitor-interval-secs", "0"]),
            env_of(&[]),
        )
        .unwrap();
        assert!(config.validate().is_err());

        let config =
            AppConfig::from_cli_with_env(&cli(&["--cluster-name", "bad name!"]), env_of(&[]))
                .unwrap();
        assert!(config.validate().is_err());
    }
}
