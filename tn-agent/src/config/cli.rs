//! CLI argument parsing for the TN agent.
//!
//! Flags override values from the configuration file; environment variables
//! are consulted only when the matching flag is absent.

use anyhow::Result;
use clap::{Arg, ArgMatches, Command, value_parser};
use std::path::PathBuf;

/// CLI configuration structure containing all parsed command line arguments
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub config_file: Option<PathBuf>,
    pub cluster_name: Option<String>,
    pub local_ip: Option<String>,
    pub port: Option<u16>,
    pub bind: String,
    pub verbose: bool,
    pub health_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub command_timeout_secs: u64,
}

impl CliConfig {
    /// Parse CLI arguments and create CliConfig
    pub fn from_args() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Create CliConfig from pre-parsed ArgMatches (useful for testing)
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let bind = matches
            .get_one::<String>("bind")
            .ok_or_else(|| anyhow::anyhow!("Bind address is required"))?
            .clone();

        let interval = |name: &str| -> Result<u64> {
            matches
                .get_one::<u64>(name)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("--{} is required", name))
        };

        Ok(Self {
            config_file: matches.get_one::<PathBuf>("config").cloned(),
            cluster_name: matches.get_one::<String>("cluster-name").cloned(),
            local_ip: matches.get_one::<String>("local-ip").cloned(),
            port: matches.get_one::<u16>("port").copied(),
            bind,
            verbose: matches.get_flag("verbose"),
            health_interval_secs: interval("health-interval-secs")?,
            monitor_interval_secs: interval("monitor-interval-secs")?,
            command_timeout_secs: interval("command-timeout-secs")?,
        })
    }

    /// Build the clap Command structure
    pub fn build_cli() -> Command {
        Command::new("tn-agent")
            .version(env!("CARGO_PKG_VERSION"))
            .about("TN Agent - per-cluster VXLAN, traffic shaping and performance testing")
            .long_about(
                "Per-cluster transport network agent. Owns the VXLAN overlay tunnel, the \
                 tc shaping rules for the cluster's slices and a set of iperf3 servers, and \
                 exposes them over an HTTP API consumed by the TN manager.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .value_parser(value_parser!(PathBuf))
                    .help("JSON5 TN configuration file")
                    .long_help(
                        "JSON5 file holding the agent's TN configuration (cluster name, VXLAN \
                         segment, bandwidth policy, interfaces, monitoring port). Built-in \
                         defaults are used when omitted.",
                    ),
            )
            .arg(
                Arg::new("cluster-name")
                    .short('n')
                    .long("cluster-name")
                    .value_name("NAME")
                    .help("Cluster name reported by this agent (env: TN_CLUSTER_NAME)"),
            )
            .arg(
                Arg::new("local-ip")
                    .long("local-ip")
                    .value_name("IP")
                    .help("Override the VXLAN local address"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .value_parser(value_parser!(u16))
                    .help("Override the monitoring port (env: TN_MONITORING_PORT)")
                    .long_help(
                        "HTTP API port. iperf3 servers are started on the three ports directly \
                         above it.",
                    ),
            )
            .arg(
                Arg::new("bind")
                    .long("bind")
                    .value_name("ADDR")
                    .default_value("0.0.0.0")
                    .help("Address the HTTP API binds to"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(clap::ArgAction::SetTrue)
                    .help("Enable verbose logging")
                    .long_help(
                        "Enable verbose debug logging. This will show every ip, bridge, tc, \
                         iperf3 and ping invocation and each HTTP request.",
                    ),
            )
            .arg(
                Arg::new("health-interval-secs")
                    .long("health-interval-secs")
                    .value_name("SECS")
                    .value_parser(value_parser!(u64))
                    .default_value("30")
                    .help("Seconds between health checks"),
            )
            .arg(
                Arg::new("monitor-interval-secs")
                    .long("monitor-interval-secs")
                    .value_name("SECS")
                    .value_parser(value_parser!(u64))
                    .default_value("5")
                    .help("Seconds between bandwidth samples"),
            )
            .arg(
                Arg::new("command-timeout-secs")
                    .long("command-timeout-secs")
                    .value_name("SECS")
                    .value_parser(value_parser!(u64))
                    .default_value("30")
                    .help("Timeout applied to each ip/bridge/tc invocation"),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_config_default_values() {
        let matches = CliConfig::build_cli()
            .try_get_matches_from(["tn-agent"])
            .unwrap();

        let config = CliConfig::from_matches(&matches).unwrap();

        assert!(!config.verbose);
        assert!(config.config_file.is_none());
        assert!(config.cluster_name.is_none());
        assert!(config.local_ip.is_none());
        assert!(config.port.is_none());
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.health_interval_secs, 30);
        assert_eq!(config.monitor_interval_secs, 5);
        assert_eq!(config.command_timeout_secs, 30);
    }

    #[test]
    fn test_cli_config_custom_values() {
        let matches = CliConfig::build_cli()
            .try_get_matches_from([
                "tn-agent",
                "--verbose",
                "--config",
                "/etc/tn/agent.json5",
                "--cluster-name",
                "edge01",
                "--local-ip",
                "10.0.0.5",
                "--port",
                "9090",
                "--bind",
                "127.0.0.1",
                "--health-interval-secs",
                "10",
                "--monitor-interval-secs",
                "2",
                "--command-timeout-secs",
                "15",
            ])
            .unwrap();

        let config = CliConfig::from_matches(&matches).unwrap();

        assert!(config.verbose);
        assert_eq!(config.config_file, Some(PathBuf::from("/etc/tn/agent.json5")));
        assert_eq!(config.cluster_name.as_deref(), Some("edge01"));
        assert_eq!(config.local_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.port, Some(9090));
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.health_interval_secs, 10);
        assert_eq!(config.monitor_interval_secs, 2);
        assert_eq!(config.command_timeout_secs, 15);
    }

    #[test]
    fn test_cli_rejects_invalid_port() {
        let result = CliConfig::build_cli().try_get_matches_from(["tn-agent", "--port", "70000"]);
        assert!(result.is_err());
    }
}
