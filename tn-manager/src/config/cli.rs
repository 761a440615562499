//! CLI argument parsing for the TN manager.
//!
//! Flags override values from the configuration file; `TN_EXPORT_DIR` is
//! consulted only when `--export-dir` is absent.

use anyhow::Result;
use clap::{Arg, ArgMatches, Command, value_parser};
use std::path::PathBuf;

/// An agent given on the command line as `name=url`
#[derive(Debug, Clone, PartialEq)]
pub struct AgentArg {
    pub name: String,
    pub endpoint: String,
}

impl std::str::FromStr for AgentArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, endpoint) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=URL, got '{}'", s))?;
        let (name, endpoint) = (name.trim(), endpoint.trim());
        if name.is_empty() || endpoint.is_empty() {
            return Err(format!("expected NAME=URL, got '{}'", s));
        }
        Ok(Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
        })
    }
}

/// CLI configuration structure containing all parsed command line arguments
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub config_file: Option<PathBuf>,
    pub agents: Vec<AgentArg>,
    pub compliance_threshold: Option<f64>,
    pub tolerance: Option<f64>,
    pub export_dir: Option<PathBuf>,
    pub collection_interval_secs: Option<u64>,
    pub request_timeout_secs: u64,
    pub verbose: bool,
}

impl CliConfig {
    /// Parse CLI arguments and create CliConfig
    pub fn from_args() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Create CliConfig from pre-parsed ArgMatches (useful for testing)
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let request_timeout_secs = matches
            .get_one::<u64>("request-timeout-secs")
            .copied()
            .ok_or_else(|| anyhow::anyhow!("--request-timeout-secs is required"))?;

        Ok(Self {
            config_file: matches.get_one::<PathBuf>("config").cloned(),
            agents: matches
                .get_many::<AgentArg>("agent")
                .map(|values| values.cloned().collect())
                .unwrap_or_default(),
            compliance_threshold: matches.get_one::<f64>("compliance-threshold").copied(),
            tolerance: matches.get_one::<f64>("tolerance").copied(),
            export_dir: matches.get_one::<PathBuf>("export-dir").cloned(),
            collection_interval_secs: matches.get_one::<u64>("collection-interval-secs").copied(),
            request_timeout_secs,
            verbose: matches.get_flag("verbose"),
        })
    }

    /// Build the clap Command structure
    pub fn build_cli() -> Command {
        Command::new("tn-manager")
            .version(env!("CARGO_PKG_VERSION"))
            .about("TN Manager - multi-cluster transport network coordinator")
            .long_about(
                "Coordinates the TN agents of several clusters: registers them, turns \
                 placement decisions into per-cluster TN configurations, runs performance \
                 tests across clusters and scores the results against the reference slice \
                 targets.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .value_parser(value_parser!(PathBuf))
                    .help("JSON5 manager configuration file")
                    .long_help(
                        "JSON5 file with the agent list ({name, endpoint, enabled}), monitoring \
                         settings (metricsInterval, maxSamples, exportDirectory, \
                         enableContinuous, exportInterval) and compliance settings \
                         (threshold, tolerance).",
                    ),
            )
            .arg(
                Arg::new("agent")
                    .short('a')
                    .long("agent")
                    .value_name("NAME=URL")
                    .value_parser(value_parser!(AgentArg))
                    .action(clap::ArgAction::Append)
                    .help("Register an agent, e.g. edge01=http://10.0.0.1:8080 (repeatable)"),
            )
            .arg(
                Arg::new("compliance-threshold")
                    .long("compliance-threshold")
                    .value_name("PERCENT")
                    .value_parser(value_parser!(f64))
                    .help("Compliance percentage a slice needs to pass [default: 80]"),
            )
            .arg(
                Arg::new("tolerance")
                    .long("tolerance")
                    .value_name("FRACTION")
                    .value_parser(value_parser!(f64))
                    .help("Tolerance applied to throughput and RTT targets [default: 0.10]"),
            )
            .arg(
                Arg::new("export-dir")
                    .long("export-dir")
                    .value_name("DIR")
                    .value_parser(value_parser!(PathBuf))
                    .help("Directory for metrics reports (env: TN_EXPORT_DIR)"),
            )
            .arg(
                Arg::new("collection-interval-secs")
                    .long("collection-interval-secs")
                    .value_name("SECS")
                    .value_parser(value_parser!(u64))
                    .help("Seconds between agent status collections [default: 30]"),
            )
            .arg(
                Arg::new("request-timeout-secs")
                    .long("request-timeout-secs")
                    .value_name("SECS")
                    .value_parser(value_parser!(u64))
                    .default_value("30")
                    .help("Timeout of a single request to an agent"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(clap::ArgAction::SetTrue)
                    .help("Enable verbose logging")
                    .long_help(
                        "Enable verbose debug logging. This will show every agent request, \
                         retry and per-cluster placement step.",
                    ),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_config_default_values() {
        let matches = CliConfig::build_cli()
            .try_get_matches_from(["tn-manager"])
            .unwrap();

        let config = CliConfig::from_matches(&matches).unwrap();

        assert!(!config.verbose);
        assert!(config.config_file.is_none());
        assert!(config.agents.is_empty());
        assert!(config.compliance_threshold.is_none());
        assert!(config.tolerance.is_none());
        assert!(config.export_dir.is_none());
        assert!(config.collection_interval_secs.is_none());
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_cli_config_custom_values() {
        let matches = CliConfig::build_cli()
            .try_get_matches_from([
                "tn-manager",
                "-v",
                "--config",
                "/etc/tn/manager.json5",
                "--agent",
                "edge01=http://10.0.0.1:8080",
                "-a",
                "core01=http://10.0.0.3:8080",
                "--compliance-threshold",
                "90",
                "--tolerance",
                "0.05",
                "--export-dir",
                "/var/lib/tn/reports",
                "--collection-interval-secs",
                "10",
                "--request-timeout-secs",
                "5",
            ])
            .unwrap();

        let config = CliConfig::from_matches(&matches).unwrap();

        assert!(config.verbose);
        assert_eq!(config.config_file, Some(PathBuf::from("/etc/tn/manager.json5")));
        assert_eq!(
            config.agents,
            vec![
                AgentArg {
                    name: "edge01".to_string(),
                    endpoint: "http://10.0.0.1:8080".to_string()
                },
                AgentArg {
                    name: "core01".to_string(),
                    endpoint: "http://10.0.0.3:8080".to_string()
                },
            ]
        );
        assert_eq!(config.compliance_threshold, Some(90.0));
        assert_eq!(config.tolerance, Some(0.05));
        assert_eq!(config.export_dir, Some(PathBuf::from("/var/lib/tn/reports")));
        assert_eq!(config.collection_interval_secs, Some(10));
        assert_eq!(config.request_timeout_secs, 5);
    }

    #[test]
    fn test_cli_rejects_malformed_agent() {
        for bad in ["edge01", "=http://10.0.0.1:8080", "edge01="] {
            let result = CliConfig::build_cli().try_get_matches_from(["tn-manager", "--agent", bad]);
            assert!(result.is_err(), "{} accepted", bad);
        }
    }
}
