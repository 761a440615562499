//! Performance test configuration, measured metrics and status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::serde_helpers;

/// Kind of performance test to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    #[serde(alias = "iperf3")]
    Throughput,
    #[serde(alias = "ping")]
    Latency,
    #[default]
    Comprehensive,
    Concurrent,
}

impl TestType {
    pub fn wants_throughput(&self) -> bool {
        !matches!(self, TestType::Latency)
    }

    pub fn wants_latency(&self) -> bool {
        !matches!(self, TestType::Throughput)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Throughput => "throughput",
            TestType::Latency => "latency",
            TestType::Comprehensive => "comprehensive",
            TestType::Concurrent => "concurrent",
        }
    }
}

fn default_test_duration() -> Duration {
    Duration::from_secs(10)
}

fn default_parallel() -> u32 {
    1
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Parameters of a performance test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceTestConfig {
    #[serde(default)]
    pub test_id: String,
    #[serde(default)]
    pub slice_id: String,
    #[serde(default)]
    pub slice_type: String,
    #[serde(with = "serde_helpers::duration", default = "default_test_duration")]
    pub duration: Duration,
    #[serde(default)]
    pub test_type: TestType,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_parallel")]
    pub parallel: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub window_size: String,
    #[serde(
        with = "serde_helpers::option_duration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub interval: Option<Duration>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_cluster: String,
}

impl Default for PerformanceTestConfig {
    fn default() -> Self {
        Self {
            test_id: String::new(),
            slice_id: String::new(),
            slice_type: String::new(),
            duration: default_test_duration(),
            test_type: TestType::default(),
            protocol: default_protocol(),
            parallel: default_parallel(),
            window_size: String::new(),
            interval: None,
            source_cluster: String::new(),
            target_cluster: String::new(),
        }
    }
}

/// Throughput figures in Mbps
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThroughputMetrics {
    pub downlink_mbps: f64,
    pub uplink_mbps: f64,
    pub bi_dir_mbps: f64,
    pub target_mbps: f64,
    pub achieved_ratio: f64,
    pub peak_mbps: f64,
    pub min_mbps: f64,
    pub avg_mbps: f64,
    pub std_dev_mbps: f64,
}

/// Round-trip time figures in milliseconds
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LatencyMetrics {
    pub rtt_ms: f64,
    pub min_rtt_ms: f64,
    pub max_rtt_ms: f64,
    pub avg_rtt_ms: f64,
    pub std_dev_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub target_ms: f64,
}

/// Measured results of one test on one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub timestamp: DateTime<Utc>,
    pub cluster_name: String,
    pub test_id: String,
    pub test_type: String,
    #[serde(with = "serde_helpers::duration")]
    pub duration: Duration,
    pub throughput: ThroughputMetrics,
    pub latency: LatencyMetrics,
    pub packet_loss: f64,
    pub jitter: f64,
    pub bandwidth_utilization: f64,
    pub qos_class: String,
    pub vxlan_overhead: f64,
    pub tc_overhead: f64,
    #[serde(default)]
    pub network_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_details: Vec<String>,
}

impl PerformanceMetrics {
    pub fn new(cluster_name: &str, test_id: &str, test_type: TestType, duration: Duration) -> Self {
        Self {
            timestamp: Utc::now(),
            cluster_name: cluster_name.to_string(),
            test_id: test_id.to_string(),
            test_type: test_type.as_str().to_string(),
            duration,
            throughput: ThroughputMetrics::default(),
            latency: LatencyMetrics::default(),
            packet_loss: 0.0,
            jitter: 0.0,
            bandwidth_utilization: 0.0,
            qos_class: String::new(),
            vxlan_overhead: 0.0,
            tc_overhead: 0.0,
            network_path: Vec::new(),
            error_details: Vec::new(),
        }
    }
}

/// Comparison of aggregated results against the reference targets
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThesisValidation {
    pub throughput_targets: Vec<f64>,
    pub rtt_targets: Vec<f64>,
    pub throughput_results: Vec<f64>,
    pub rtt_results: Vec<f64>,
    pub passed_tests: u32,
    pub total_tests: u32,
    pub compliance_percent: f64,
    pub deploy_time_ms: i64,
    pub deploy_target_ms: i64,
}

/// Aggregated result of a performance test across every cluster of a slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSliceMetrics {
    pub slice_id: String,
    pub slice_type: String,
    pub timestamp: DateTime<Utc>,
    pub sla_compliance: bool,
    pub performance: PerformanceMetrics,
    pub thesis_validation: ThesisValidation,
    #[serde(default)]
    pub cluster_metrics: BTreeMap<String, PerformanceMetrics>,
}

/// Overlay tunnel part of an agent status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VxlanStatus {
    pub tunnel_up: bool,
    pub remote_peers: Vec<String>,
    pub packet_stats: BTreeMap<String, u64>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Traffic shaping part of an agent status snapshot
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcStatus {
    pub rules_active: bool,
    pub queue_stats: BTreeMap<String, u64>,
    pub shaping_active: bool,
    pub interfaces: Vec<String>,
}

/// Point-in-time snapshot of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TnStatus {
    pub healthy: bool,
    pub last_update: DateTime<Utc>,
    pub active_connections: u32,
    pub bandwidth_usage: BTreeMap<String, f64>,
    pub vxlan_status: VxlanStatus,
    pub tc_status: TcStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_messages: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_aliases() {
        let config: PerformanceTestConfig =
            serde_json::from_str(r#"{"testType":"iperf3","duration":"30s"}"#).unwrap();
        assert_eq!(config.test_type, TestType::Throughput);
        assert_eq!(config.duration, Duration::from_secs(30));
        assert_eq!(config.parallel, 1);
        assert_eq!(config.protocol, "tcp");

        let config: PerformanceTestConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.test_type, TestType::Comprehensive);
        assert_eq!(config.duration, Duration::from_secs(10));
    }

    #[test]
    fn test_comprehensive_wants_both() {
        assert!(TestType::Comprehensive.wants_throughput());
        assert!(TestType::Comprehensive.wants_latency());
        assert!(!TestType::Latency.wants_throughput());
        assert!(!TestType::Throughput.wants_latency());
    }

    #[test]
    fn test_slice_metrics_json_is_lossless() {
        let mut perf = PerformanceMetrics::new(
            "edge01",
            "test_1",
            TestType::Comprehensive,
            Duration::from_secs(30),
        );
        perf.throughput.avg_mbps = 4.2;
        perf.throughput.peak_mbps = 4.6;
        perf.latency.avg_rtt_ms = 17.0;
        perf.latency.p95_ms = 18.25;
        perf.packet_loss = 0.01;
        perf.vxlan_overhead = 100.0 / 3.0;
        perf.network_path = vec!["edge01".to_string(), "edge02".to_string()];
        perf.error_details = vec!["upload test failed".to_string()];

        let mut cluster_metrics = BTreeMap::new();
        cluster_metrics.insert("edge01".to_string(), perf.clone());

        let metrics = NetworkSliceMetrics {
            slice_id: "slice-embb".to_string(),
            slice_type: "eMBB".to_string(),
            timestamp: Utc::now(),
            sla_compliance: true,
            performance: perf,
            thesis_validation: ThesisValidation {
                throughput_targets: vec![0.93, 2.77, 4.57],
                rtt_targets: vec![6.3, 15.7, 16.1],
                throughput_results: vec![4.2, 4.2, 4.2],
                rtt_results: vec![17.0, 17.0, 17.0],
                passed_tests: 5,
                total_tests: 7,
                compliance_percent: 5.0 / 7.0 * 100.0,
                deploy_time_ms: 1234,
                deploy_target_ms: 600_000,
            },
            cluster_metrics,
        };

        let json = serde_json::to_string_pretty(&metrics).unwrap();
        let parsed: NetworkSliceMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, metrics);
    }
}
