//! Metrics collection across agents.
//!
//! Keeps bounded histories of per-agent performance results, agent status
//! snapshots and slice-level test results, summarizes them and exports the
//! lot as pretty-printed JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

use tn_shared::{NetworkSliceMetrics, PerformanceMetrics, TnResult, TnStatus};

pub const DEFAULT_MAX_SAMPLES: usize = 1000;

/// Aggregate view of everything collected so far
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub success_rate: f64,
    pub avg_throughput_mbps: f64,
    pub avg_latency_ms: f64,
    pub avg_deploy_time_ms: f64,
    pub total_clusters: usize,
    pub active_clusters: usize,
    pub total_slices: usize,
    pub sla_compliant_slices: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_slice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worst_slice: Option<String>,
}

/// Per-cluster figures derived from its stored results
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub samples: usize,
    pub failed_samples: usize,
    pub avg_throughput_mbps: f64,
    pub peak_throughput_mbps: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub avg_bandwidth_utilization: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<TnStatus>,
}

/// Document written by [`MetricsCollector::export_to_dir`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub generated_at: DateTime<Utc>,
    pub summary: MetricsSummary,
    pub clusters: BTreeMap<String, ClusterSummary>,
    pub slice_results: Vec<NetworkSliceMetrics>,
}

#[derive(Default)]
struct CollectorState {
    agent_metrics: BTreeMap<String, VecDeque<PerformanceMetrics>>,
    status_history: BTreeMap<String, VecDeque<TnStatus>>,
    slice_results: VecDeque<NetworkSliceMetrics>,
}

#[derive(Clone)]
pub struct MetricsCollector {
    max_samples: usize,
    state: Arc<Mutex<CollectorState>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SAMPLES)
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, limit: usize) {
    queue.push_back(item);
    while queue.len() > limit {
        queue.pop_front();
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

impl MetricsCollector {
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples: max_samples.max(1),
            state: Arc::new(Mutex::new(CollectorState::default())),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CollectorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_metrics(&self, cluster: &str, metrics: PerformanceMetrics) {
        let mut state = self.state();
        let queue = state.agent_metrics.entry(cluster.to_string()).or_default();
        push_bounded(queue, metrics, self.max_samples);
    }

    pub fn record_status(&self, cluster: &str, status: TnStatus) {
        let mut state = self.state();
        let queue = state.status_history.entry(cluster.to_string()).or_default();
        push_bounded(queue, status, self.max_samples);
    }

    /// Store a slice result together with each of its per-cluster results.
    pub fn record_slice_result(&self, result: NetworkSliceMetrics) {
        let mut state = self.state();
        for (cluster, metrics) in &result.cluster_metrics {
            let queue = state.agent_metrics.entry(cluster.clone()).or_default();
            push_bounded(queue, metrics.clone(), self.max_samples);
        }
        push_bounded(&mut state.slice_results, result, self.max_samples);
    }

    pub fn slice_results(&self) -> Vec<NetworkSliceMetrics> {
        self.state().slice_results.iter().cloned().collect()
    }

    pub fn latest_status(&self, cluster: &str) -> Option<TnStatus> {
        self.state()
            .status_history
            .get(cluster)
            .and_then(|history| history.back().cloned())
    }

    pub fn status_history_len(&self, cluster: &str) -> usize {
        self.state().status_history.get(cluster).map_or(0, VecDeque::len)
    }

    pub fn summary(&self) -> MetricsSummary {
        let state = self.state();
        let results = &state.slice_results;

        let passed = results
            .iter()
            .filter(|r| r.performance.error_details.is_empty())
            .count();
        let total = results.len();

        let mut clusters: Vec<&String> = state
            .agent_metrics
            .keys()
            .chain(state.status_history.keys())
            .collect();
        clusters.sort();
        clusters.dedup();
        let active = state
            .status_history
            .values()
            .filter(|history| history.back().is_some_and(|s| s.healthy))
            .count();

        let by_compliance = |a: &&NetworkSliceMetrics, b: &&NetworkSliceMetrics| {
            a.thesis_validation
                .compliance_percent
                .total_cmp(&b.thesis_validation.compliance_percent)
        };

        MetricsSummary {
            total_tests: total,
            passed_tests: passed,
            failed_tests: total - passed,
            success_rate: if total == 0 {
                0.0
            } else {
                passed as f64 / total as f64 * 100.0
            },
            avg_throughput_mbps: mean(
                results
                    .iter()
                    .map(|r| r.performance.throughput.avg_mbps)
                    .filter(|v| *v > 0.0),
            ),
            avg_latency_ms: mean(
                results
                    .iter()
                    .map(|r| r.performance.latency.avg_rtt_ms)
                    .filter(|v| *v > 0.0),
            ),
            avg_deploy_time_ms: mean(
                results
                    .iter()
                    .map(|r| r.thesis_validation.deploy_time_ms as f64),
            ),
            total_clusters: clusters.len(),
            active_clusters: active,
            total_slices: results
                .iter()
                .map(|r| r.slice_id.as_str())
                .collect::<std::collections::BTreeSet<_>>()
                .len(),
            sla_compliant_slices: results.iter().filter(|r| r.sla_compliance).count(),
            best_slice: results.iter().max_by(by_compliance).map(|r| r.slice_id.clone()),
            worst_slice: results.iter().min_by(by_compliance).map(|r| r.slice_id.clone()),
        }
    }

    pub fn cluster_summary(&self, cluster: &str) -> ClusterSummary {
        let state = self.state();
        let mut summary = ClusterSummary {
            last_status: state
                .status_history
                .get(cluster)
                .and_then(|history| history.back().cloned()),
            ..ClusterSummary::default()
        };
        let Some(history) = state.agent_metrics.get(cluster) else {
            return summary;
        };

        summary.samples = history.len();
        summary.failed_samples = history.iter().filter(|m| !m.error_details.is_empty()).count();
        summary.avg_throughput_mbps = mean(
            history
                .iter()
                .map(|m| m.throughput.avg_mbps)
                .filter(|v| *v > 0.0),
        );
        summary.peak_throughput_mbps = history
            .iter()
            .map(|m| m.throughput.peak_mbps)
            .fold(0.0, f64::max);
        summary.avg_latency_ms = mean(
            history
                .iter()
                .map(|m| m.latency.avg_rtt_ms)
                .filter(|v| *v > 0.0),
        );
        summary.max_latency_ms = history
            .iter()
            .map(|m| m.latency.max_rtt_ms)
            .fold(0.0, f64::max);
        summary.avg_bandwidth_utilization = mean(history.iter().map(|m| m.bandwidth_utilization));
        summary
    }

    pub fn report(&self) -> MetricsReport {
        let clusters: Vec<String> = {
            let state = self.state();
            let mut names: Vec<String> = state
                .agent_metrics
                .keys()
                .chain(state.status_history.keys())
                .cloned()
                .collect();
            names.sort();
            names.dedup();
            names
        };
        MetricsReport {
            generated_at: Utc::now(),
            summary: self.summary(),
            clusters: clusters
                .into_iter()
                .map(|name| {
                    let summary = self.cluster_summary(&name);
                    (name, summary)
                })
                .collect(),
            slice_results: self.slice_results(),
        }
    }

    pub fn export_json(&self) -> TnResult<String> {
        Ok(serde_json::to_string_pretty(&self.report())?)
    }

    /// Write the report to `<dir>/tn_metrics_<unix millis>.json`, creating
    /// the directory when needed.
    pub fn export_to_dir(&self, dir: &Path) -> TnResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("tn_metrics_{}.json", Utc::now().timestamp_millis()));
        std::fs::write(&path, self.export_json()?)?;
        info!("Exported metrics to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tn_shared::{TestType, ThesisValidation};

    fn slice_result(slice_id: &str, cluster: &str, throughput: f64, compliance: f64, failed: bool) -> NetworkSliceMetrics {
        let mut performance =
            PerformanceMetrics::new(cluster, "t", TestType::Comprehensive, Duration::from_secs(1));
        performance.throughput.avg_mbps = throughput;
        performance.throughput.peak_mbps = throughput * 1.1;
        performance.latency.avg_rtt_ms = 10.0;
        if failed {
            performance.error_details.push("iperf3 failed".to_string());
        }
        NetworkSliceMetrics {
            slice_id: slice_id.to_string(),
            slice_type: "eMBB".to_string(),
            timestamp: Utc::now(),
            sla_compliance: compliance >= 80.0,
            cluster_metrics: BTreeMap::from([(cluster.to_string(), performance.clone())]),
            performance,
            thesis_validation: ThesisValidation {
                compliance_percent: compliance,
                deploy_time_ms: 2_000,
                ..ThesisValidation::default()
            },
        }
    }

    fn status(healthy: bool) -> TnStatus {
        TnStatus {
            healthy,
            last_update: Utc::now(),
            active_connections: 0,
            bandwidth_usage: BTreeMap::new(),
            vxlan_status: tn_shared::VxlanStatus {
                tunnel_up: healthy,
                remote_peers: Vec::new(),
                packet_stats: BTreeMap::new(),
                last_heartbeat: Utc::now(),
            },
            tc_status: tn_shared::TcStatus::default(),
            error_messages: Vec::new(),
        }
    }

    #[test]
    fn test_histories_are_bounded() {
        let collector = MetricsCollector::new(3);
        for i in 0..5 {
            collector.record_status("edge01", status(i % 2 == 0));
            collector.record_slice_result(slice_result(&format!("s{}", i), "edge01", 1.0, 100.0, false));
        }
        assert_eq!(collector.status_history_len("edge01"), 3);
        assert_eq!(collector.slice_results().len(), 3);
        assert_eq!(collector.slice_results()[0].slice_id, "s2");
        assert_eq!(collector.cluster_summary("edge01").samples, 3);
    }

    #[test]
    fn test_summary_counts_and_extremes() {
        let collector = MetricsCollector::default();
        collector.record_slice_result(slice_result("embb-1", "edge01", 4.5, 100.0, false));
        collector.record_slice_result(slice_result("embb-2", "edge02", 3.5, 66.0, false));
        collector.record_slice_result(slice_result("embb-3", "edge02", 0.0, 33.0, true));
        collector.record_status("edge01", status(true));
        collector.record_status("edge02", status(false));

        let summary = collector.summary();
        assert_eq!(summary.total_tests, 3);
        assert_eq!(summary.passed_tests, 2);
        assert_eq!(summary.failed_tests, 1);
        assert!((summary.success_rate - 200.0 / 3.0).abs() < 1e-9);
        // zero throughput is left out of the average
        assert!((summary.avg_throughput_mbps - 4.0).abs() < 1e-9);
        assert_eq!(summary.total_clusters, 2);
        assert_eq!(summary.active_clusters, 1);
        assert_eq!(summary.total_slices, 3);
        assert_eq!(summary.sla_compliant_slices, 1);
        assert_eq!(summary.best_slice.as_deref(), Some("embb-1"));
        assert_eq!(summary.worst_slice.as_deref(), Some("embb-3"));
        assert_eq!(summary.avg_deploy_time_ms, 2_000.0);
    }

    #[test]
    fn test_cluster_summary() {
        let collector = MetricsCollector::default();
        collector.record_slice_result(slice_result("a", "edge01", 4.0, 100.0, false));
        collector.record_slice_result(slice_result("b", "edge01", 2.0, 100.0, true));

        let summary = collector.cluster_summary("edge01");
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.failed_samples, 1);
        assert!((summary.avg_throughput_mbps - 3.0).abs() < 1e-9);
        assert!((summary.peak_throughput_mbps - 4.4).abs() < 1e-9);
        assert!(summary.last_status.is_none());
        assert_eq!(collector.cluster_summary("nowhere"), ClusterSummary::default());
    }

    #[test]
    fn test_export_to_dir_writes_pretty_json() {
        let collector = MetricsCollector::default();
        collector.record_slice_result(slice_result("embb-1", "edge01", 4.5, 100.0, false));
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("reports");

        let path = collector.export_to_dir(&target).unwrap();
        assert!(path.starts_with(&target));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("tn_metrics_") && name.ends_with(".json"));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains('\n'));
        let report: MetricsReport = serde_json::from_str(&content).unwrap();
        assert_eq!(report.summary.total_tests, 1);
        assert!(report.clusters.contains_key("edge01"));
    }
}
