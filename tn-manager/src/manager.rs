//! Multi-cluster coordination of TN agents.
//!
//! The [`TnManager`] keeps a registry of agents keyed by cluster name and
//! fans requests out to them concurrently. Per-agent failures are collected
//! and reported individually; one slow or broken agent never hides the
//! results of the others.
//!
//! # Key Features
//!
//! - **Registry**: agents are health-checked before they are inserted; the
//!   registry is shared with in-flight placements behind a lock
//! - **Slice fan-out**: the same [`TnConfig`] is pushed to every agent and
//!   failures are aggregated into [`ManagerError::PartialFailure`]
//! - **Performance fan-out**: per-cluster results are aggregated into a
//!   [`NetworkSliceMetrics`] scored by the [`ComplianceValidator`]
//! - **Background collection**: agent status is sampled on an interval into
//!   the [`MetricsCollector`]

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tn_shared::errors::{ManagerError, ManagerResult};
use tn_shared::retry::RetryPolicy;
use tn_shared::{
    NetworkSliceMetrics, PerformanceMetrics, PerformanceTestConfig, SliceType, TestType, TnConfig,
    TnError, TnResult, TnStatus, Validate,
};

use crate::client::{AgentClient, DEFAULT_REQUEST_TIMEOUT, endpoint_host};
use crate::collector::{DEFAULT_MAX_SAMPLES, MetricsCollector};
use crate::compliance::{
    ComplianceReport, ComplianceValidator, DEFAULT_COMPLIANCE_THRESHOLD, DEFAULT_TOLERANCE,
};

pub const DEFAULT_COLLECTION_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CLUSTER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 8;
pub const DEFAULT_VALIDATION_TEST_DURATION: Duration = Duration::from_secs(30);

/// Runtime knobs of the manager
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub compliance_threshold: f64,
    pub tolerance: f64,
    pub request_timeout: Duration,
    /// Upper bound for configuring one cluster during a placement
    pub cluster_timeout: Duration,
    /// Clusters configured at the same time during a placement
    pub dispatch_concurrency: usize,
    pub collection_interval: Duration,
    pub max_samples: usize,
    /// Length of the comprehensive test run after a placement; `None` skips it
    pub validation_test: Option<Duration>,
    pub read_retry: RetryPolicy,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            compliance_threshold: DEFAULT_COMPLIANCE_THRESHOLD,
            tolerance: DEFAULT_TOLERANCE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cluster_timeout: DEFAULT_CLUSTER_TIMEOUT,
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            collection_interval: DEFAULT_COLLECTION_INTERVAL,
            max_samples: DEFAULT_MAX_SAMPLES,
            validation_test: Some(DEFAULT_VALIDATION_TEST_DURATION),
            read_retry: RetryPolicy::default(),
        }
    }
}

/// Public view of a registered agent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub name: String,
    pub endpoint: String,
    /// Overlay address used as local/remote IP in generated configurations
    #[serde(rename = "clusterIP")]
    pub cluster_ip: String,
    pub version: String,
    pub registered_at: DateTime<Utc>,
}

pub(crate) struct RegisteredAgent {
    pub(crate) info: AgentInfo,
    pub(crate) client: AgentClient,
}

/// Status of every registered agent; unreachable ones are listed with the error
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusReport {
    pub statuses: BTreeMap<String, TnStatus>,
    pub errors: BTreeMap<String, String>,
}

pub struct TnManager {
    options: ManagerOptions,
    validator: ComplianceValidator,
    collector: MetricsCollector,
    agents: RwLock<BTreeMap<String, Arc<RegisteredAgent>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TnManager {
    fn default() -> Self {
        Self::new(ManagerOptions::default())
    }
}

impl TnManager {
    pub fn new(options: ManagerOptions) -> Self {
        Self {
            validator: ComplianceValidator::new(options.tolerance, options.compliance_threshold),
            collector: MetricsCollector::new(options.max_samples),
            options,
            agents: RwLock::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn validator(&self) -> &ComplianceValidator {
        &self.validator
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    // ── Registry ────────────────────────────────────────────────────────

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<RegisteredAgent>>> {
        match self.agents.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<RegisteredAgent>>> {
        match self.agents.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `name` at `endpoint`, using the endpoint host as the
    /// cluster's overlay address.
    pub async fn register_agent(&self, name: &str, endpoint: &str) -> ManagerResult<AgentInfo> {
        self.register_agent_with_ip(name, endpoint, None).await
    }

    /// Register an agent after a successful `GET /health`. Registering an
    /// existing name replaces the previous entry.
    #[instrument(skip(self), fields(cluster = %name))]
    pub async fn register_agent_with_ip(
        &self,
        name: &str,
        endpoint: &str,
        cluster_ip: Option<&str>,
    ) -> ManagerResult<AgentInfo> {
        validate_cluster_name(name)?;
        let client = AgentClient::new(name, endpoint, self.options.request_timeout)?
            .with_read_retry(self.options.read_retry);

        let cluster_ip = match cluster_ip {
            Some(ip) => tn_shared::parse_ip("clusterIP", ip)
                .map_err(TnError::from)?
                .to_string(),
            None => endpoint_host(client.endpoint()).ok_or_else(|| {
                TnError::validation("endpoint", format!("'{}' has no host", endpoint))
            })?,
        };

        let health = client.health().await?;
        if !health.cluster.is_empty() && health.cluster != name {
            warn!(
                "[MANAGER] Agent at {} reports cluster '{}', registering it as '{}'",
                endpoint, health.cluster, name
            );
        }

        let info = AgentInfo {
            name: name.to_string(),
            endpoint: client.endpoint().to_string(),
            cluster_ip,
            version: health.version,
            registered_at: Utc::now(),
        };
        let previous = self.registry_mut().insert(
            name.to_string(),
            Arc::new(RegisteredAgent {
                info: info.clone(),
                client,
            }),
        );
        if previous.is_some() {
            info!("[MANAGER] Re-registered agent {} at {}", name, info.endpoint);
        } else {
            info!("[MANAGER] Registered agent {} at {} ({})", name, info.endpoint, info.cluster_ip);
        }
        Ok(info)
    }

    pub fn unregister_agent(&self, name: &str) -> ManagerResult<AgentInfo> {
        let removed = self
            .registry_mut()
            .remove(name)
            .ok_or_else(|| ManagerError::AgentNotRegistered {
                cluster: name.to_string(),
            })?;
        info!("[MANAGER] Unregistered agent {}", name);
        Ok(removed.info.clone())
    }

    pub fn list_agents(&self) -> Vec<AgentInfo> {
        self.registry().values().map(|a| a.info.clone()).collect()
    }

    pub fn agent_count(&self) -> usize {
        self.registry().len()
    }

    /// Consistent copy of the registry; callers never hold the lock across I/O.
    pub(crate) fn snapshot(&self) -> BTreeMap<String, Arc<RegisteredAgent>> {
        self.registry().clone()
    }

    fn agents_or_err(&self) -> ManagerResult<Vec<Arc<RegisteredAgent>>> {
        let agents: Vec<_> = self.registry().values().cloned().collect();
        if agents.is_empty() {
            return Err(ManagerError::NoAgents);
        }
        Ok(agents)
    }

    // ── Slice configuration ─────────────────────────────────────────────

    /// Push `config` to every registered agent concurrently.
    #[instrument(skip(self, config), fields(slice_id = %slice_id))]
    pub async fn configure_network_slice(&self, slice_id: &str, config: &TnConfig) -> ManagerResult<()> {
        if slice_id.is_empty() {
            return Err(TnError::validation("sliceId", "cannot be empty").into());
        }
        config.validate().map_err(TnError::from)?;
        let agents = self.agents_or_err()?;

        let results = join_all(agents.iter().map(|agent| async move {
            (
                agent.info.name.clone(),
                agent.client.configure_slice(slice_id, config).await,
            )
        }))
        .await;

        let total = results.len();
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(name, result)| {
                result.err().map(|e| {
                    warn!("[MANAGER] Configuring slice {} on {} failed: {}", slice_id, name, e);
                    format!("{}: {}", name, e)
                })
            })
            .collect();

        if failures.is_empty() {
            info!("[MANAGER] Slice {} configured on {} agents", slice_id, total);
            Ok(())
        } else {
            Err(ManagerError::PartialFailure {
                failed: failures.len(),
                total,
                details: failures.join("; "),
            })
        }
    }

    /// Remove a slice from every agent. Agents that never had it count as done.
    #[instrument(skip(self), fields(slice_id = %slice_id))]
    pub async fn delete_network_slice(&self, slice_id: &str) -> ManagerResult<()> {
        let agents = self.agents_or_err()?;
        let results = join_all(agents.iter().map(|agent| async move {
            (agent.info.name.clone(), agent.client.delete_slice(slice_id).await)
        }))
        .await;

        let total = results.len();
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(name, result)| match result {
                Ok(()) | Err(ManagerError::AgentResponse { status: 404, .. }) => None,
                Err(e) => Some(format!("{}: {}", name, e)),
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ManagerError::PartialFailure {
                failed: failures.len(),
                total,
                details: failures.join("; "),
            })
        }
    }

    // ── Performance tests ───────────────────────────────────────────────

    /// Run `config` on every registered agent and score the aggregate.
    /// Cancelling `cancel` abandons the outstanding agent requests and
    /// returns [`TnError::Cancelled`]; nothing is recorded.
    pub async fn run_performance_test(
        &self,
        config: &PerformanceTestConfig,
        cancel: &CancellationToken,
    ) -> ManagerResult<NetworkSliceMetrics> {
        let agents = self.agents_or_err()?;
        self.run_test_on(&agents, config, cancel).await
    }

    #[instrument(skip(self, agents, config, cancel), fields(test_id = %config.test_id, slice_id = %config.slice_id))]
    pub(crate) async fn run_test_on(
        &self,
        agents: &[Arc<RegisteredAgent>],
        config: &PerformanceTestConfig,
        cancel: &CancellationToken,
    ) -> ManagerResult<NetworkSliceMetrics> {
        let mut config = config.clone();
        if config.test_id.is_empty() {
            config.test_id = format!("test_{}", Utc::now().timestamp_millis());
        }
        let config = &config;
        let started = Instant::now();

        let fan_out = join_all(agents.iter().map(|agent| async move {
            (
                agent.info.name.clone(),
                agent.client.run_performance_test(config).await,
            )
        }));
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("[MANAGER] Performance test {} cancelled", config.test_id);
                return Err(TnError::Cancelled {
                    message: format!("performance test {} cancelled", config.test_id),
                }
                .into());
            }
            results = fan_out => results,
        };

        let total = results.len();
        let mut cluster_metrics = BTreeMap::new();
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(mut metrics) => {
                    metrics.cluster_name = name.clone();
                    cluster_metrics.insert(name, metrics);
                }
                Err(e) => {
                    warn!("[MANAGER] Performance test {} on {} failed: {}", config.test_id, name, e);
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }
        if cluster_metrics.is_empty() {
            return Err(ManagerError::PartialFailure {
                failed: failures.len(),
                total,
                details: failures.join("; "),
            });
        }

        let slice_type = config.slice_type.parse::<SliceType>().ok();
        let mut aggregate = aggregate_metrics(config, slice_type, &cluster_metrics);
        aggregate.error_details.extend(failures);
        if config.test_type == TestType::Comprehensive
            && (aggregate.throughput.avg_mbps <= 0.0 || aggregate.latency.avg_rtt_ms <= 0.0)
        {
            aggregate
                .error_details
                .push("comprehensive test is missing throughput or latency results".to_string());
        }

        let deploy_time_ms = started.elapsed().as_millis() as i64;
        let thesis_validation =
            self.validator
                .thesis_validation(slice_type, &aggregate, &cluster_metrics, deploy_time_ms);
        let sla_compliance = self.validator.is_compliant(thesis_validation.compliance_percent);

        let result = NetworkSliceMetrics {
            slice_id: config.slice_id.clone(),
            slice_type: config.slice_type.clone(),
            timestamp: Utc::now(),
            sla_compliance,
            performance: aggregate,
            thesis_validation,
            cluster_metrics,
        };
        self.collector.record_slice_result(result.clone());
        info!(
            "[MANAGER] Test {} on {}/{} clusters: {:.2} Mbps, {:.2} ms, compliance {:.1}% (SLA {})",
            config.test_id,
            result.cluster_metrics.len(),
            total,
            result.performance.throughput.avg_mbps,
            result.performance.latency.avg_rtt_ms,
            result.thesis_validation.compliance_percent,
            if result.sla_compliance { "met" } else { "missed" }
        );
        Ok(result)
    }

    /// Run `iterations` comprehensive tests per slice type and score each
    /// type against its reference target. Cancellation stops the suite.
    #[instrument(skip(self, cancel))]
    pub async fn validate_slices(
        &self,
        slice_types: &[SliceType],
        iterations: usize,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> ManagerResult<ComplianceReport> {
        self.agents_or_err()?;
        let mut slices = Vec::with_capacity(slice_types.len());
        for slice_type in slice_types {
            let mut runs = Vec::with_capacity(iterations);
            for iteration in 0..iterations {
                let config = PerformanceTestConfig {
                    test_id: format!(
                        "validation_{}_{}_{}",
                        slice_type.as_str().to_lowercase(),
                        iteration,
                        Utc::now().timestamp_millis()
                    ),
                    slice_id: format!("{}-validation", slice_type.as_str().to_lowercase()),
                    slice_type: slice_type.as_str().to_string(),
                    duration,
                    test_type: TestType::Comprehensive,
                    ..PerformanceTestConfig::default()
                };
                match self.run_performance_test(&config, cancel).await {
                    Ok(result) => runs.push(result),
                    Err(ManagerError::Common(TnError::Cancelled { message })) => {
                        return Err(TnError::Cancelled { message }.into());
                    }
                    Err(e) => warn!(
                        "[MANAGER] Validation run {} for {} failed: {}",
                        iteration, slice_type, e
                    ),
                }
            }
            slices.push(self.validator.evaluate_runs(*slice_type, &runs));
        }

        let report = self.validator.report(slices);
        info!(
            "[MANAGER] Validation finished: {:.1}% overall, {} issues",
            report.overall_compliance,
            report.issues.len()
        );
        Ok(report)
    }

    // ── Status and metrics ──────────────────────────────────────────────

    /// Query every agent and record the answers in the collector.
    pub async fn get_status(&self) -> ClusterStatusReport {
        let agents: Vec<_> = self.registry().values().cloned().collect();
        let results = join_all(
            agents
                .iter()
                .map(|agent| async move { (agent.info.name.clone(), agent.client.status().await) }),
        )
        .await;

        let mut report = ClusterStatusReport::default();
        for (name, result) in results {
            match result {
                Ok(status) => {
                    self.collector.record_status(&name, status.clone());
                    report.statuses.insert(name, status);
                }
                Err(e) => {
                    debug!("[MANAGER] Status of {} unavailable: {}", name, e);
                    report.errors.insert(name, e.to_string());
                }
            }
        }
        report
    }

    pub fn export_metrics(&self, dir: &Path) -> TnResult<PathBuf> {
        self.collector.export_to_dir(dir)
    }

    // ── Background work ─────────────────────────────────────────────────

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Start periodic status collection.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        let every = self.options.collection_interval;
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = manager.get_status().await;
                        debug!(
                            "[MANAGER] Collected status: {} ok, {} unreachable",
                            report.statuses.len(),
                            report.errors.len()
                        );
                    }
                }
            }
            debug!("[MANAGER] Status collection stopped");
        }));
        info!("[MANAGER] Status collection every {:?}", every);
    }

    /// Write a metrics report to `dir` every `every` until stopped.
    pub fn start_continuous_export(self: &Arc<Self>, dir: PathBuf, every: Duration) {
        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.export_metrics(&dir) {
                            warn!("[MANAGER] Periodic metrics export failed: {}", e);
                        }
                    }
                }
            }
        }));
        info!("[MANAGER] Continuous export every {:?}", every);
    }

    /// Stop background work and wait for it to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("[MANAGER] Background task ended abnormally: {}", e);
            }
        }
    }
}

fn validate_cluster_name(name: &str) -> TnResult<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(TnError::validation("name", "must be 1-63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(TnError::validation(
            "name",
            format!("'{}' may only contain letters, digits, '-', '_' and '.'", name),
        ));
    }
    Ok(())
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// Mean over clusters that measured the value at all.
fn mean_measured(clusters: &[&PerformanceMetrics], f: impl Fn(&PerformanceMetrics) -> f64) -> f64 {
    mean(clusters.iter().map(|m| f(m)).filter(|v| *v > 0.0))
}

fn positive_min(values: impl Iterator<Item = f64>) -> f64 {
    let min = values.filter(|v| *v > 0.0).fold(f64::INFINITY, f64::min);
    if min.is_finite() { min } else { 0.0 }
}

/// Combine per-cluster results: means for averages, loss and jitter,
/// extremes for peak, minimum and maximum.
pub fn aggregate_metrics(
    config: &PerformanceTestConfig,
    slice_type: Option<SliceType>,
    cluster_metrics: &BTreeMap<String, PerformanceMetrics>,
) -> PerformanceMetrics {
    let mut aggregate =
        PerformanceMetrics::new("aggregate", &config.test_id, config.test_type, config.duration);
    aggregate.test_type = "aggregated".to_string();
    let clusters: Vec<&PerformanceMetrics> = cluster_metrics.values().collect();
    if clusters.is_empty() {
        return aggregate;
    }

    let throughput = &mut aggregate.throughput;
    throughput.avg_mbps = mean_measured(&clusters, |m| m.throughput.avg_mbps);
    throughput.downlink_mbps = mean_measured(&clusters, |m| m.throughput.downlink_mbps);
    throughput.uplink_mbps = mean_measured(&clusters, |m| m.throughput.uplink_mbps);
    throughput.bi_dir_mbps = mean_measured(&clusters, |m| m.throughput.bi_dir_mbps);
    throughput.peak_mbps = clusters.iter().map(|m| m.throughput.peak_mbps).fold(0.0, f64::max);
    throughput.min_mbps = positive_min(clusters.iter().map(|m| m.throughput.min_mbps));
    throughput.std_dev_mbps = mean(clusters.iter().map(|m| m.throughput.std_dev_mbps));
    throughput.target_mbps = slice_type
        .map(|s| s.target().throughput_mbps)
        .unwrap_or_else(|| clusters[0].throughput.target_mbps);
    throughput.achieved_ratio = if throughput.target_mbps > 0.0 {
        throughput.avg_mbps / throughput.target_mbps
    } else {
        0.0
    };

    let latency = &mut aggregate.latency;
    latency.avg_rtt_ms = mean_measured(&clusters, |m| m.latency.avg_rtt_ms);
    latency.rtt_ms = latency.avg_rtt_ms;
    latency.max_rtt_ms = clusters.iter().map(|m| m.latency.max_rtt_ms).fold(0.0, f64::max);
    latency.min_rtt_ms = positive_min(clusters.iter().map(|m| m.latency.min_rtt_ms));
    latency.std_dev_ms = mean(clusters.iter().map(|m| m.latency.std_dev_ms));
    latency.p50_ms = mean_measured(&clusters, |m| m.latency.p50_ms);
    latency.p95_ms = clusters.iter().map(|m| m.latency.p95_ms).fold(0.0, f64::max);
    latency.p99_ms = clusters.iter().map(|m| m.latency.p99_ms).fold(0.0, f64::max);
    latency.target_ms = slice_type
        .map(|s| s.target().rtt_ms)
        .unwrap_or_else(|| clusters[0].latency.target_ms);

    aggregate.packet_loss = mean(clusters.iter().map(|m| m.packet_loss));
    aggregate.jitter = mean(clusters.iter().map(|m| m.jitter));
    aggregate.bandwidth_utilization = mean(clusters.iter().map(|m| m.bandwidth_utilization));
    aggregate.vxlan_overhead = mean(clusters.iter().map(|m| m.vxlan_overhead));
    aggregate.tc_overhead = mean(clusters.iter().map(|m| m.tc_overhead));
    aggregate.qos_class = clusters[0].qos_class.clone();
    aggregate.network_path = cluster_metrics.keys().cloned().collect();
    aggregate.error_details = cluster_metrics
        .iter()
        .flat_map(|(name, m)| m.error_details.iter().map(move |e| format!("{}: {}", name, e)))
        .collect();
    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str, avg: f64, peak: f64, rtt: f64, max_rtt: f64, loss: f64) -> PerformanceMetrics {
        let mut m = PerformanceMetrics::new(name, "t1", TestType::Comprehensive, Duration::from_secs(10));
        m.throughput.avg_mbps = avg;
        m.throughput.peak_mbps = peak;
        m.throughput.min_mbps = avg * 0.9;
        m.latency.avg_rtt_ms = rtt;
        m.latency.min_rtt_ms = rtt * 0.8;
        m.latency.max_rtt_ms = max_rtt;
        m.packet_loss = loss;
        m.jitter = 1.0;
        m
    }

    fn config() -> PerformanceTestConfig {
        PerformanceTestConfig {
            test_id: "t1".to_string(),
            slice_id: "embb-1".to_string(),
            slice_type: "eMBB".to_string(),
            ..PerformanceTestConfig::default()
        }
    }

    #[test]
    fn test_aggregate_means_and_extremes() {
        let clusters = BTreeMap::from([
            ("edge01".to_string(), cluster("edge01", 4.0, 4.8, 15.0, 20.0, 0.1)),
            ("edge02".to_string(), cluster("edge02", 5.0, 5.5, 17.0, 25.0, 0.3)),
        ]);
        let aggregate = aggregate_metrics(&config(), Some(SliceType::Embb), &clusters);

        assert_eq!(aggregate.test_type, "aggregated");
        assert!((aggregate.throughput.avg_mbps - 4.5).abs() < 1e-9);
        assert!((aggregate.throughput.peak_mbps - 5.5).abs() < 1e-9);
        assert!((aggregate.throughput.min_mbps - 3.6).abs() < 1e-9);
        assert!((aggregate.latency.avg_rtt_ms - 16.0).abs() < 1e-9);
        assert!((aggregate.latency.max_rtt_ms - 25.0).abs() < 1e-9);
        assert!((aggregate.latency.min_rtt_ms - 12.0).abs() < 1e-9);
        assert!((aggregate.packet_loss - 0.2).abs() < 1e-9);
        assert_eq!(aggregate.throughput.target_mbps, 4.57);
        assert_eq!(aggregate.latency.target_ms, 16.1);
        assert_eq!(aggregate.network_path, vec!["edge01".to_string(), "edge02".to_string()]);
    }

    #[test]
    fn test_aggregate_ignores_unmeasured_clusters() {
        let mut latency_only = cluster("edge02", 0.0, 0.0, 17.0, 18.0, 0.0);
        latency_only.error_details.push("no target IP specified".to_string());
        let clusters = BTreeMap::from([
            ("edge01".to_string(), cluster("edge01", 4.2, 4.4, 0.0, 0.0, 0.0)),
            ("edge02".to_string(), latency_only),
        ]);
        let aggregate = aggregate_metrics(&config(), None, &clusters);
        assert!((aggregate.throughput.avg_mbps - 4.2).abs() < 1e-9);
        assert!((aggregate.latency.avg_rtt_ms - 17.0).abs() < 1e-9);
        assert_eq!(aggregate.error_details, vec!["edge02: no target IP specified".to_string()]);
    }

    #[test]
    fn test_cluster_name_validation() {
        assert!(validate_cluster_name("edge-01.site_a").is_ok());
        assert!(validate_cluster_name("").is_err());
        assert!(validate_cluster_name("edge 01").is_err());
        assert!(validate_cluster_name("edge01;rm").is_err());
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let manager = TnManager::default();
        assert!(manager.list_agents().is_empty());
        assert!(matches!(
            manager.run_performance_test(&config(), &CancellationToken::new()).await,
            Err(ManagerError::NoAgents)
        ));
        assert!(matches!(
            manager.unregister_agent("edge01"),
            Err(ManagerError::AgentNotRegistered { .. })
        ));
        let report = manager.get_status().await;
        assert!(report.statuses.is_empty() && report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_stop_ends_background_collection() {
        let manager = Arc::new(TnManager::new(ManagerOptions {
            collection_interval: Duration::from_millis(10),
            ..ManagerOptions::default()
        }));
        manager.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        tokio::time::timeout(Duration::from_secs(5), manager.stop())
            .await
            .unwrap();
    }
}
