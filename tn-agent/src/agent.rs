//! TN agent: one cluster's tunnel, shaping and measurement services.
//!
//! [`TnAgent`] composes the [`TunnelManager`], [`TrafficControlManager`],
//! [`PerfTestManager`] and [`BandwidthMonitor`] behind the operations the
//! HTTP API exposes. All four share one [`CommandExecutor`], so tests can run
//! the whole agent against a scripted executor.
//!
//! # Lifecycle
//!
//! `start` brings subsystems up in dependency order (tunnel, shaping, iperf3
//! servers, bandwidth monitor, health loop). A failure part-way tears down
//! whatever was already created. `stop` releases everything in reverse.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bandwidth::{BandwidthMonitor, BandwidthSnapshot, PerformanceSummary};
use crate::commands::{CommandExecutor, SystemExecutor};
use crate::health::{HealthReport, ServiceHealth};
use crate::commands::builder::IperfDirection;
use crate::iperf::{
    IperfServer, IperfTestConfig, MAX_LATENCY_DURATION, MAX_THROUGHPUT_DURATION, PerfTestManager,
    validate_client_options,
};
use crate::op_metrics::{OpMetrics, OpRecorder};
use crate::tc::TrafficControlManager;
use crate::tc_calculator::tc_overhead_percent;
use crate::vxlan::{TunnelManager, TunnelStatus, vxlan_overhead_percent};
use tn_shared::{
    BandwidthPolicy, PerformanceMetrics, PerformanceTestConfig, SliceType, TcStatus, TestType,
    TnConfig, TnError, TnResult, TnStatus, Validate, ValidationError, VxlanStatus,
};

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_STORED_RESULTS: usize = 100;

/// Additional best-effort iperf3 servers started above the primary one.
const EXTRA_IPERF_SERVERS: u16 = 2;

/// Runtime knobs that are not part of the cluster configuration
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub health_interval: Duration,
    pub monitor_interval: Duration,
    pub command_timeout: Duration,
    /// Alternative `/proc/net/dev` source for the bandwidth monitor
    pub proc_net_dev: Option<PathBuf>,
    pub max_stored_results: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            health_interval: DEFAULT_HEALTH_INTERVAL,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            proc_net_dev: None,
            max_stored_results: DEFAULT_MAX_STORED_RESULTS,
        }
    }
}

/// A slice configured on this agent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceRecord {
    pub slice_id: String,
    pub status: String,
    pub configured_at: DateTime<Utc>,
    pub qos_class: String,
    pub interface: String,
    pub bandwidth_policy: BandwidthPolicy,
}

/// Operation counters and resource counts reported on `/metrics`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub cluster: String,
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    pub tunnel_operations: OpMetrics,
    pub traffic_control_operations: OpMetrics,
    pub active_tunnels: usize,
    pub iperf_servers: usize,
    pub configured_slices: usize,
    pub stored_test_results: usize,
    pub total_rx_mbps: f64,
    pub total_tx_mbps: f64,
    pub bandwidth: Option<PerformanceSummary>,
}

#[derive(Default)]
struct Runtime {
    started: bool,
    healthy: bool,
    vni: Option<u32>,
    shaping_interface: Option<String>,
    /// Configuration in effect before any slice was applied
    base_policy: BandwidthPolicy,
    slices: BTreeMap<String, SliceRecord>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

struct ResultStore {
    order: VecDeque<String>,
    by_id: HashMap<String, PerformanceMetrics>,
    limit: usize,
}

impl ResultStore {
    fn insert(&mut self, metrics: PerformanceMetrics) {
        let id = metrics.test_id.clone();
        if self.by_id.insert(id.clone(), metrics).is_some() {
            self.order.retain(|existing| existing != &id);
        }
        self.order.push_back(id);
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.by_id.remove(&oldest);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Validate a slice or test identifier used in URLs and logs.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || value.len() > 128 {
        return Err(ValidationError::new(field, "must be 1-128 characters"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ValidationError::new(
            field,
            format!("'{}' contains forbidden characters", value.escape_debug()),
        ));
    }
    Ok(())
}

/// Transport-network agent for one cluster
pub struct TnAgent {
    config: RwLock<TnConfig>,
    options: AgentOptions,
    tunnels: TunnelManager,
    tc: TrafficControlManager,
    perf: PerfTestManager,
    monitor: BandwidthMonitor,
    runtime: Mutex<Runtime>,
    results: Mutex<ResultStore>,
    reconfigure: tokio::sync::Mutex<()>,
}

impl TnAgent {
    /// Agent driving the host's networking tools.
    pub fn new(config: TnConfig, options: AgentOptions) -> Self {
        Self::with_executor(config, options, Arc::new(SystemExecutor::new()))
    }

    pub fn with_executor(
        config: TnConfig,
        options: AgentOptions,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let tunnels = TunnelManager::new(executor.clone(), OpRecorder::new(), options.command_timeout);
        let tc = TrafficControlManager::new(executor.clone(), OpRecorder::new(), options.command_timeout);
        let perf = PerfTestManager::new(executor.clone());
        let mut monitor = BandwidthMonitor::new(&config.cluster_name, executor);
        if let Some(path) = &options.proc_net_dev {
            monitor = monitor.with_proc_path(path.clone());
        }
        let base_policy = config.bandwidth_policy.clone();

        Self {
            config: RwLock::new(config),
            results: Mutex::new(ResultStore {
                order: VecDeque::new(),
                by_id: HashMap::new(),
                limit: options.max_stored_results.max(1),
            }),
            options,
            tunnels,
            tc,
            perf,
            monitor,
            runtime: Mutex::new(Runtime {
                base_policy,
                ..Default::default()
            }),
            reconfigure: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot of the active configuration
    pub fn config(&self) -> TnConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace_config(&self, update: impl FnOnce(&mut TnConfig)) {
        let mut guard = match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut guard);
    }

    pub fn cluster_name(&self) -> String {
        self.config().cluster_name
    }

    pub fn is_healthy(&self) -> bool {
        lock(&self.runtime).healthy
    }

    pub fn is_started(&self) -> bool {
        lock(&self.runtime).started
    }

    /// First iperf3 port: one above the API port.
    pub fn iperf_port(&self) -> u16 {
        self.config().monitoring_port.saturating_add(1)
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn traffic_control(&self) -> &TrafficControlManager {
        &self.tc
    }

    pub fn perf(&self) -> &PerfTestManager {
        &self.perf
    }

    pub fn monitor(&self) -> &BandwidthMonitor {
        &self.monitor
    }

    fn active_vni(&self) -> TnResult<u32> {
        lock(&self.runtime).vni.ok_or_else(|| TnError::NotInitialized {
            component: "VXLAN manager".to_string(),
        })
    }

    fn active_interface(&self) -> TnResult<String> {
        lock(&self.runtime)
            .shaping_interface
            .clone()
            .ok_or_else(|| TnError::NotInitialized {
                component: "TC manager".to_string(),
            })
    }

    fn ensure_started(&self, component: &str) -> TnResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(TnError::NotInitialized {
                component: component.to_string(),
            })
        }
    }

    /// Bring every subsystem up. Anything created before a failure is
    /// released again before the error is returned.
    #[instrument(skip(self), fields(cluster = %self.cluster_name()))]
    pub async fn start(self: &Arc<Self>) -> TnResult<()> {
        let config = self.config();
        config.validate()?;
        if self.is_started() {
            return Err(TnError::Busy {
                resource: format!("agent for cluster {}", config.cluster_name),
            });
        }
        info!("Starting TN agent for cluster {}", config.cluster_name);

        if let Err(e) = self.bring_up(&config).await {
            error!("Agent start failed, releasing resources: {}", e);
            self.teardown().await;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let monitor_task = self
            .monitor
            .start(self.options.monitor_interval, cancel.child_token());
        let health_task = self.spawn_health_loop(cancel.child_token());
        {
            let mut runtime = lock(&self.runtime);
            runtime.started = true;
            runtime.healthy = true;
            runtime.cancel = Some(cancel);
            runtime.tasks = vec![monitor_task, health_task];
        }
        info!("TN agent started (API port {})", config.monitoring_port);
        Ok(())
    }

    async fn bring_up(&self, config: &TnConfig) -> TnResult<()> {
        let tunnel = self.tunnels.create_from_config(&config.vxlan).await?;
        lock(&self.runtime).vni = Some(tunnel.vni);

        let interface = config.shaping_interface();
        self.tc.apply_rules(&interface, &config.bandwidth_policy).await?;
        lock(&self.runtime).shaping_interface = Some(interface.clone());
        self.monitor.set_shaped_interfaces(vec![interface]);

        let base = config.monitoring_port.saturating_add(1);
        self.perf.start_server(base).await?;
        for offset in 1..=EXTRA_IPERF_SERVERS {
            let port = base.saturating_add(offset);
            if let Err(e) = self.perf.start_server(port).await {
                warn!("Failed to start additional iperf3 server on port {}: {}", port, e);
            }
        }
        Ok(())
    }

    fn spawn_health_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        let period = self.options.health_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        agent.refresh_health().await;
                    }
                }
            }
            debug!("Health loop stopped");
        })
    }

    /// Release every resource the agent holds, in reverse start order.
    pub async fn stop(&self) {
        info!("Stopping TN agent");
        let _guard = self.reconfigure.lock().await;
        self.teardown().await;
        info!("TN agent stopped");
    }

    async fn teardown(&self) {
        let (cancel, tasks, interface, vni) = {
            let mut runtime = lock(&self.runtime);
            runtime.started = false;
            runtime.healthy = false;
            runtime.slices.clear();
            (
                runtime.cancel.take(),
                std::mem::take(&mut runtime.tasks),
                runtime.shaping_interface.take(),
                runtime.vni.take(),
            )
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Background task ended abnormally: {}", e);
            }
        }
        if let Err(e) = self.perf.stop_all_servers().await {
            warn!("Error stopping iperf3 servers: {}", e);
        }
        if let Some(interface) = interface {
            if let Err(e) = self.tc.clear_rules(&interface).await {
                warn!("Error clearing TC rules on {}: {}", interface, e);
            }
        }
        if let Some(vni) = vni {
            if let Err(e) = self.tunnels.delete_tunnel(vni).await {
                warn!("Error deleting VXLAN tunnel {}: {}", vni, e);
            }
        }
    }

    /// Probe every subsystem without changing the agent's health flag.
    pub async fn check_health(&self) -> HealthReport {
        let (vni, interface) = {
            let runtime = lock(&self.runtime);
            (runtime.vni, runtime.shaping_interface.clone())
        };

        let tunnel = match vni.and_then(|vni| self.tunnels.list_active_tunnels().remove(&vni)) {
            None => ServiceHealth::Unhealthy {
                reason: "tunnel not created".to_string(),
            },
            Some(status) => {
                if self.tunnels.is_up(&status.device_name).await {
                    ServiceHealth::Healthy
                } else {
                    ServiceHealth::Unhealthy {
                        reason: format!("device {} is down", status.device_name),
                    }
                }
            }
        };

        let traffic_control = match interface {
            None => ServiceHealth::Unhealthy {
                reason: "no shaping interface".to_string(),
            },
            Some(interface) => match self.tc.get_status(&interface).await {
                Ok(status) if !status.rules_active => ServiceHealth::Unhealthy {
                    reason: format!("no root qdisc on {}", interface),
                },
                Ok(status) if !status.shaping_active && self.config().bandwidth_policy.is_shaping() => {
                    ServiceHealth::Degraded {
                        reason: format!("rate class missing on {}", interface),
                    }
                }
                Ok(_) => ServiceHealth::Healthy,
                Err(e) => ServiceHealth::Unhealthy {
                    reason: e.to_string(),
                },
            },
        };

        let servers = self.perf.get_active_servers().await.len();
        let iperf = match servers {
            0 => ServiceHealth::Unhealthy {
                reason: "no iperf3 server running".to_string(),
            },
            n if n < 1 + EXTRA_IPERF_SERVERS as usize => ServiceHealth::Degraded {
                reason: format!("{} of {} iperf3 servers running", n, 1 + EXTRA_IPERF_SERVERS),
            },
            _ => ServiceHealth::Healthy,
        };

        HealthReport {
            tunnel,
            traffic_control,
            iperf,
        }
    }

    /// Run a health check and update the health flag from it.
    pub async fn refresh_health(&self) -> HealthReport {
        let report = self.check_health().await;
        let mut runtime = lock(&self.runtime);
        let healthy = runtime.started && report.is_healthy();
        if healthy != runtime.healthy {
            if healthy {
                info!("Agent is healthy again");
            } else {
                warn!("Agent became unhealthy: {:?}", report.reasons());
            }
        } else if !report.reasons().is_empty() {
            debug!("Health check notes: {:?}", report.reasons());
        }
        runtime.healthy = healthy;
        report
    }

    /// Apply a slice's peers and shaping policy. Peer updates are best
    /// effort; a shaping failure fails the whole call.
    #[instrument(skip(self, config), fields(slice_id = %slice_id))]
    pub async fn configure_slice(&self, slice_id: &str, config: TnConfig) -> TnResult<SliceRecord> {
        validate_identifier("sliceId", slice_id)?;
        config.validate()?;
        let _guard = self.reconfigure.lock().await;
        let vni = self.active_vni()?;
        let current = self.active_interface()?;
        info!("Configuring network slice {}", slice_id);

        if let Err(e) = self.tunnels.update_peers(vni, &config.vxlan.remote_ips).await {
            warn!("Failed to update VXLAN peers for slice {}: {}", slice_id, e);
        }

        let interface = config
            .interfaces
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| current.clone());
        self.tc.apply_rules(&interface, &config.bandwidth_policy).await?;
        if interface != current {
            if let Err(e) = self.tc.clear_rules(&current).await {
                warn!("Failed to clear previous shaping on {}: {}", current, e);
            }
            self.monitor.set_shaped_interfaces(vec![interface.clone()]);
        }

        let record = SliceRecord {
            slice_id: slice_id.to_string(),
            status: "configured".to_string(),
            configured_at: Utc::now(),
            qos_class: config.qos_class.clone(),
            interface: interface.clone(),
            bandwidth_policy: config.bandwidth_policy.clone(),
        };
        {
            let mut runtime = lock(&self.runtime);
            runtime.shaping_interface = Some(interface);
            runtime.slices.insert(slice_id.to_string(), record.clone());
        }
        self.replace_config(|active| {
            active.vxlan.remote_ips = config.vxlan.remote_ips;
            active.bandwidth_policy = config.bandwidth_policy;
            active.qos_class = config.qos_class;
            if !config.network_cidr.is_empty() {
                active.network_cidr = config.network_cidr;
            }
        });
        info!("Network slice {} configured", slice_id);
        Ok(record)
    }

    /// Forget a slice. Removing the last slice restores the policy the
    /// agent was started or last reconfigured with.
    #[instrument(skip(self))]
    pub async fn delete_slice(&self, slice_id: &str) -> TnResult<()> {
        validate_identifier("sliceId", slice_id)?;
        let _guard = self.reconfigure.lock().await;
        let (last, base, interface) = {
            let runtime = lock(&self.runtime);
            if !runtime.slices.contains_key(slice_id) {
                return Err(TnError::NotFound {
                    resource: format!("slice {}", slice_id),
                });
            }
            (
                runtime.slices.len() == 1,
                runtime.base_policy.clone(),
                runtime.shaping_interface.clone(),
            )
        };

        if let (true, Some(interface)) = (last, interface) {
            self.tc.apply_rules(&interface, &base).await?;
            self.replace_config(|active| active.bandwidth_policy = base);
        }
        lock(&self.runtime).slices.remove(slice_id);
        info!("Deleted network slice {}", slice_id);
        Ok(())
    }

    pub fn list_slices(&self) -> Vec<SliceRecord> {
        lock(&self.runtime).slices.values().cloned().collect()
    }

    /// Replace the active configuration. Nothing changes unless the new
    /// configuration validates; a shaping failure restores the previous peers.
    #[instrument(skip(self, new_config), fields(cluster = %new_config.cluster_name))]
    pub async fn update_config(&self, new_config: TnConfig) -> TnResult<()> {
        new_config.validate()?;
        let _guard = self.reconfigure.lock().await;
        let previous = self.config();

        if self.is_started() {
            let vni = self.active_vni()?;
            if new_config.vxlan.vni != vni {
                return Err(ValidationError::new(
                    "vxlan.vni",
                    format!("cannot change VNI {} while its tunnel is active", vni),
                )
                .into());
            }
            let current = self.active_interface()?;
            let interface = new_config.shaping_interface();

            self.tunnels.update_peers(vni, &new_config.vxlan.remote_ips).await?;
            if let Err(e) = self.tc.apply_rules(&interface, &new_config.bandwidth_policy).await {
                if let Err(restore) = self.tunnels.update_peers(vni, &previous.vxlan.remote_ips).await {
                    error!("Failed to restore previous peers: {}", restore);
                }
                return Err(e);
            }
            if interface != current {
                if let Err(e) = self.tc.clear_rules(&current).await {
                    warn!("Failed to clear previous shaping on {}: {}", current, e);
                }
                self.monitor.set_shaped_interfaces(vec![interface.clone()]);
            }
            lock(&self.runtime).shaping_interface = Some(interface);
        }

        lock(&self.runtime).base_policy = new_config.bandwidth_policy.clone();
        self.replace_config(|active| *active = new_config);
        info!("Configuration updated");
        Ok(())
    }

    /// Run throughput and/or latency measurements toward the test's target
    /// cluster (or the first tunnel peer). Individual measurement failures
    /// are reported in `error_details`; only invalid input fails the call.
    #[instrument(skip(self, test), fields(test_id = %test.test_id, test_type = test.test_type.as_str()))]
    pub async fn run_performance_test(&self, mut test: PerformanceTestConfig) -> TnResult<PerformanceMetrics> {
        if test.test_id.is_empty() {
            test.test_id = format!("test_{}", Utc::now().timestamp_millis());
        }
        validate_identifier("testId", &test.test_id)?;
        if test.duration.is_zero() {
            return Err(TnError::validation("duration", "must be positive"));
        }
        let max = if test.test_type.wants_throughput() {
            MAX_THROUGHPUT_DURATION
        } else {
            MAX_LATENCY_DURATION
        };
        let max = if test.test_type.wants_latency() {
            max.min(MAX_LATENCY_DURATION)
        } else {
            max
        };
        if test.duration > max {
            return Err(TnError::DurationTooLong {
                requested_secs: test.duration.as_secs(),
                max_secs: max.as_secs(),
            });
        }

        let config = self.config();
        let udp = test.protocol.eq_ignore_ascii_case("udp");
        let shaped_kbit = config.bandwidth_policy.downlink_kbit();
        let stream = IperfTestConfig {
            server: String::new(),
            port: config.monitoring_port.saturating_add(1),
            duration: test.duration,
            protocol: test.protocol.to_lowercase(),
            // UDP is sent at the shaped downlink rate
            bandwidth: (udp && shaped_kbit > 0).then(|| format!("{}K", shaped_kbit)),
            parallel: test.parallel,
            window_size: (!test.window_size.is_empty()).then(|| test.window_size.clone()),
            interval: test.interval,
            direction: IperfDirection::Download,
        };
        validate_client_options(&stream)?;

        info!("Running performance test {}", test.test_id);
        let started = Instant::now();
        let mut metrics =
            PerformanceMetrics::new(&config.cluster_name, &test.test_id, test.test_type, test.duration);
        metrics.qos_class = config.qos_class.clone();

        let slice_target = [test.slice_type.as_str(), config.qos_class.as_str()]
            .into_iter()
            .find_map(|s| s.parse::<SliceType>().ok())
            .map(|slice| slice.target());

        let target = if test.target_cluster.is_empty() {
            config.vxlan.remote_ips.first().cloned()
        } else {
            Some(test.target_cluster.clone())
        };

        match target {
            None => metrics.error_details.push("no target IP specified".to_string()),
            Some(target) => {
                let throughput = async {
                    if test.test_type.wants_throughput() {
                        let run = IperfTestConfig {
                            server: target.clone(),
                            ..stream.clone()
                        };
                        Some(self.perf.run_throughput_with(run).await)
                    } else {
                        None
                    }
                };
                let latency = async {
                    if test.test_type.wants_latency() {
                        Some(self.perf.run_ping(&target, test.duration).await)
                    } else {
                        None
                    }
                };
                let (throughput, latency) = if test.test_type == TestType::Concurrent {
                    tokio::join!(throughput, latency)
                } else {
                    (throughput.await, latency.await)
                };

                match throughput {
                    Some(Ok(mut measured)) => {
                        if let Some(target) = &slice_target {
                            measured.target_mbps = target.throughput_mbps;
                            if target.throughput_mbps > 0.0 {
                                measured.achieved_ratio = measured.avg_mbps / target.throughput_mbps;
                            }
                        }
                        metrics.throughput = measured;
                    }
                    Some(Err(e)) => metrics
                        .error_details
                        .push(format!("Throughput test failed: {}", e)),
                    None => {}
                }
                match latency {
                    Some(Ok(stats)) => {
                        metrics.latency = stats.latency;
                        if let Some(target) = &slice_target {
                            metrics.latency.target_ms = target.rtt_ms;
                        }
                        metrics.packet_loss = stats.packet_loss_percent;
                        metrics.jitter = stats.jitter_ms;
                    }
                    Some(Err(e)) => metrics.error_details.push(format!("Latency test failed: {}", e)),
                    None => {}
                }

                metrics.network_path = vec![
                    config.cluster_name.clone(),
                    config.vxlan.effective_device_name(),
                    target,
                ];
            }
        }

        metrics.vxlan_overhead = vxlan_overhead_percent(config.vxlan.effective_mtu());
        metrics.tc_overhead = tc_overhead_percent(&config.bandwidth_policy);
        metrics.bandwidth_utilization = self.bandwidth_utilization(&config);
        metrics.duration = started.elapsed();

        if metrics.error_details.is_empty() {
            info!(
                "Performance test {} completed: {:.2} Mbps, {:.2} ms",
                metrics.test_id, metrics.throughput.avg_mbps, metrics.latency.avg_rtt_ms
            );
        } else {
            warn!(
                "Performance test {} completed with errors: {:?}",
                metrics.test_id, metrics.error_details
            );
        }
        lock(&self.results).insert(metrics.clone());
        Ok(metrics)
    }

    fn bandwidth_utilization(&self, config: &TnConfig) -> f64 {
        let interface = lock(&self.runtime)
            .shaping_interface
            .clone()
            .unwrap_or_else(|| config.shaping_interface());
        let Some(snapshot) = self.monitor.latest() else {
            return 0.0;
        };
        let Some(usage) = snapshot.interfaces.get(&interface) else {
            return 0.0;
        };
        let shaped = config.bandwidth_policy.downlink_mbps;
        if shaped > 0.0 {
            (usage.total_mbps() / shaped * 100.0).min(100.0)
        } else {
            usage.utilization_percent
        }
    }

    pub fn get_test_result(&self, test_id: &str) -> TnResult<PerformanceMetrics> {
        lock(&self.results)
            .by_id
            .get(test_id)
            .cloned()
            .ok_or_else(|| TnError::NotFound {
                resource: format!("test result {}", test_id),
            })
    }

    /// Point-in-time status. Subsystem probe failures are reported in
    /// `error_messages` rather than failing the snapshot.
    pub async fn get_status(&self) -> TnStatus {
        let (healthy, vni, interface) = {
            let runtime = lock(&self.runtime);
            (runtime.healthy, runtime.vni, runtime.shaping_interface.clone())
        };
        let mut errors = Vec::new();

        let mut vxlan_status = VxlanStatus {
            tunnel_up: false,
            remote_peers: Vec::new(),
            packet_stats: BTreeMap::new(),
            last_heartbeat: Utc::now(),
        };
        match vni.and_then(|vni| self.tunnels.list_active_tunnels().remove(&vni)) {
            Some(tunnel) => {
                vxlan_status.tunnel_up = self.tunnels.is_up(&tunnel.device_name).await;
                vxlan_status.remote_peers = tunnel.remote_ips.iter().map(|ip| ip.to_string()).collect();
                match self.tunnels.packet_stats(&tunnel.device_name).await {
                    Ok(stats) => vxlan_status.packet_stats = stats,
                    Err(e) => errors.push(format!("packet statistics: {}", e)),
                }
            }
            None => errors.push("VXLAN tunnel not initialized".to_string()),
        }

        let tc_status = match interface {
            Some(interface) => match self.tc.get_status(&interface).await {
                Ok(status) => status,
                Err(e) => {
                    errors.push(format!("TC status: {}", e));
                    TcStatus::default()
                }
            },
            None => {
                errors.push("TC manager not initialized".to_string());
                TcStatus::default()
            }
        };

        TnStatus {
            healthy,
            last_update: Utc::now(),
            active_connections: vxlan_status.remote_peers.len() as u32,
            bandwidth_usage: self.monitor.usage_map(),
            vxlan_status,
            tc_status,
            error_messages: errors,
        }
    }

    pub async fn tunnel_status(&self) -> TnResult<TunnelStatus> {
        let vni = self.active_vni()?;
        self.tunnels.get_tunnel_status(vni).await
    }

    /// Replace the tunnel's peers and record them in the active configuration.
    pub async fn update_peers(&self, peers: Vec<String>) -> TnResult<TunnelStatus> {
        let _guard = self.reconfigure.lock().await;
        let vni = self.active_vni()?;
        let status = self.tunnels.update_peers(vni, &peers).await?;
        self.replace_config(|active| active.vxlan.remote_ips = peers);
        Ok(status)
    }

    pub async fn test_connectivity(&self) -> TnResult<BTreeMap<String, bool>> {
        let vni = self.active_vni()?;
        self.tunnels.test_connectivity(vni).await
    }

    pub async fn tc_status(&self) -> TnResult<TcStatus> {
        let interface = self.active_interface()?;
        self.tc.get_status(&interface).await
    }

    /// Apply a policy on the shaping interface and make it the active one.
    pub async fn apply_tc_rules(&self, policy: BandwidthPolicy) -> TnResult<()> {
        let _guard = self.reconfigure.lock().await;
        let interface = self.active_interface()?;
        self.tc.apply_rules(&interface, &policy).await?;
        self.replace_config(|active| active.bandwidth_policy = policy);
        Ok(())
    }

    pub async fn clear_tc_rules(&self) -> TnResult<()> {
        let _guard = self.reconfigure.lock().await;
        let interface = self.active_interface()?;
        self.tc.clear_rules(&interface).await
    }

    /// Latest bandwidth sample, sampling now if the monitor has not ticked yet.
    pub async fn bandwidth(&self) -> TnResult<BandwidthSnapshot> {
        self.ensure_started("bandwidth monitor")?;
        match self.monitor.latest() {
            Some(snapshot) => Ok(snapshot),
            None => self.monitor.sample().await,
        }
    }

    pub fn bandwidth_updates(&self) -> TnResult<tokio::sync::broadcast::Receiver<BandwidthSnapshot>> {
        self.ensure_started("bandwidth monitor")?;
        Ok(self.monitor.subscribe())
    }

    pub async fn iperf_servers(&self) -> BTreeMap<u16, IperfServer> {
        self.perf.get_active_servers().await
    }

    pub async fn start_iperf_server(&self, port: u16) -> TnResult<IperfServer> {
        self.perf.start_server(port).await
    }

    pub async fn stop_iperf_server(&self, port: u16) -> TnResult<()> {
        self.perf.stop_server(port).await
    }

    pub async fn metrics(&self) -> AgentMetrics {
        let latest = self.monitor.latest();
        let iperf_servers = self.perf.get_active_servers().await.len();
        let (healthy, configured_slices) = {
            let runtime = lock(&self.runtime);
            (runtime.healthy, runtime.slices.len())
        };
        AgentMetrics {
            cluster: self.cluster_name(),
            timestamp: Utc::now(),
            healthy,
            tunnel_operations: self.tunnels.get_metrics(),
            traffic_control_operations: self.tc.get_metrics(),
            active_tunnels: self.tunnels.list_active_tunnels().len(),
            iperf_servers,
            configured_slices,
            stored_test_results: lock(&self.results).by_id.len(),
            total_rx_mbps: latest.as_ref().map_or(0.0, |s| s.total_rx_mbps),
            total_tx_mbps: latest.as_ref().map_or(0.0, |s| s.total_tx_mbps),
            bandwidth: latest.map(|s| s.summary),
        }
    }

    /// Pretty JSON document with counters, bandwidth history and stored
    /// test results.
    pub async fn export_metrics(&self) -> TnResult<String> {
        let metrics = self.metrics().await;
        let results: Vec<PerformanceMetrics> = {
            let store = lock(&self.results);
            store
                .order
                .iter()
                .filter_map(|id| store.by_id.get(id).cloned())
                .collect()
        };
        let export = serde_json::json!({
            "cluster": metrics.cluster,
            "exportedAt": Utc::now(),
            "metrics": metrics,
            "bandwidthHistory": self.monitor.history(usize::MAX),
            "testResults": results,
        });
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Prometheus text exposition of the agent's gauges and counters.
    pub async fn prometheus(&self) -> String {
        let metrics = self.metrics().await;
        render_prometheus(&metrics, &self.monitor.usage_map())
    }
}

fn render_prometheus(metrics: &AgentMetrics, usage: &BTreeMap<String, f64>) -> String {
    let cluster = &metrics.cluster;
    let mut out = String::new();
    let mut gauge = |name: &str, help: &str, value: f64| {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} gauge", name);
        let _ = writeln!(out, "{}{{cluster=\"{}\"}} {}", name, cluster, value);
    };
    gauge("tn_agent_healthy", "Whether the agent passes its health check", f64::from(u8::from(metrics.healthy)));
    gauge("tn_vxlan_tunnels_active", "Active VXLAN tunnels", metrics.active_tunnels as f64);
    gauge("tn_iperf_servers_active", "Running iperf3 servers", metrics.iperf_servers as f64);
    gauge("tn_slices_configured", "Slices configured on this agent", metrics.configured_slices as f64);
    gauge("tn_bandwidth_rx_mbps", "Total receive rate", metrics.total_rx_mbps);
    gauge("tn_bandwidth_tx_mbps", "Total transmit rate", metrics.total_tx_mbps);

    for (name, ops) in [
        ("tn_vxlan_operations", &metrics.tunnel_operations),
        ("tn_tc_operations", &metrics.traffic_control_operations),
    ] {
        let _ = writeln!(out, "# TYPE {}_total counter", name);
        let _ = writeln!(out, "{}_total{{cluster=\"{}\",result=\"success\"}} {}", name, cluster, ops.successful_operations);
        let _ = writeln!(out, "{}_total{{cluster=\"{}\",result=\"failure\"}} {}", name, cluster, ops.failed_operations);
        let _ = writeln!(out, "# TYPE {}_avg_ms gauge", name);
        let _ = writeln!(out, "{}_avg_ms{{cluster=\"{}\"}} {}", name, cluster, ops.avg_operation_ms);
    }

    if !usage.is_empty() {
        let _ = writeln!(out, "# TYPE tn_interface_mbps gauge");
        for (interface, mbps) in usage {
            let _ = writeln!(
                out,
                "tn_interface_mbps{{cluster=\"{}\",interface=\"{}\"}} {}",
                cluster, interface, mbps
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::FakeExecutor;

    fn config(port: u16) -> TnConfig {
        TnConfig {
            cluster_name: "edge01".to_string(),
            network_cidr: "10.1.0.0/16".to_string(),
            vxlan: tn_shared::VxlanConfig {
                vni: 100,
                remote_ips: vec!["192.168.1.101".to_string()],
                local_ip: "192.168.1.100".to_string(),
                ..Default::default()
            },
            bandwidth_policy: BandwidthPolicy {
                downlink_mbps: 4.57,
                uplink_mbps: 4.57,
                latency_ms: 16.1,
                ..Default::default()
            },
            qos_class: "eMBB".to_string(),
            interfaces: vec![],
            monitoring_port: port,
        }
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("sliceId", "embb-slice_01.a").is_ok());
        assert!(validate_identifier("sliceId", "").is_err());
        assert!(validate_identifier("sliceId", "a/b").is_err());
        assert!(validate_identifier("sliceId", "x; rm -rf /").is_err());
    }

    #[test]
    fn test_result_store_is_bounded() {
        let mut store = ResultStore {
            order: VecDeque::new(),
            by_id: HashMap::new(),
            limit: 2,
        };
        for id in ["a", "b", "a", "c"] {
            store.insert(PerformanceMetrics::new("c1", id, TestType::Latency, Duration::from_secs(1)));
        }
        assert_eq!(store.order, vec!["a".to_string(), "c".to_string()]);
        assert!(!store.by_id.contains_key("b"));
    }

    #[tokio::test]
    async fn test_operations_before_start_are_not_initialized() {
        let agent = TnAgent::with_executor(config(18080), AgentOptions::default(), Arc::new(FakeExecutor::new()));
        assert!(matches!(agent.tunnel_status().await, Err(TnError::NotInitialized { .. })));
        assert!(matches!(agent.tc_status().await, Err(TnError::NotInitialized { .. })));
        assert!(matches!(agent.bandwidth().await, Err(TnError::NotInitialized { .. })));
        assert!(!agent.is_healthy());

        let status = agent.get_status().await;
        assert!(!status.healthy);
        assert_eq!(status.error_messages.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_test_config_is_rejected() {
        let fake = FakeExecutor::new();
        let agent = TnAgent::with_executor(config(18080), AgentOptions::default(), Arc::new(fake.clone()));
        let test = PerformanceTestConfig {
            duration: Duration::from_secs(7200),
            test_type: TestType::Throughput,
            ..Default::default()
        };
        let err = agent.run_performance_test(test).await.unwrap_err();
        assert!(matches!(err, TnError::DurationTooLong { max_secs: 3600, .. }));

        let test = PerformanceTestConfig {
            duration: Duration::from_secs(900),
            ..Default::default()
        };
        let err = agent.run_performance_test(test).await.unwrap_err();
        assert!(matches!(err, TnError::DurationTooLong { max_secs: 600, .. }));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stream_options_reach_iperf() {
        let fake = FakeExecutor::new();
        let agent = TnAgent::with_executor(config(18080), AgentOptions::default(), Arc::new(fake.clone()));
        let test = PerformanceTestConfig {
            test_id: "udp1".to_string(),
            duration: Duration::from_secs(2),
            test_type: TestType::Throughput,
            protocol: "UDP".to_string(),
            parallel: 4,
            interval: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        agent.run_performance_test(test).await.unwrap();

        let calls = fake.calls_matching("iperf3 -c");
        assert_eq!(calls.len(), 3);
        assert_eq!(
            calls[0],
            "iperf3 -c 192.168.1.101 -p 18081 -t 2 -u -b 4570K -P 4 -i 1 -J"
        );
        assert!(calls[1].ends_with("-u -b 4570K -P 4 -i 1 -R -J"));
        assert!(calls[2].ends_with("-u -b 4570K -P 4 -i 1 --bidir -J"));
    }

    #[tokio::test]
    async fn test_unsupported_stream_options_are_rejected() {
        let fake = FakeExecutor::new();
        let agent = TnAgent::with_executor(config(18080), AgentOptions::default(), Arc::new(fake.clone()));
        for test in [
            PerformanceTestConfig {
                protocol: "sctp".to_string(),
                ..Default::default()
            },
            PerformanceTestConfig {
                parallel: 0,
                ..Default::default()
            },
            PerformanceTestConfig {
                parallel: 500,
                ..Default::default()
            },
            PerformanceTestConfig {
                window_size: "64K;ls".to_string(),
                ..Default::default()
            },
        ] {
            let err = agent.run_performance_test(test).await.unwrap_err();
            assert!(matches!(err, TnError::Validation(_)), "{:?}", err);
        }
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_target_is_reported_not_failed() {
        let mut cfg = config(18080);
        cfg.vxlan.remote_ips.clear();
        let agent = TnAgent::with_executor(cfg, AgentOptions::default(), Arc::new(FakeExecutor::new()));
        let metrics = agent
            .run_performance_test(PerformanceTestConfig {
                test_id: "t1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(metrics.error_details, vec!["no target IP specified".to_string()]);
        assert!((metrics.vxlan_overhead - 50.0 / 1450.0 * 100.0).abs() < 1e-9);
        assert_eq!(metrics.tc_overhead, 6.5);
        assert_eq!(agent.get_test_result("t1").unwrap(), metrics);
        assert!(matches!(agent.get_test_result("t2"), Err(TnError::NotFound { .. })));
    }

    #[test]
    fn test_prometheus_rendering() {
        let metrics = AgentMetrics {
            cluster: "edge01".to_string(),
            timestamp: Utc::now(),
            healthy: true,
            tunnel_operations: OpMetrics {
                total_operations: 3,
                successful_operations: 2,
                failed_operations: 1,
                avg_operation_ms: 1.5,
            },
            traffic_control_operations: OpMetrics::default(),
            active_tunnels: 1,
            iperf_servers: 3,
            configured_slices: 0,
            stored_test_results: 0,
            total_rx_mbps: 0.0,
            total_tx_mbps: 0.0,
            bandwidth: None,
        };
        let usage = BTreeMap::from([("eth0".to_string(), 12.5)]);
        let text = render_prometheus(&metrics, &usage);
        assert!(text.contains("tn_agent_healthy{cluster=\"edge01\"} 1"));
        assert!(text.contains("tn_vxlan_operations_total{cluster=\"edge01\",result=\"failure\"} 1"));
        assert!(text.contains("tn_interface_mbps{cluster=\"edge01\",interface=\"eth0\"} 12.5"));
    }
}
