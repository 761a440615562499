//! Network bandwidth monitoring and statistics collection.
//!
//! Samples `/proc/net/dev` on a fixed interval and turns counter deltas into
//! per-interface rates. Interfaces with shaping rules additionally get their
//! root qdisc counters from `tc -s qdisc show`.
//!
//! # Key Features
//!
//! * **Interface discovery**: every non-loopback interface in the proc file is tracked
//! * **Rate calculations**: RX/TX Mbps, packet rates, error/drop rates and link utilization
//! * **Bounded history**: the most recent snapshots are kept for export
//! * **Live feed**: each snapshot is broadcast to subscribers (the SSE stream)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::commands::{CommandExecutor, builder, run_checked};
use crate::tc::parse_qdisc_stats;
use tn_shared::{TnError, TnResult};

pub const DEFAULT_PROC_NET_DEV: &str = "/proc/net/dev";
pub const DEFAULT_LINK_SPEED_MBPS: f64 = 1000.0;
pub const DEFAULT_HISTORY_LIMIT: usize = 720;

/// An interface counts as active above this combined rate
const ACTIVE_THRESHOLD_MBPS: f64 = 0.1;

/// Raw counters of one interface from `/proc/net/dev`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
}

/// Parse `/proc/net/dev` into counters per interface name.
pub fn parse_proc_net_dev(content: &str) -> BTreeMap<String, RawCounters> {
    content
        .lines()
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() || name.contains('|') {
                return None;
            }
            let fields: Vec<u64> = rest
                .split_whitespace()
                .map(|v| v.parse().ok())
                .collect::<Option<Vec<_>>>()?;
            if fields.len() < 12 {
                return None;
            }
            Some((
                name.to_string(),
                RawCounters {
                    rx_bytes: fields[0],
                    rx_packets: fields[1],
                    rx_errors: fields[2],
                    rx_dropped: fields[3],
                    tx_bytes: fields[8],
                    tx_packets: fields[9],
                    tx_errors: fields[10],
                    tx_dropped: fields[11],
                },
            ))
        })
        .collect()
}

/// Rates of one interface over the last sampling period
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceBandwidth {
    pub interface: String,
    pub rx_mbps: f64,
    pub tx_mbps: f64,
    pub rx_packets_per_sec: f64,
    pub tx_packets_per_sec: f64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub avg_packet_size: f64,
    pub error_rate: f64,
    pub drop_rate: f64,
    pub utilization_percent: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub qdisc_stats: BTreeMap<String, u64>,
}

impl InterfaceBandwidth {
    pub fn total_mbps(&self) -> f64 {
        self.rx_mbps + self.tx_mbps
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub active_interfaces: usize,
    pub busiest_interface: Option<String>,
    pub peak_mbps: f64,
    pub avg_utilization_percent: f64,
    pub total_errors: u64,
    pub total_dropped: u64,
}

/// One monitor sample across all interfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cluster: String,
    pub interfaces: BTreeMap<String, InterfaceBandwidth>,
    pub total_rx_mbps: f64,
    pub total_tx_mbps: f64,
    pub summary: PerformanceSummary,
}

/// Compute rates from two counter readings `elapsed` apart.
pub fn compute_rates(
    name: &str,
    previous: &RawCounters,
    current: &RawCounters,
    elapsed: Duration,
    link_speed_mbps: f64,
) -> InterfaceBandwidth {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let rx_bytes = current.rx_bytes.saturating_sub(previous.rx_bytes);
    let tx_bytes = current.tx_bytes.saturating_sub(previous.tx_bytes);
    let rx_packets = current.rx_packets.saturating_sub(previous.rx_packets);
    let tx_packets = current.tx_packets.saturating_sub(previous.tx_packets);
    let rx_errors = current.rx_errors.saturating_sub(previous.rx_errors);
    let tx_errors = current.tx_errors.saturating_sub(previous.tx_errors);
    let rx_dropped = current.rx_dropped.saturating_sub(previous.rx_dropped);
    let tx_dropped = current.tx_dropped.saturating_sub(previous.tx_dropped);

    let packets = (rx_packets + tx_packets) as f64;
    let ratio = |count: u64| if packets > 0.0 { count as f64 / packets * 100.0 } else { 0.0 };

    let rx_mbps = rx_bytes as f64 * 8.0 / secs / 1_000_000.0;
    let tx_mbps = tx_bytes as f64 * 8.0 / secs / 1_000_000.0;
    let utilization = if link_speed_mbps > 0.0 {
        ((rx_mbps + tx_mbps) / link_speed_mbps * 100.0).min(100.0)
    } else {
        0.0
    };

    InterfaceBandwidth {
        interface: name.to_string(),
        rx_mbps,
        tx_mbps,
        rx_packets_per_sec: rx_packets as f64 / secs,
        tx_packets_per_sec: tx_packets as f64 / secs,
        rx_errors,
        tx_errors,
        rx_dropped,
        tx_dropped,
        avg_packet_size: if packets > 0.0 {
            (rx_bytes + tx_bytes) as f64 / packets
        } else {
            0.0
        },
        error_rate: ratio(rx_errors + tx_errors),
        drop_rate: ratio(rx_dropped + tx_dropped),
        utilization_percent: utilization,
        qdisc_stats: BTreeMap::new(),
    }
}

fn summarize(interfaces: &BTreeMap<String, InterfaceBandwidth>) -> PerformanceSummary {
    let busiest = interfaces
        .values()
        .max_by(|a, b| a.total_mbps().total_cmp(&b.total_mbps()));
    let utilizations: Vec<f64> = interfaces.values().map(|i| i.utilization_percent).collect();
    PerformanceSummary {
        active_interfaces: interfaces
            .values()
            .filter(|i| i.total_mbps() > ACTIVE_THRESHOLD_MBPS)
            .count(),
        busiest_interface: busiest.map(|i| i.interface.clone()),
        peak_mbps: busiest.map(|i| i.total_mbps()).unwrap_or(0.0),
        avg_utilization_percent: if utilizations.is_empty() {
            0.0
        } else {
            utilizations.iter().sum::<f64>() / utilizations.len() as f64
        },
        total_errors: interfaces.values().map(|i| i.rx_errors + i.tx_errors).sum(),
        total_dropped: interfaces.values().map(|i| i.rx_dropped + i.tx_dropped).sum(),
    }
}

struct MonitorState {
    previous: Option<(Instant, BTreeMap<String, RawCounters>)>,
    history: VecDeque<BandwidthSnapshot>,
    shaped_interfaces: Vec<String>,
}

/// Network bandwidth monitoring service.
#[derive(Clone)]
pub struct BandwidthMonitor {
    cluster: String,
    proc_path: PathBuf,
    executor: Arc<dyn CommandExecutor>,
    link_speed_mbps: f64,
    history_limit: usize,
    command_timeout: Duration,
    state: Arc<Mutex<MonitorState>>,
    updates: broadcast::Sender<BandwidthSnapshot>,
}

impl BandwidthMonitor {
    pub fn new(cluster: &str, executor: Arc<dyn CommandExecutor>) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            cluster: cluster.to_string(),
            proc_path: PathBuf::from(DEFAULT_PROC_NET_DEV),
            executor,
            link_speed_mbps: DEFAULT_LINK_SPEED_MBPS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            command_timeout: Duration::from_secs(5),
            state: Arc::new(Mutex::new(MonitorState {
                previous: None,
                history: VecDeque::new(),
                shaped_interfaces: Vec::new(),
            })),
            updates,
        }
    }

    /// Read counters from `path` instead of `/proc/net/dev`.
    pub fn with_proc_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.proc_path = path.into();
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Interfaces whose qdisc statistics are collected with each sample.
    pub fn set_shaped_interfaces(&self, interfaces: Vec<String>) {
        self.state().shaped_interfaces = interfaces;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BandwidthSnapshot> {
        self.updates.subscribe()
    }

    /// Take one sample. The first sample after start reports zero rates.
    #[instrument(skip(self), fields(cluster = %self.cluster))]
    pub async fn sample(&self) -> TnResult<BandwidthSnapshot> {
        let content = tokio::fs::read_to_string(&self.proc_path).await.map_err(|e| {
            TnError::command(format!("reading {} failed: {}", self.proc_path.display(), e))
        })?;
        let now = Instant::now();
        let current: BTreeMap<String, RawCounters> = parse_proc_net_dev(&content)
            .into_iter()
            .filter(|(name, _)| name != "lo")
            .collect();

        let (mut interfaces, shaped) = {
            let mut state = self.state();
            let interfaces = current
                .iter()
                .map(|(name, counters)| {
                    let bandwidth = match &state.previous {
                        Some((at, previous)) => previous
                            .get(name)
                            .map(|p| compute_rates(name, p, counters, now - *at, self.link_speed_mbps))
                            .unwrap_or_else(|| InterfaceBandwidth {
                                interface: name.clone(),
                                ..Default::default()
                            }),
                        None => InterfaceBandwidth {
                            interface: name.clone(),
                            ..Default::default()
                        },
                    };
                    (name.clone(), bandwidth)
                })
                .collect::<BTreeMap<_, _>>();
            state.previous = Some((now, current));
            (interfaces, state.shaped_interfaces.clone())
        };

        for name in shaped {
            let Some(entry) = interfaces.get_mut(&name) else {
                continue;
            };
            match run_checked(self.executor.as_ref(), &builder::tc_qdisc_stats(&name), self.command_timeout).await {
                Ok(out) => entry.qdisc_stats = parse_qdisc_stats(&out.stdout),
                Err(e) => debug!("No qdisc statistics for {}: {}", name, e),
            }
        }

        let snapshot = BandwidthSnapshot {
            timestamp: Utc::now(),
            cluster: self.cluster.clone(),
            total_rx_mbps: interfaces.values().map(|i| i.rx_mbps).sum(),
            total_tx_mbps: interfaces.values().map(|i| i.tx_mbps).sum(),
            summary: summarize(&interfaces),
            interfaces,
        };

        {
            let mut state = self.state();
            state.history.push_back(snapshot.clone());
            while state.history.len() > self.history_limit {
                state.history.pop_front();
            }
        }
        // No subscribers is fine
        let _ = self.updates.send(snapshot.clone());
        Ok(snapshot)
    }

    /// Sample every `interval` until `cancel` fires.
    pub fn start(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.sample().await {
                            warn!("Bandwidth sample failed: {}", e);
                        }
                    }
                }
            }
            debug!("Bandwidth monitor stopped");
        })
    }

    pub fn latest(&self) -> Option<BandwidthSnapshot> {
        self.state().history.back().cloned()
    }

    /// Most recent `limit` snapshots, oldest first.
    pub fn history(&self, limit: usize) -> Vec<BandwidthSnapshot> {
        let state = self.state();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Combined Mbps per interface from the latest sample.
    pub fn usage_map(&self) -> BTreeMap<String, f64> {
        self.latest()
            .map(|s| {
                s.interfaces
                    .iter()
                    .map(|(name, i)| (name.clone(), i.total_mbps()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mean utilization of one interface across the retained history.
    pub fn average_utilization(&self, interface: &str) -> f64 {
        let state = self.state();
        let values: Vec<f64> = state
            .history
            .iter()
            .filter_map(|s| s.interfaces.get(interface))
            .map(|i| i.utilization_percent)
            .collect();
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        }
    }

    /// Pretty JSON with the latest snapshot and the retained history.
    pub fn export_json(&self) -> TnResult<String> {
        let export = serde_json::json!({
            "cluster": self.cluster,
            "exportedAt": Utc::now(),
            "latest": self.latest(),
            "history": self.history(usize::MAX),
        });
        Ok(serde_json::to_string_pretty(&export)?)
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.state()
            .previous
            .as_ref()
            .map(|(_, counters)| counters.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn shift_previous(&self, by: Duration) {
        let mut state = self.state();
        if let Some((at, _)) = state.previous.as_mut() {
            if let Some(earlier) = at.checked_sub(by) {
                *at = earlier;
            }
        }
    }
}

impl std::fmt::Debug for BandwidthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthMonitor")
            .field("cluster", &self.cluster)
            .field("proc_path", &self.proc_path)
            .finish()
    }
}
