//! Traffic control (HTB + netem) management per interface.
//!
//! Applying a policy always clears the interface first, so a slice's rules
//! fully replace whatever a previous slice left behind. Policies are
//! validated before the interface lock is taken; an invalid policy never
//! touches existing rules.
//!
//! Rule layout on an interface:
//!
//! ```text
//! 1:      htb root, default 30
//! └─ 1:10 htb class, rate = downlink, burst from latency budget
//!    └─ 100: netem delay/jitter/loss (only when requested)
//! filters: u32 per classifier entry, or one catch-all -> 1:10
//! ffff:   ingress, one policer at the uplink rate (when uplink is set)
//! ```
//!
//! Egress is shaped and queued; arriving traffic can only be policed, so
//! excess uplink traffic is dropped rather than delayed.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::commands::{CommandExecutor, builder, run_checked};
use crate::locks::KeyedLocks;
use crate::op_metrics::{OpMetrics, OpRecorder};
use crate::tc_calculator;
use tn_shared::retry::{RetryPolicy, retry_async};
use tn_shared::{BandwidthPolicy, TcStatus, TnError, TnResult, Validate, validate_device_name};

/// HTB class carrying a slice's traffic
pub const SLICE_CLASS: &str = "1:10";

const DEFAULT_CLASS_MINOR: u32 = 30;
const NETEM_HANDLE: &str = "100:";

/// Policy currently installed on an interface
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRules {
    pub interface: String,
    pub policy: BandwidthPolicy,
    pub shaping: bool,
    pub applied_at: DateTime<Utc>,
}

/// Parse the root qdisc counters out of `tc -s qdisc show`.
pub fn parse_qdisc_stats(output: &str) -> BTreeMap<String, u64> {
    let mut stats = BTreeMap::new();
    let Some(sent) = output.lines().map(str::trim).find(|l| l.starts_with("Sent ")) else {
        return stats;
    };
    let tokens: Vec<&str> = sent
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == ',')
        .filter(|t| !t.is_empty())
        .collect();
    for pair in tokens.windows(2) {
        let key = match (pair[0], pair[1]) {
            ("Sent", _) => Some(("sent_bytes", pair[1])),
            (n, "pkt") => Some(("sent_packets", n)),
            ("dropped", _) => Some(("dropped", pair[1])),
            ("overlimits", _) => Some(("overlimits", pair[1])),
            ("requeues", _) => Some(("requeues", pair[1])),
            _ => None,
        };
        if let Some((name, value)) = key {
            if let Ok(value) = value.parse::<u64>() {
                stats.insert(name.to_string(), value);
            }
        }
    }
    if let Some(backlog) = output.lines().map(str::trim).find(|l| l.starts_with("backlog ")) {
        let mut parts = backlog.split_whitespace().skip(1);
        if let Some(bytes) = parts.next().and_then(|b| b.trim_end_matches('b').parse().ok()) {
            stats.insert("backlog_bytes".to_string(), bytes);
        }
        if let Some(pkts) = parts.next().and_then(|p| p.trim_end_matches('p').parse().ok()) {
            stats.insert("backlog_packets".to_string(), pkts);
        }
    }
    stats
}

static BURST_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

/// Burst in bytes from an explicit policy value like `32k`, `1600b` or `1m`.
/// Sizes beyond what tc accepts (a u32 byte count) are rejected.
fn parse_burst(value: &str) -> Option<u64> {
    let pattern = BURST_PATTERN
        .get_or_init(|| Regex::new(r"^(\d+)\s*(b|k|kb|m|mb)?$").ok())
        .as_ref()?;
    let lowered = value.trim().to_lowercase();
    let caps = pattern.captures(&lowered)?;
    let number: u64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str()) {
        Some("k") | Some("kb") => 1024,
        Some("m") | Some("mb") => 1024 * 1024,
        _ => 1,
    };
    number
        .checked_mul(multiplier)
        .filter(|bytes| *bytes <= u64::from(u32::MAX))
}

/// Manages shaping rules on network interfaces
#[derive(Clone)]
pub struct TrafficControlManager {
    executor: Arc<dyn CommandExecutor>,
    applied: Arc<Mutex<HashMap<String, AppliedRules>>>,
    locks: KeyedLocks<String>,
    metrics: OpRecorder,
    command_timeout: Duration,
}

impl TrafficControlManager {
    pub fn new(executor: Arc<dyn CommandExecutor>, metrics: OpRecorder, command_timeout: Duration) -> Self {
        Self {
            executor,
            applied: Arc::new(Mutex::new(HashMap::new())),
            locks: KeyedLocks::new(),
            metrics,
            command_timeout,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, AppliedRules>> {
        match self.applied.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Replace the rules on `interface` with `policy`.
    #[instrument(skip(self, policy), fields(interface = %interface, downlink_mbps = policy.downlink_mbps))]
    pub async fn apply_rules(&self, interface: &str, policy: &BandwidthPolicy) -> TnResult<()> {
        let started = Instant::now();
        let result = self.apply_inner(interface, policy).await;
        self.metrics.observe(started, &result);
        match &result {
            Ok(()) => info!(
                "Applied TC policy on {}: {} Mbps, {} ms, {}% loss",
                interface, policy.downlink_mbps, policy.latency_ms, policy.loss_percent
            ),
            Err(e) => error!("Failed to apply TC policy on {}: {}", interface, e),
        }
        result
    }

    async fn apply_inner(&self, interface: &str, policy: &BandwidthPolicy) -> TnResult<()> {
        validate_device_name("interface", interface)?;
        policy.validate()?;
        let burst = if policy.burst.is_empty() {
            None
        } else {
            Some(parse_burst(&policy.burst).ok_or_else(|| {
                TnError::validation("burst", format!("'{}' is not a valid size", policy.burst))
            })?)
        };

        let _guard = self.locks.lock(&interface.to_string()).await;

        self.clear_interface(interface).await?;
        self.table().remove(interface);

        if let Err(e) = self.install(interface, policy, burst).await {
            warn!("Rolling back partial TC configuration on {}", interface);
            if let Err(cleanup) = self.clear_interface(interface).await {
                warn!("Rollback on {} failed: {}", interface, cleanup);
            }
            return Err(e);
        }

        self.table().insert(
            interface.to_string(),
            AppliedRules {
                interface: interface.to_string(),
                policy: policy.clone(),
                shaping: policy.is_shaping(),
                applied_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn install(&self, interface: &str, policy: &BandwidthPolicy, burst: Option<u64>) -> TnResult<()> {
        let mut commands = vec![builder::tc_qdisc_add_htb_root(interface, DEFAULT_CLASS_MINOR)];

        if policy.is_shaping() {
            let rate_kbit = policy.downlink_kbit();
            let burst = burst.unwrap_or_else(|| tc_calculator::burst_bytes(rate_kbit, policy.latency_ms));
            commands.push(builder::tc_class_add_htb(
                interface,
                SLICE_CLASS,
                rate_kbit,
                burst,
                policy.priority,
            ));
            if policy.has_netem() {
                commands.push(builder::tc_qdisc_add_netem(
                    interface,
                    SLICE_CLASS,
                    NETEM_HANDLE,
                    policy.latency_ms,
                    policy.jitter_ms,
                    policy.loss_percent,
                ));
            }
        } else {
            debug!("Best-effort policy on {}: installing rules without shaping", interface);
        }

        if policy.filters.is_empty() {
            commands.push(builder::tc_filter_catch_all(interface, SLICE_CLASS));
        } else {
            for filter in &policy.filters {
                let flow = [&filter.class_id, &filter.flow_id]
                    .into_iter()
                    .find(|id| !id.is_empty())
                    .map(String::as_str)
                    .unwrap_or(SLICE_CLASS);
                commands.push(builder::tc_filter_add_u32(interface, filter, flow));
            }
        }

        if policy.is_shaping() && policy.uplink_kbit() > 0 {
            let rate_kbit = policy.uplink_kbit();
            let burst = burst.unwrap_or_else(|| tc_calculator::burst_bytes(rate_kbit, policy.latency_ms));
            commands.push(builder::tc_qdisc_add_ingress(interface));
            commands.push(builder::tc_filter_police_ingress(interface, rate_kbit, burst));
        }

        for argv in &commands {
            run_checked(self.executor.as_ref(), argv, self.command_timeout).await?;
        }
        Ok(())
    }

    /// Remove the root and ingress qdiscs. A missing qdisc is not an error.
    async fn clear_interface(&self, interface: &str) -> TnResult<()> {
        let output = self
            .executor
            .run(&builder::tc_qdisc_del_root(interface), self.command_timeout)
            .await?;
        if !output.success() {
            let text = output.diagnostic();
            let nothing_installed = text.contains("No such file or directory")
                || text.contains("handle of zero")
                || text.contains("Invalid handle");
            if !nothing_installed {
                return Err(TnError::command(format!(
                    "tc qdisc del dev {} root failed: {}",
                    interface, text
                )));
            }
        }
        if let Err(e) = self
            .executor
            .run(&builder::tc_qdisc_del_ingress(interface), self.command_timeout)
            .await
        {
            debug!("Ingress qdisc removal on {} ignored: {}", interface, e);
        }
        Ok(())
    }

    /// Remove all shaping rules from `interface`.
    #[instrument(skip(self))]
    pub async fn clear_rules(&self, interface: &str) -> TnResult<()> {
        let started = Instant::now();
        let result = async {
            validate_device_name("interface", interface)?;
            let _guard = self.locks.lock(&interface.to_string()).await;
            self.clear_interface(interface).await?;
            self.table().remove(interface);
            Ok(())
        }
        .await;
        self.metrics.observe(started, &result);
        match &result {
            Ok(()) => info!("Cleared TC rules on {}", interface),
            Err(e) => error!("Failed to clear TC rules on {}: {}", interface, e),
        }
        result
    }

    /// Query the live state of `interface`. Reads are retried.
    #[instrument(skip(self))]
    pub async fn get_status(&self, interface: &str) -> TnResult<TcStatus> {
        validate_device_name("interface", interface)?;
        let _guard = self.locks.lock(&interface.to_string()).await;

        let policy = RetryPolicy::default();
        let qdisc_argv = builder::tc_qdisc_show(interface);
        let class_argv = builder::tc_class_show(interface);
        let qdiscs = retry_async(
            || run_checked(self.executor.as_ref(), &qdisc_argv, self.command_timeout),
            policy,
            "tc qdisc show",
        )
        .await?;
        let classes = retry_async(
            || run_checked(self.executor.as_ref(), &class_argv, self.command_timeout),
            policy,
            "tc class show",
        )
        .await?;
        let queue_stats = match run_checked(
            self.executor.as_ref(),
            &builder::tc_qdisc_stats(interface),
            self.command_timeout,
        )
        .await
        {
            Ok(out) => parse_qdisc_stats(&out.stdout),
            Err(e) => {
                debug!("Queue statistics unavailable for {}: {}", interface, e);
                BTreeMap::new()
            }
        };

        Ok(TcStatus {
            rules_active: qdiscs.stdout.contains("qdisc htb"),
            shaping_active: classes.stdout.contains(" rate "),
            queue_stats,
            interfaces: vec![interface.to_string()],
        })
    }

    pub fn applied_rules(&self, interface: &str) -> Option<AppliedRules> {
        self.table().get(interface).cloned()
    }

    /// Interfaces with an installed policy
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_metrics(&self) -> OpMetrics {
        self.metrics.snapshot()
    }

    /// Clear every interface this manager configured. Used on shutdown.
    pub async fn clear_all(&self) {
        for interface in self.interfaces() {
            if let Err(e) = self.clear_rules(&interface).await {
                warn!("Failed to clear {} during cleanup: {}", interface, e);
            }
        }
    }
}
