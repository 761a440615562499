//! VXLAN tunnel lifecycle management.
//!
//! The [`TunnelManager`] owns every overlay device it creates on this node.
//! Tunnels are keyed by VNI and move through
//! `Creating -> Active -> Deleting -> (removed)`; a create that fails at any
//! step leaves nothing behind in the active set or on the host.
//!
//! # Key Features
//!
//! * **Input validation first**: addresses, VNI, device names and MTU are checked
//!   before any command runs
//! * **Exactly-once create**: concurrent creates for one VNI yield one success and
//!   one "already exists" failure
//! * **Per-VNI ordering**: operations on the same VNI are serialized, distinct VNIs
//!   run in parallel
//! * **Cleanup on failure**: a half-configured link is deleted before the error is
//!   returned
//! * **Operation metrics**: every operation is counted and timed

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::commands::{CommandExecutor, builder, run_checked};
use crate::locks::KeyedLocks;
use crate::op_metrics::{OpMetrics, OpRecorder};
use tn_shared::retry::{RetryPolicy, retry_async};
use tn_shared::{TnError, TnResult, Validate, ValidationError, VxlanConfig, parse_ip};

/// VXLAN encapsulation overhead per packet in bytes (outer Ethernet, IP, UDP
/// and VXLAN headers).
pub const VXLAN_HEADER_BYTES: f64 = 50.0;

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Creating,
    Active,
    Deleting,
    Failed,
}

/// Status of one tunnel owned by the manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub vni: u32,
    #[serde(rename = "localIP")]
    pub local_ip: IpAddr,
    #[serde(rename = "remoteIPs")]
    pub remote_ips: Vec<IpAddr>,
    pub device_name: String,
    pub mtu: u32,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_interface: Option<String>,
    pub state: TunnelState,
    pub created_at: DateTime<Utc>,
}

/// Percentage of an MTU-sized frame consumed by VXLAN encapsulation.
pub fn vxlan_overhead_percent(mtu: u32) -> f64 {
    if mtu == 0 {
        return 0.0;
    }
    VXLAN_HEADER_BYTES / mtu as f64 * 100.0
}

/// Parse `ip -s link show` output into `rx_*`/`tx_*` counters.
pub fn parse_link_stats(output: &str) -> BTreeMap<String, u64> {
    let mut stats = BTreeMap::new();
    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    for (i, line) in lines.iter().enumerate() {
        let prefix = if line.starts_with("RX:") {
            "rx"
        } else if line.starts_with("TX:") {
            "tx"
        } else {
            continue;
        };
        let Some(values) = lines.get(i + 1) else {
            continue;
        };
        let headers = line[3..].split_whitespace();
        for (name, value) in headers.zip(values.split_whitespace()) {
            if let Ok(value) = value.parse::<u64>() {
                stats.insert(format!("{}_{}", prefix, name.trim_end_matches(':')), value);
            }
        }
    }
    stats
}

/// True when `ip link show` reports the link administratively and
/// operationally up. VXLAN devices commonly report `state UNKNOWN` while
/// forwarding, so the `UP` flag is accepted too.
pub fn link_is_up(output: &str) -> bool {
    if output.contains("state UP") {
        return true;
    }
    output
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .is_some_and(|(flags, _)| flags.split(',').any(|f| f == "UP"))
}

/// Manages VXLAN devices on the local node
#[derive(Clone)]
pub struct TunnelManager {
    executor: Arc<dyn CommandExecutor>,
    tunnels: Arc<Mutex<HashMap<u32, TunnelStatus>>>,
    locks: KeyedLocks<u32>,
    metrics: OpRecorder,
    command_timeout: Duration,
    read_retry: RetryPolicy,
}

impl TunnelManager {
    pub fn new(executor: Arc<dyn CommandExecutor>, metrics: OpRecorder, command_timeout: Duration) -> Self {
        Self {
            executor,
            tunnels: Arc::new(Mutex::new(HashMap::new())),
            locks: KeyedLocks::new(),
            metrics,
            command_timeout,
            read_retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy used for read-only link probes.
    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<u32, TunnelStatus>> {
        match self.tunnels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create a tunnel with default port, MTU and device name.
    pub async fn create_tunnel(
        &self,
        vni: u32,
        local_ip: &str,
        remote_ips: &[String],
        physical_interface: Option<&str>,
    ) -> TnResult<TunnelStatus> {
        let config = VxlanConfig {
            vni,
            local_ip: local_ip.to_string(),
            remote_ips: remote_ips.to_vec(),
            physical_interface: physical_interface.map(str::to_string),
            ..Default::default()
        };
        self.create_from_config(&config).await
    }

    /// Create a tunnel from a full VXLAN configuration.
    #[instrument(skip(self, config), fields(vni = config.vni))]
    pub async fn create_from_config(&self, config: &VxlanConfig) -> TnResult<TunnelStatus> {
        let started = Instant::now();
        let result = self.create_inner(config).await;
        self.metrics.observe(started, &result);
        match &result {
            Ok(status) => info!(
                "Created VXLAN tunnel {} (VNI {}) with {} peers",
                status.device_name,
                status.vni,
                status.remote_ips.len()
            ),
            Err(e) => error!("Failed to create VXLAN tunnel for VNI {}: {}", config.vni, e),
        }
        result
    }

    async fn create_inner(&self, config: &VxlanConfig) -> TnResult<TunnelStatus> {
        config.validate()?;
        let local_ip = config.local_addr()?;
        let remote_ips = config.remote_addrs()?;
        let device = config.effective_device_name();

        let mut status = TunnelStatus {
            vni: config.vni,
            local_ip,
            remote_ips,
            device_name: device.clone(),
            mtu: config.effective_mtu(),
            port: config.effective_port(),
            physical_interface: config.physical_interface.clone(),
            state: TunnelState::Creating,
            created_at: Utc::now(),
        };

        {
            let mut table = self.table();
            if table.contains_key(&config.vni) {
                return Err(TnError::AlreadyExists {
                    resource: format!("tunnel with VNI {}", config.vni),
                });
            }
            if table.values().any(|t| t.device_name == device) {
                return Err(TnError::AlreadyExists {
                    resource: format!("device {}", device),
                });
            }
            table.insert(config.vni, status.clone());
        }

        let _guard = self.locks.lock(&config.vni).await;

        match self.configure_link(config, &status).await {
            Ok(()) => {
                status.state = TunnelState::Active;
                self.table().insert(config.vni, status.clone());
                Ok(status)
            }
            Err(e) => {
                // Failed tunnels are not kept in the active set
                self.table().remove(&config.vni);
                Err(e)
            }
        }
    }

    async fn configure_link(&self, config: &VxlanConfig, status: &TunnelStatus) -> TnResult<()> {
        let device = status.device_name.as_str();
        let add = builder::ip_link_add_vxlan(
            device,
            status.vni,
            status.port,
            status.local_ip,
            status.physical_interface.as_deref(),
            config.learning,
        );
        run_checked(self.executor.as_ref(), &add, self.command_timeout).await?;

        let setup = async {
            run_checked(
                self.executor.as_ref(),
                &builder::ip_link_set_mtu(device, status.mtu),
                self.command_timeout,
            )
            .await?;
            run_checked(
                self.executor.as_ref(),
                &builder::ip_link_set_up(device),
                self.command_timeout,
            )
            .await?;
            Ok::<(), TnError>(())
        };

        if let Err(e) = setup.await {
            warn!("Bringing up {} failed, removing link: {}", device, e);
            self.delete_link(device).await;
            return Err(e);
        }

        for remote in &status.remote_ips {
            if let Err(e) = run_checked(
                self.executor.as_ref(),
                &builder::bridge_fdb_append(device, *remote),
                self.command_timeout,
            )
            .await
            {
                warn!("Failed to add FDB entry for {} on {}: {}", remote, device, e);
            }
        }
        Ok(())
    }

    async fn delete_link(&self, device: &str) {
        if let Err(e) = run_checked(
            self.executor.as_ref(),
            &builder::ip_link_delete(device),
            self.command_timeout,
        )
        .await
        {
            warn!("Cleanup of {} failed: {}", device, e);
        }
    }

    /// Delete a tunnel. Unknown VNIs yield [`TnError::NotFound`].
    #[instrument(skip(self))]
    pub async fn delete_tunnel(&self, vni: u32) -> TnResult<()> {
        let started = Instant::now();
        let result = self.delete_inner(vni).await;
        self.metrics.observe(started, &result);
        match &result {
            Ok(()) => info!("Deleted VXLAN tunnel for VNI {}", vni),
            Err(TnError::NotFound { .. }) => debug!("VNI {} has no tunnel to delete", vni),
            Err(e) => error!("Failed to delete VXLAN tunnel for VNI {}: {}", vni, e),
        }
        result
    }

    async fn delete_inner(&self, vni: u32) -> TnResult<()> {
        let _guard = self.locks.lock(&vni).await;

        let device = {
            let mut table = self.table();
            let tunnel = table.get_mut(&vni).ok_or_else(|| TnError::NotFound {
                resource: format!("tunnel with VNI {}", vni),
            })?;
            if tunnel.state == TunnelState::Creating {
                return Err(TnError::Busy {
                    resource: format!("tunnel with VNI {}", vni),
                });
            }
            tunnel.state = TunnelState::Deleting;
            tunnel.device_name.clone()
        };

        let output = self
            .executor
            .run(&builder::ip_link_delete(&device), self.command_timeout)
            .await;
        let gone = match &output {
            Ok(out) if out.success() => true,
            Ok(out) => {
                let text = out.diagnostic();
                text.contains("Cannot find device") || text.contains("does not exist")
            }
            Err(_) => false,
        };

        if gone {
            self.table().remove(&vni);
            return Ok(());
        }

        if let Some(tunnel) = self.table().get_mut(&vni) {
            tunnel.state = TunnelState::Active;
        }
        match output {
            Ok(out) => Err(TnError::command(format!(
                "ip link delete {} failed: {}",
                device,
                out.diagnostic()
            ))),
            Err(e) => Err(e),
        }
    }

    /// Current status of a tunnel
    #[instrument(skip(self))]
    pub async fn get_tunnel_status(&self, vni: u32) -> TnResult<TunnelStatus> {
        let started = Instant::now();
        let result = {
            let _guard = self.locks.lock(&vni).await;
            self.table().get(&vni).cloned().ok_or_else(|| TnError::NotFound {
                resource: format!("tunnel with VNI {}", vni),
            })
        };
        self.metrics.observe(started, &result);
        result
    }

    /// All tunnels in the `Active` state
    pub fn list_active_tunnels(&self) -> BTreeMap<u32, TunnelStatus> {
        self.table()
            .iter()
            .filter(|(_, t)| t.state == TunnelState::Active)
            .map(|(vni, t)| (*vni, t.clone()))
            .collect()
    }

    pub fn get_metrics(&self) -> OpMetrics {
        self.metrics.snapshot()
    }

    /// Replace the peer set of a tunnel.
    #[instrument(skip(self, peers), fields(peer_count = peers.len()))]
    pub async fn update_peers(&self, vni: u32, peers: &[String]) -> TnResult<TunnelStatus> {
        let started = Instant::now();
        let result = self.update_peers_inner(vni, peers).await;
        self.metrics.observe(started, &result);
        if let Err(e) = &result {
            warn!("Failed to update peers for VNI {}: {}", vni, e);
        }
        result
    }

    async fn update_peers_inner(&self, vni: u32, peers: &[String]) -> TnResult<TunnelStatus> {
        let new_peers = peers
            .iter()
            .map(|p| parse_ip("remoteIPs", p))
            .collect::<Result<Vec<_>, _>>()?;

        let _guard = self.locks.lock(&vni).await;
        let current = self.table().get(&vni).cloned().ok_or_else(|| TnError::NotFound {
            resource: format!("tunnel with VNI {}", vni),
        })?;

        if new_peers.contains(&current.local_ip) {
            return Err(ValidationError::new(
                "remoteIPs",
                format!("local address {} cannot be a remote peer", current.local_ip),
            )
            .into());
        }

        for old in &current.remote_ips {
            if let Err(e) = run_checked(
                self.executor.as_ref(),
                &builder::bridge_fdb_del(&current.device_name, *old),
                self.command_timeout,
            )
            .await
            {
                debug!("Removing FDB entry for {} failed: {}", old, e);
            }
        }
        for peer in &new_peers {
            run_checked(
                self.executor.as_ref(),
                &builder::bridge_fdb_append(&current.device_name, *peer),
                self.command_timeout,
            )
            .await?;
        }

        let mut table = self.table();
        let tunnel = table.get_mut(&vni).ok_or_else(|| TnError::NotFound {
            resource: format!("tunnel with VNI {}", vni),
        })?;
        tunnel.remote_ips = new_peers;
        info!("Updated VNI {} peers: {:?}", vni, tunnel.remote_ips);
        Ok(tunnel.clone())
    }

    /// Ping every peer of a tunnel. Returns peer address -> reachable.
    #[instrument(skip(self))]
    pub async fn test_connectivity(&self, vni: u32) -> TnResult<BTreeMap<String, bool>> {
        let status = self.get_tunnel_status(vni).await?;
        let probes = status.remote_ips.iter().map(|peer| {
            let argv = builder::ping(&peer.to_string(), 3, None, 2);
            async move {
                let reachable = matches!(
                    self.executor.run(&argv, self.command_timeout).await,
                    Ok(out) if out.success()
                );
                (peer.to_string(), reachable)
            }
        });
        let results: BTreeMap<String, bool> = join_all(probes).await.into_iter().collect();
        debug!("Connectivity for VNI {}: {:?}", vni, results);
        Ok(results)
    }

    /// Packet counters for a device
    pub async fn packet_stats(&self, device: &str) -> TnResult<BTreeMap<String, u64>> {
        tn_shared::validate_device_name("device", device)?;
        let argv = builder::ip_link_stats(device);
        let output = retry_async(
            || run_checked(self.executor.as_ref(), &argv, self.command_timeout),
            self.read_retry,
            "ip -s link show",
        )
        .await?;
        Ok(parse_link_stats(&output.stdout))
    }

    /// Whether a device is up. Probe failures count as down.
    pub async fn is_up(&self, device: &str) -> bool {
        if tn_shared::validate_device_name("device", device).is_err() {
            return false;
        }
        let argv = builder::ip_link_show(device);
        match retry_async(
            || run_checked(self.executor.as_ref(), &argv, self.command_timeout),
            self.read_retry,
            "ip link show",
        )
        .await
        {
            Ok(output) => link_is_up(&output.stdout),
            Err(_) => false,
        }
    }

    /// Delete every tunnel, logging failures. Used on shutdown.
    pub async fn delete_all(&self) {
        let vnis: Vec<u32> = self.table().keys().copied().collect();
        for vni in vnis {
            if let Err(e) = self.delete_tunnel(vni).await {
                warn!("Failed to remove tunnel VNI {} during cleanup: {}", vni, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATS: &str = "\
7: vxlan100: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000
    link/ether 5a:0c:3e:11:22:33 brd ff:ff:ff:ff:ff:ff
    RX:  bytes packets errors dropped  missed   mcast
         12345     100      0       2       0       0
    TX:  bytes packets errors dropped carrier collsns
         67890     200      1       0       0       0
";

    #[test]
    fn test_parse_link_stats() {
        let stats = parse_link_stats(STATS);
        assert_eq!(stats["rx_bytes"], 12345);
        assert_eq!(stats["rx_packets"], 100);
        assert_eq!(stats["rx_dropped"], 2);
        assert_eq!(stats["tx_bytes"], 67890);
        assert_eq!(stats["tx_errors"], 1);
    }

    #[test]
    fn test_link_is_up() {
        assert!(link_is_up(STATS));
        assert!(link_is_up("2: eth0: <BROADCAST> mtu 1500 state UP"));
        assert!(!link_is_up("7: vxlan1: <BROADCAST,MULTICAST> mtu 1450 state DOWN"));
    }

    #[test]
    fn test_overhead() {
        assert!((vxlan_overhead_percent(1450) - 3.448).abs() < 0.001);
        assert_eq!(vxlan_overhead_percent(0), 0.0);
    }
}
