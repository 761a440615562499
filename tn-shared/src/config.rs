//! Per-cluster transport-network configuration.
//!
//! JSON field names follow the camelCase wire format agents and the manager
//! exchange (`clusterName`, `networkCIDR`, `remoteIPs`, ...). Every structure
//! implements [`Validate`]; nothing is handed to the tunnel or shaping
//! managers before validation passes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;

use crate::{
    DEFAULT_VXLAN_MTU, DEFAULT_VXLAN_PORT, Validate, ValidationError, parse_ip,
    validate_device_name, validate_vni,
};

/// Upper bound on shaped bandwidth (100 Gbit/s).
pub const MAX_BANDWIDTH_MBPS: f64 = 100_000.0;

/// Highest HTB class priority accepted in a policy.
pub const MAX_POLICY_PRIORITY: u32 = 7;

/// Queue class that installs rules without rate shaping.
pub const BEST_EFFORT_CLASS: &str = "best-effort";

/// Configuration for one cluster's transport network
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TnConfig {
    pub cluster_name: String,
    #[serde(rename = "networkCIDR")]
    pub network_cidr: String,
    pub vxlan: VxlanConfig,
    pub bandwidth_policy: BandwidthPolicy,
    pub qos_class: String,
    pub interfaces: Vec<NetworkInterface>,
    pub monitoring_port: u16,
}

/// VXLAN overlay parameters
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VxlanConfig {
    pub vni: u32,
    #[serde(rename = "remoteIPs")]
    pub remote_ips: Vec<String>,
    #[serde(rename = "localIP")]
    pub local_ip: String,
    pub port: u16,
    pub mtu: u32,
    pub device_name: String,
    pub learning: bool,
    /// Underlay device the tunnel is bound to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_interface: Option<String>,
}

/// Bandwidth, latency and loss shaping policy for a slice
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BandwidthPolicy {
    pub downlink_mbps: f64,
    pub uplink_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_percent: f64,
    pub priority: u32,
    pub queue_class: String,
    pub burst: String,
    pub filters: Vec<Filter>,
}

/// Packet classifier mapping matching traffic to a shaping class
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Filter {
    pub protocol: String,
    #[serde(rename = "srcIP")]
    pub src_ip: String,
    #[serde(rename = "dstIP")]
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    #[serde(rename = "flowID")]
    pub flow_id: String,
    pub action: String,
    #[serde(rename = "classID")]
    pub class_id: String,
    pub priority: u32,
}

/// Host network interface description
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
    pub mtu: u32,
    pub state: String,
}

impl VxlanConfig {
    /// Device name, defaulting to `vxlan<vni>`.
    pub fn effective_device_name(&self) -> String {
        if self.device_name.is_empty() {
            format!("vxlan{}", self.vni)
        } else {
            self.device_name.clone()
        }
    }

    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_VXLAN_PORT
        } else {
            self.port
        }
    }

    pub fn effective_mtu(&self) -> u32 {
        if self.mtu == 0 {
            DEFAULT_VXLAN_MTU
        } else {
            self.mtu
        }
    }

    pub fn local_addr(&self) -> Result<IpAddr, ValidationError> {
        parse_ip("localIP", &self.local_ip)
    }

    pub fn remote_addrs(&self) -> Result<Vec<IpAddr>, ValidationError> {
        self.remote_ips
            .iter()
            .map(|ip| parse_ip("remoteIPs", ip))
            .collect()
    }
}

impl Validate for VxlanConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_vni(self.vni)?;
        let local = self.local_addr()?;
        let remotes = self.remote_addrs()?;
        if remotes.contains(&local) {
            return Err(ValidationError::new(
                "remoteIPs",
                format!("local address {} cannot be a remote peer", local),
            ));
        }
        let unique: HashSet<_> = remotes.iter().collect();
        if unique.len() != remotes.len() {
            return Err(ValidationError::new("remoteIPs", "duplicate peer address"));
        }
        if self.mtu != 0 && !(576..=9000).contains(&self.mtu) {
            return Err(ValidationError::new(
                "mtu",
                format!("{} is outside 576-9000", self.mtu),
            ));
        }
        if !self.device_name.is_empty() {
            validate_device_name("deviceName", &self.device_name)?;
        }
        if let Some(phys) = &self.physical_interface {
            validate_device_name("physicalInterface", phys)?;
        }
        Ok(())
    }
}

impl BandwidthPolicy {
    /// A policy shapes traffic unless it is best-effort or carries no rate.
    pub fn is_shaping(&self) -> bool {
        self.queue_class != BEST_EFFORT_CLASS && self.downlink_mbps > 0.0
    }

    pub fn has_netem(&self) -> bool {
        self.latency_ms > 0.0 || self.jitter_ms > 0.0 || self.loss_percent > 0.0
    }

    /// Downlink rate in kbit/s as understood by `tc`.
    pub fn downlink_kbit(&self) -> u64 {
        (self.downlink_mbps * 1000.0).round() as u64
    }

    pub fn uplink_kbit(&self) -> u64 {
        (self.uplink_mbps * 1000.0).round() as u64
    }
}

fn check_range(field: &str, value: f64, max: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 || value > max {
        return Err(ValidationError::new(
            field,
            format!("{} is outside 0-{}", value, max),
        ));
    }
    Ok(())
}

impl Validate for BandwidthPolicy {
    fn validate(&self) -> Result<(), ValidationError> {
        check_range("downlinkMbps", self.downlink_mbps, MAX_BANDWIDTH_MBPS)?;
        check_range("uplinkMbps", self.uplink_mbps, MAX_BANDWIDTH_MBPS)?;
        check_range("latencyMs", self.latency_ms, 60_000.0)?;
        check_range("jitterMs", self.jitter_ms, 60_000.0)?;
        check_range("lossPercent", self.loss_percent, 100.0)?;
        if self.priority > MAX_POLICY_PRIORITY {
            return Err(ValidationError::new(
                "priority",
                format!("{} is outside 0-{}", self.priority, MAX_POLICY_PRIORITY),
            ));
        }
        if !self.queue_class.is_empty() {
            validate_device_name("queueClass", &self.queue_class)?;
        }
        if self.is_shaping() && self.downlink_kbit() < 1 {
            return Err(ValidationError::new(
                "downlinkMbps",
                "shaped rate must be at least 1 kbit/s",
            ));
        }
        for filter in &self.filters {
            filter.validate()?;
        }
        Ok(())
    }
}

impl Filter {
    /// IP protocol number for `u32 match ip protocol`.
    /// True when the filter matches on IPv6 addresses.
    pub fn is_ipv6(&self) -> bool {
        [&self.src_ip, &self.dst_ip]
            .into_iter()
            .any(|ip| matches!(ip.trim().parse::<IpAddr>(), Ok(IpAddr::V6(_))))
    }

    pub fn protocol_number(&self) -> Option<u8> {
        match self.protocol.to_lowercase().as_str() {
            "tcp" => Some(6),
            "udp" => Some(17),
            "icmp" => Some(1),
            _ => None,
        }
    }
}

fn is_class_id(value: &str) -> bool {
    match value.split_once(':') {
        Some((major, minor)) => {
            !major.is_empty()
                && major.len() <= 4
                && major.chars().all(|c| c.is_ascii_hexdigit())
                && minor.len() <= 4
                && minor.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

impl Validate for Filter {
    fn validate(&self) -> Result<(), ValidationError> {
        if !self.protocol.is_empty()
            && self.protocol.to_lowercase() != "ip"
            && self.protocol_number().is_none()
        {
            return Err(ValidationError::new(
                "filters.protocol",
                format!("unsupported protocol '{}'", self.protocol),
            ));
        }
        if !self.src_ip.is_empty() {
            parse_ip("filters.srcIP", &self.src_ip)?;
        }
        if !self.dst_ip.is_empty() {
            let dst = parse_ip("filters.dstIP", &self.dst_ip)?;
            if !self.src_ip.is_empty() {
                let src = parse_ip("filters.srcIP", &self.src_ip)?;
                if src.is_ipv6() != dst.is_ipv6() {
                    return Err(ValidationError::new(
                        "filters.dstIP",
                        "source and destination must be the same address family",
                    ));
                }
            }
        }
        if (self.src_port != 0 || self.dst_port != 0) && self.protocol_number().is_none() {
            return Err(ValidationError::new(
                "filters.protocol",
                "port matches require tcp or udp",
            ));
        }
        for (field, value) in [("filters.classID", &self.class_id), ("filters.flowID", &self.flow_id)] {
            if !value.is_empty() && !is_class_id(value) {
                return Err(ValidationError::new(
                    field,
                    format!("'{}' is not a major:minor handle", value),
                ));
            }
        }
        if self.priority > 65_535 {
            return Err(ValidationError::new(
                "filters.priority",
                format!("{} is outside 0-65535", self.priority),
            ));
        }
        Ok(())
    }
}

impl Validate for NetworkInterface {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_device_name("interfaces.name", &self.name)?;
        if !self.ip.is_empty() {
            parse_ip("interfaces.ip", &self.ip)?;
        }
        if !self.gateway.is_empty() {
            parse_ip("interfaces.gateway", &self.gateway)?;
        }
        Ok(())
    }
}

impl TnConfig {
    /// Interface traffic shaping is applied to: the first configured
    /// interface, else the VXLAN device itself.
    pub fn shaping_interface(&self) -> String {
        self.interfaces
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| self.vxlan.effective_device_name())
    }

    /// Load a configuration from a JSON5 document.
    pub fn from_json5(content: &str) -> anyhow::Result<Self> {
        json5::from_str(content).map_err(|e| anyhow::anyhow!("invalid TN configuration: {}", e))
    }
}

impl Validate for TnConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.cluster_name.is_empty() {
            return Err(ValidationError::new("clusterName", "cannot be empty"));
        }
        if !self
            .cluster_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ValidationError::new(
                "clusterName",
                "only alphanumerics, '-', '_' and '.' are allowed",
            ));
        }
        if self.monitoring_port == 0 {
            return Err(ValidationError::new("monitoringPort", "must be non-zero"));
        }
        if self.monitoring_port > 65_532 {
            return Err(ValidationError::new(
                "monitoringPort",
                "must leave room for three iperf3 ports above it",
            ));
        }
        self.vxlan.validate()?;
        self.bandwidth_policy.validate()?;
        for interface in &self.interfaces {
            interface.validate()?;
        }
        Ok(())
    }
}
