//! Shared types and utilities for the transport-network control plane.
//!
//! This crate contains the data structures exchanged between the per-cluster
//! TN agent and the central TN manager, together with the validation rules
//! that guard every value before it reaches an OS networking tool.
//!
//! # Key Components
//!
//! * [`config`] - Cluster configuration (`TnConfig`, `VxlanConfig`, `BandwidthPolicy`)
//! * [`metrics`] - Performance test configuration and measured results
//! * [`placement`] - Placement decisions and their per-cluster implementation outcome
//! * [`slice`] - Slice types and their reference QoS targets
//! * [`errors`] - Error taxonomy shared by agent and manager
//! * [`retry`] - Backoff retry for idempotent reads
//!
//! # Control Flow
//!
//! ```text
//! Orchestrator          Manager                       Agent (per cluster)
//!    │ ── PlacementDecision ──► │                          │
//!    │                          │ ── POST /slices/{id} ──► │ tunnel + shaping
//!    │                          │ ── POST /tests ────────► │ iperf3 / ping
//!    │                          │ ◄── PerformanceMetrics ─ │
//!    │ ◄── PlacementImplementation + NetworkSliceMetrics ─ │
//! ```

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub mod config;
pub mod errors;
pub mod metrics;
pub mod placement;
pub mod retry;
pub mod serde_helpers;
pub mod slice;

pub use config::{BandwidthPolicy, Filter, NetworkInterface, TnConfig, VxlanConfig};
pub use errors::{NetworkErrorKind, TnError, TnResult};
pub use metrics::{
    LatencyMetrics, NetworkSliceMetrics, PerformanceMetrics, PerformanceTestConfig, TcStatus,
    TestType, ThesisValidation, ThroughputMetrics, TnStatus, VxlanStatus,
};
pub use placement::{
    ClusterOutcome, ClusterPlacement, NetworkConnection, PlacementDecision,
    PlacementImplementation, PlacementStatus,
};
pub use slice::{SliceType, ThesisTarget};

/// Version reported by agents on `/health`.
pub const API_VERSION: &str = "1.0.0";

/// Default VXLAN UDP destination port (IANA).
pub const DEFAULT_VXLAN_PORT: u16 = 4789;

/// Default MTU for VXLAN devices (1500 minus encapsulation headroom).
pub const DEFAULT_VXLAN_MTU: u32 = 1450;

/// Largest valid VXLAN network identifier (24 bits).
pub const MAX_VNI: u32 = 16_777_215;

/// Ceiling for slice deployment time used by compliance checks (10 minutes).
pub const DEPLOY_TARGET_MS: i64 = 600_000;

/// Trait for validating configuration values before they are applied.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Validation error carrying the offending field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Parse an IPv4/IPv6 address, rejecting anything else (host names,
/// CIDR suffixes, shell payloads).
pub fn parse_ip(field: &str, value: &str) -> Result<IpAddr, ValidationError> {
    value
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| ValidationError::new(field, format!("'{}' is not a valid IP address", value)))
}

/// Validate a network device name.
///
/// Linux limits names to 15 bytes. Only alphanumerics plus `_`, `.` and `-`
/// are accepted and the name may not start with a separator, which rules out
/// shell metacharacters, path separators and NUL bytes.
pub fn validate_device_name(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new(field, "name cannot be empty"));
    }
    if name.len() > 15 {
        return Err(ValidationError::new(
            field,
            format!("'{}' exceeds 15 characters", name),
        ));
    }
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !first_ok
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(ValidationError::new(
            field,
            format!("'{}' contains forbidden characters", name.escape_debug()),
        ));
    }
    Ok(())
}

/// Validate a VXLAN network identifier.
pub fn validate_vni(vni: u32) -> Result<(), ValidationError> {
    if vni == 0 || vni > MAX_VNI {
        return Err(ValidationError::new(
            "vni",
            format!("{} is outside 1-{}", vni, MAX_VNI),
        ));
    }
    Ok(())
}

/// Current wall-clock time, used for response timestamps.
pub fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
