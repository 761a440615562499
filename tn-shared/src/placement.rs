//! Placement decisions from the orchestrator and their implementation result.
//!
//! Per-cluster results are kept as tagged [`ClusterOutcome`] values and the
//! overall [`PlacementStatus`] is always derived from them with
//! [`PlacementStatus::reduce`], so the summary can never disagree with the
//! per-cluster detail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::config::BandwidthPolicy;
use crate::metrics::NetworkSliceMetrics;
use crate::slice::SliceType;
use crate::{Validate, ValidationError, validate_vni};

/// Where an orchestrator decided to run a slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementDecision {
    pub slice_id: String,
    pub slice_type: SliceType,
    pub clusters: Vec<ClusterPlacement>,
    pub network_policy: NetworkPolicy,
    #[serde(default)]
    pub qos_requirement: QosRequirement,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub request_id: String,
}

/// VNF placement on one cluster
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterPlacement {
    pub cluster_name: String,
    /// "edge", "regional" or "central"
    pub cluster_type: String,
    pub vnfs: Vec<VnfPlacement>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VnfPlacement {
    pub vnf_name: String,
    pub vnf_type: String,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkPolicy {
    pub slice_isolation: bool,
    pub vxlan_segment: VxlanSegment,
    pub bandwidth_policy: BandwidthPolicy,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VxlanSegment {
    pub vni: u32,
    pub subnets: Vec<String>,
    pub mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QosRequirement {
    pub throughput_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
    pub availability: f64,
    pub priority: u32,
}

impl Validate for PlacementDecision {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.slice_id.is_empty() {
            return Err(ValidationError::new("sliceId", "cannot be empty"));
        }
        if self.clusters.is_empty() {
            return Err(ValidationError::new("clusters", "at least one cluster is required"));
        }
        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            if cluster.cluster_name.is_empty() {
                return Err(ValidationError::new("clusters.clusterName", "cannot be empty"));
            }
            if !seen.insert(cluster.cluster_name.as_str()) {
                return Err(ValidationError::new(
                    "clusters.clusterName",
                    format!("'{}' listed twice", cluster.cluster_name),
                ));
            }
        }
        validate_vni(self.network_policy.vxlan_segment.vni)?;
        let mtu = self.network_policy.vxlan_segment.mtu;
        if mtu != 0 && !(576..=9000).contains(&mtu) {
            return Err(ValidationError::new("vxlanSegment.mtu", format!("{} is outside 576-9000", mtu)));
        }
        self.network_policy.bandwidth_policy.validate()
    }
}

/// Result of configuring one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ClusterOutcome {
    Configured,
    Failed { reason: String },
}

impl ClusterOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        ClusterOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, ClusterOutcome::Configured)
    }
}

/// Overall status of a placement implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementStatus {
    Ready,
    Partial,
    Failed,
}

impl PlacementStatus {
    /// `Ready` when every cluster configured, `Partial` when at least one
    /// did, `Failed` otherwise (including when there are no clusters).
    pub fn reduce<'a, I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = &'a ClusterOutcome>,
    {
        let (mut configured, mut total) = (0usize, 0usize);
        for outcome in outcomes {
            total += 1;
            if outcome.is_configured() {
                configured += 1;
            }
        }
        match (configured, total) {
            (0, _) => PlacementStatus::Failed,
            (c, t) if c == t => PlacementStatus::Ready,
            _ => PlacementStatus::Partial,
        }
    }
}

impl std::fmt::Display for PlacementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            PlacementStatus::Ready => "ready",
            PlacementStatus::Partial => "partial",
            PlacementStatus::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Established,
    Failed,
}

/// Overlay connectivity between two configured clusters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConnection {
    pub source: String,
    pub target: String,
    pub vxlan_status: ConnectionState,
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
    pub last_tested: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImplementationIssue {
    pub severity: IssueSeverity,
    pub component: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of implementing a [`PlacementDecision`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementImplementation {
    pub slice_id: String,
    pub status: PlacementStatus,
    pub clusters: BTreeMap<String, ClusterOutcome>,
    pub network_connections: Vec<NetworkConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_metrics: Option<NetworkSliceMetrics>,
    pub issues: Vec<ImplementationIssue>,
    pub deploy_time_ms: i64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl PlacementImplementation {
    pub fn new(slice_id: &str) -> Self {
        let now = Utc::now();
        Self {
            slice_id: slice_id.to_string(),
            status: PlacementStatus::Failed,
            clusters: BTreeMap::new(),
            network_connections: Vec::new(),
            performance_metrics: None,
            issues: Vec::new(),
            deploy_time_ms: 0,
            created_at: now,
            last_updated: now,
        }
    }

    pub fn record(&mut self, cluster: &str, outcome: ClusterOutcome) {
        if let ClusterOutcome::Failed { reason } = &outcome {
            self.add_issue(IssueSeverity::Error, cluster, format!("Failed to configure TN: {}", reason));
        }
        self.clusters.insert(cluster.to_string(), outcome);
        self.refresh_status();
    }

    pub fn add_issue(&mut self, severity: IssueSeverity, component: &str, description: impl Into<String>) {
        self.issues.push(ImplementationIssue {
            severity,
            component: component.to_string(),
            description: description.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn refresh_status(&mut self) {
        self.status = PlacementStatus::reduce(self.clusters.values());
        self.last_updated = Utc::now();
    }

    pub fn configured_clusters(&self) -> Vec<String> {
        self.clusters
            .iter()
            .filter(|(_, outcome)| outcome.is_configured())
            .map(|(name, _)| name.clone())
            .collect()
    }
}
