//! Implementation of multi-cluster placement decisions.
//!
//! Each placed cluster receives its own [`TnConfig`]: the slice's VXLAN
//! segment with the cluster's overlay address as local IP and every other
//! placed cluster as a remote peer, plus the slice's bandwidth policy.
//! Clusters are configured concurrently, each under its own timeout, and a
//! failure on one never stops the others. Nothing is rolled back.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tn_shared::errors::{ManagerError, ManagerResult};
use tn_shared::placement::{ConnectionState, IssueSeverity};
use tn_shared::{
    ClusterOutcome, ClusterPlacement, NetworkConnection, PerformanceTestConfig,
    PlacementDecision, PlacementImplementation, TestType, TnConfig, TnError, Validate,
    VxlanConfig,
};

use crate::manager::{RegisteredAgent, TnManager};

/// Monitoring port assumed when an agent endpoint carries none.
const DEFAULT_AGENT_PORT: u16 = 8080;

/// Agents reserve the three ports above the monitoring port for iperf3.
const MAX_MONITORING_PORT: u16 = 65_532;

/// Overlay CIDR derived from the VNI when the segment lists no subnet.
pub fn cluster_network_cidr(vni: u32) -> String {
    format!("10.{}.0.0/16", vni % 255)
}

/// [`TnConfig`] for one placed cluster.
pub fn build_cluster_config(
    decision: &PlacementDecision,
    cluster: &ClusterPlacement,
    local_ip: &str,
    peers: &[String],
    monitoring_port: u16,
) -> TnConfig {
    let segment = &decision.network_policy.vxlan_segment;
    TnConfig {
        cluster_name: cluster.cluster_name.clone(),
        network_cidr: segment
            .subnets
            .first()
            .cloned()
            .unwrap_or_else(|| cluster_network_cidr(segment.vni)),
        vxlan: VxlanConfig {
            vni: segment.vni,
            remote_ips: peers.iter().filter(|p| *p != local_ip).cloned().collect(),
            local_ip: local_ip.to_string(),
            port: tn_shared::DEFAULT_VXLAN_PORT,
            mtu: if segment.mtu == 0 {
                tn_shared::DEFAULT_VXLAN_MTU
            } else {
                segment.mtu
            },
            device_name: format!("vxlan{}", segment.vni),
            learning: false,
            physical_interface: None,
        },
        bandwidth_policy: decision.network_policy.bandwidth_policy.clone(),
        qos_class: decision.slice_type.as_str().to_string(),
        interfaces: Vec::new(),
        monitoring_port,
    }
}

impl TnManager {
    /// Configure every cluster of `decision` and report what happened.
    ///
    /// An invalid decision is rejected before any agent is contacted.
    /// Cancelling `cancel` stops dispatching further clusters (they are
    /// recorded as failed) and skips the connectivity and validation steps;
    /// clusters already configured stay configured.
    #[instrument(skip(self, decision, cancel), fields(slice_id = %decision.slice_id, slice_type = %decision.slice_type))]
    pub async fn implement_placement(
        &self,
        decision: &PlacementDecision,
        cancel: &CancellationToken,
    ) -> ManagerResult<PlacementImplementation> {
        decision.validate().map_err(TnError::from)?;
        let started = Instant::now();
        let mut implementation = PlacementImplementation::new(&decision.slice_id);
        let agents = self.snapshot();
        info!(
            "[MANAGER] Implementing placement {} across {} clusters",
            decision.slice_id,
            decision.clusters.len()
        );

        // Overlay addresses of the placed clusters that have an agent
        let addresses: BTreeMap<&str, &str> = decision
            .clusters
            .iter()
            .filter_map(|c| {
                agents
                    .get(&c.cluster_name)
                    .map(|a| (c.cluster_name.as_str(), a.info.cluster_ip.as_str()))
            })
            .collect();

        let options = self.options();
        let semaphore = Arc::new(Semaphore::new(options.dispatch_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut dispatched = Vec::new();

        for placement in &decision.clusters {
            let name = placement.cluster_name.clone();
            if cancel.is_cancelled() {
                implementation.record(&name, ClusterOutcome::failed("placement cancelled before dispatch"));
                continue;
            }
            let Some(agent) = agents.get(&name).cloned() else {
                let err = ManagerError::AgentNotRegistered {
                    cluster: name.clone(),
                };
                warn!("[MANAGER] {}", err);
                implementation.record(&name, ClusterOutcome::failed(err.to_string()));
                continue;
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                implementation.record(&name, ClusterOutcome::failed("placement cancelled before dispatch"));
                continue;
            };

            let local_ip = agent.info.cluster_ip.clone();
            let peers: Vec<String> = addresses
                .iter()
                .filter(|(other, ip)| **other != name && **ip != local_ip)
                .map(|(_, ip)| ip.to_string())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let port = agent
                .client
                .endpoint()
                .port_or_known_default()
                .filter(|p| *p <= MAX_MONITORING_PORT)
                .unwrap_or(DEFAULT_AGENT_PORT);
            let config = build_cluster_config(decision, placement, &local_ip, &peers, port);
            let slice_id = decision.slice_id.clone();
            let timeout = options.cluster_timeout;
            debug!("[MANAGER] Dispatching {} with peers {:?}", name, peers);

            dispatched.push(name.clone());
            tasks.spawn(async move {
                let _permit = permit;
                let outcome =
                    match tokio::time::timeout(timeout, agent.client.configure_slice(&slice_id, &config)).await {
                        Ok(Ok(())) => ClusterOutcome::Configured,
                        Ok(Err(e)) => ClusterOutcome::failed(e.to_string()),
                        Err(_) => ClusterOutcome::failed(format!(
                            "configuration timed out after {}s",
                            timeout.as_secs_f64()
                        )),
                    };
                (name, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    match &outcome {
                        ClusterOutcome::Configured => info!("[MANAGER] Cluster {} configured", name),
                        ClusterOutcome::Failed { reason } => {
                            warn!("[MANAGER] Cluster {} failed: {}", name, reason)
                        }
                    }
                    implementation.record(&name, outcome);
                }
                Err(e) => warn!("[MANAGER] Configuration task ended abnormally: {}", e),
            }
        }
        for name in dispatched {
            if !implementation.clusters.contains_key(&name) {
                implementation.record(&name, ClusterOutcome::failed("configuration task aborted"));
            }
        }

        let configured: Vec<&str> = decision
            .clusters
            .iter()
            .map(|c| c.cluster_name.as_str())
            .filter(|name| {
                implementation
                    .clusters
                    .get(*name)
                    .is_some_and(ClusterOutcome::is_configured)
            })
            .collect();

        if !cancel.is_cancelled() {
            let connections = probe_connections(&configured, &agents).await;
            for connection in &connections {
                if let Some(error) = &connection.error {
                    implementation.add_issue(
                        IssueSeverity::Warning,
                        "connectivity",
                        format!("{} -> {}: {}", connection.source, connection.target, error),
                    );
                }
            }
            implementation.network_connections = connections;
        }
        implementation.deploy_time_ms = started.elapsed().as_millis() as i64;

        if let Some(duration) = options.validation_test {
            if !configured.is_empty() && !cancel.is_cancelled() {
                let targets: Vec<Arc<RegisteredAgent>> = configured
                    .iter()
                    .filter_map(|name| agents.get(*name).cloned())
                    .collect();
                let config = PerformanceTestConfig {
                    test_id: format!("placement_{}_{}", decision.slice_id, Utc::now().timestamp_millis()),
                    slice_id: decision.slice_id.clone(),
                    slice_type: decision.slice_type.as_str().to_string(),
                    duration,
                    test_type: TestType::Comprehensive,
                    ..PerformanceTestConfig::default()
                };
                match self.run_test_on(&targets, &config, cancel).await {
                    Ok(metrics) => {
                        if !metrics.sla_compliance {
                            implementation.add_issue(
                                IssueSeverity::Warning,
                                "validation",
                                format!(
                                    "slice misses its SLA: compliance {:.1}%",
                                    metrics.thesis_validation.compliance_percent
                                ),
                            );
                        }
                        implementation.performance_metrics = Some(metrics);
                    }
                    Err(e) => implementation.add_issue(
                        IssueSeverity::Warning,
                        "validation",
                        format!("validation test failed: {}", e),
                    ),
                }
            }
        }

        implementation.refresh_status();
        info!(
            "[MANAGER] Placement {} {}: {}/{} clusters configured in {} ms",
            decision.slice_id,
            implementation.status,
            configured.len(),
            decision.clusters.len(),
            implementation.deploy_time_ms
        );
        Ok(implementation)
    }
}

/// One record per configured pair (i < j), judged by the source agent's
/// tunnel connectivity test toward the target's overlay address.
async fn probe_connections(
    configured: &[&str],
    agents: &BTreeMap<String, Arc<RegisteredAgent>>,
) -> Vec<NetworkConnection> {
    if configured.len() < 2 {
        return Vec::new();
    }
    let sources = &configured[..configured.len() - 1];
    let probes = futures_util::future::join_all(sources.iter().map(|name| async move {
        let result = match agents.get(*name) {
            Some(agent) => agent.client.test_connectivity().await.map_err(|e| e.to_string()),
            None => Err("agent unregistered during placement".to_string()),
        };
        (*name, result)
    }))
    .await;
    let probes: BTreeMap<&str, Result<BTreeMap<String, bool>, String>> = probes.into_iter().collect();

    let mut connections = Vec::new();
    for (i, source) in configured.iter().enumerate() {
        for target in &configured[i + 1..] {
            let target_ip = agents.get(*target).map(|a| a.info.cluster_ip.clone()).unwrap_or_default();
            let error = match probes.get(source) {
                Some(Ok(reachability)) => match reachability.get(&target_ip) {
                    Some(true) => None,
                    Some(false) => Some(format!("peer {} unreachable", target_ip)),
                    None => Some(format!("peer {} missing from tunnel", target_ip)),
                },
                Some(Err(e)) => Some(e.clone()),
                None => Some("no connectivity result".to_string()),
            };
            connections.push(NetworkConnection {
                source: source.to_string(),
                target: target.to_string(),
                vxlan_status: if error.is_none() {
                    ConnectionState::Established
                } else {
                    ConnectionState::Failed
                },
                latency_ms: 0.0,
                bandwidth_mbps: 0.0,
                last_tested: Utc::now(),
                error,
            });
        }
    }
    connections
}
