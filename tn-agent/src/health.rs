//! Agent health model.
//!
//! The agent is healthy when its tunnel is up, its shaping rules are in
//! place and at least one iperf3 server is listening. Each subsystem reports
//! a [`ServiceHealth`]; the overall verdict is the worst of them.

use serde::Serialize;

/// Health of one subsystem
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceHealth::Healthy)
    }

    /// Degraded subsystems still count as serving.
    pub fn is_serving(&self) -> bool {
        !matches!(self, ServiceHealth::Unhealthy { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ServiceHealth::Healthy => None,
            ServiceHealth::Degraded { reason } => Some(reason),
            ServiceHealth::Unhealthy { reason } => Some(reason),
        }
    }
}

/// Per-subsystem health collected by one check
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub tunnel: ServiceHealth,
    pub traffic_control: ServiceHealth,
    pub iperf: ServiceHealth,
}

impl HealthReport {
    /// The agent reports healthy while no subsystem is unhealthy.
    pub fn is_healthy(&self) -> bool {
        self.tunnel.is_serving() && self.traffic_control.is_serving() && self.iperf.is_serving()
    }

    pub fn reasons(&self) -> Vec<String> {
        [
            ("tunnel", &self.tunnel),
            ("traffic control", &self.traffic_control),
            ("iperf3", &self.iperf),
        ]
        .into_iter()
        .filter_map(|(name, health)| health.reason().map(|r| format!("{}: {}", name, r)))
        .collect()
    }
}
