//! Central coordinator for the per-cluster TN agents.
//!
//! The manager registers agents over HTTP, pushes slice configurations to
//! them, turns orchestrator placement decisions into per-cluster tunnel and
//! shaping setups, and scores measured performance against the reference
//! targets of each slice type.
//!
//! # Key Features
//!
//! - **Agent client**: one [`AgentClient`] per cluster, with classified
//!   transport errors and retried reads
//! - **Placement**: [`TnManager::implement_placement`] configures every
//!   placed cluster concurrently with per-cluster timeouts and cancellation
//! - **Compliance**: [`ComplianceValidator`] checks throughput, latency and
//!   deployment time within a relative tolerance
//! - **Metrics**: bounded histories in [`MetricsCollector`] exported as
//!   timestamped JSON reports

pub mod client;
pub mod collector;
pub mod compliance;
pub mod config;
pub mod manager;
pub mod placement;

pub use client::{AgentClient, AgentHealth};
pub use collector::{MetricsCollector, MetricsReport, MetricsSummary};
pub use compliance::{ComplianceReport, ComplianceValidator, SliceCompliance};
pub use manager::{AgentInfo, ClusterStatusReport, ManagerOptions, TnManager, aggregate_metrics};
