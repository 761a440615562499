//! Per-cluster transport network agent.
//!
//! The agent owns one VXLAN overlay tunnel, the tc shaping rules of the
//! slices configured on the cluster and a small pool of iperf3 servers, and
//! exposes all of it through the HTTP API in [`http`].
//!
//! # Key Features
//!
//! - **Command seam**: every `ip`, `bridge`, `tc`, `iperf3` and `ping`
//!   invocation goes through [`commands::CommandExecutor`], so the managers
//!   can be driven by a fake in tests
//! - **Per-resource ordering**: operations on one VNI, interface or port are
//!   serialized without blocking unrelated resources
//! - **Operation metrics**: tunnel and TC managers count attempts, failures
//!   and latency of every operation
//! - **Bandwidth monitoring**: periodic `/proc/net/dev` sampling streamed to
//!   HTTP clients as server-sent events

pub mod agent;
pub mod bandwidth;
pub mod commands;
pub mod config;
pub mod health;
pub mod http;
pub mod iperf;
pub mod locks;
pub mod op_metrics;
pub mod tc;
pub mod tc_calculator;
pub mod vxlan;

pub use agent::{AgentMetrics, AgentOptions, SliceRecord, TnAgent};
pub use health::{HealthReport, ServiceHealth};
