//! iperf3 and ping driven performance measurement.
//!
//! # Key Features
//!
//! * **Server lifecycle**: `iperf3 -s` processes keyed by port, with readiness
//!   probing and guaranteed kill on stop
//! * **Strict validation**: host, port, duration and parallelism are checked
//!   before any process starts
//! * **Always a result**: [`PerfTestManager::run_test`] returns the partial
//!   [`IperfResult`] alongside the error on failure
//! * **Failure classification**: refused, timed out, unreachable and DNS
//!   failures are reported as distinct network errors
//! * **Serialized clients**: tests against the same `host:port` run one at a
//!   time, since an iperf3 server accepts a single test

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::commands::builder::{self, IperfClientArgs, IperfDirection};
use crate::commands::{CommandExecutor, CommandOutput, ProcessHandle};
use crate::locks::KeyedLocks;
use tn_shared::{LatencyMetrics, NetworkErrorKind, ThroughputMetrics, TnError, TnResult, ValidationError};

/// Longest throughput run accepted
pub const MAX_THROUGHPUT_DURATION: Duration = Duration::from_secs(3600);
/// Longest latency run accepted
pub const MAX_LATENCY_DURATION: Duration = Duration::from_secs(600);
pub const MAX_PARALLEL_STREAMS: u32 = 128;

const READINESS_TIMEOUT: Duration = Duration::from_secs(3);
const READINESS_POLL: Duration = Duration::from_millis(100);
/// Allowance on top of the requested duration for connect and teardown
const CLIENT_GRACE: Duration = Duration::from_secs(15);
const PING_INTERVAL: Duration = Duration::from_millis(200);

/// A running iperf3 server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IperfServer {
    pub port: u16,
    pub pid: Option<u32>,
    pub started: DateTime<Utc>,
}

struct ServerEntry {
    info: IperfServer,
    process: Box<dyn ProcessHandle>,
}

/// Client test parameters
#[derive(Debug, Clone, PartialEq)]
pub struct IperfTestConfig {
    pub server: String,
    pub port: u16,
    pub duration: Duration,
    pub protocol: String,
    pub bandwidth: Option<String>,
    pub parallel: u32,
    pub window_size: Option<String>,
    pub interval: Option<Duration>,
    pub direction: IperfDirection,
}

impl IperfTestConfig {
    pub fn tcp(server: &str, port: u16, duration: Duration) -> Self {
        Self {
            server: server.to_string(),
            port,
            duration,
            protocol: "tcp".to_string(),
            bandwidth: None,
            parallel: 1,
            window_size: None,
            interval: None,
            direction: IperfDirection::Download,
        }
    }

    fn is_udp(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("udp")
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub bytes: u64,
    pub bits_per_sec: f64,
    pub mbits_per_sec: f64,
    #[serde(default)]
    pub retransmits: u64,
}

impl StreamSummary {
    fn from_bits(bits_per_sec: f64) -> Self {
        Self {
            bits_per_sec,
            mbits_per_sec: bits_per_sec / 1_000_000.0,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuUtilization {
    pub host_total: f64,
    pub host_user: f64,
    pub host_system: f64,
    pub remote_total: f64,
    pub remote_user: f64,
    pub remote_system: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IperfSummary {
    pub sent: StreamSummary,
    pub received: StreamSummary,
    pub cpu_util: CpuUtilization,
    pub lost_packets: u64,
    pub lost_percent: f64,
    pub jitter_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    pub version: String,
}

/// Outcome of one iperf3 client run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IperfResult {
    pub test_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_secs: f64,
    pub protocol: String,
    pub summary: IperfSummary,
    pub server_info: ServerInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<NetworkErrorKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_output: String,
}

impl IperfResult {
    fn new(protocol: &str) -> Self {
        Self {
            test_id: next_test_id(),
            timestamp: Utc::now(),
            duration_secs: 0.0,
            protocol: protocol.to_string(),
            summary: IperfSummary::default(),
            server_info: ServerInfo::default(),
            error_messages: Vec::new(),
            error_kind: None,
            raw_output: String::new(),
        }
    }

    /// Received rate, falling back to the sent rate when the receiver side
    /// was not reported.
    pub fn goodput_mbps(&self) -> f64 {
        if self.summary.received.mbits_per_sec > 0.0 {
            self.summary.received.mbits_per_sec
        } else {
            self.summary.sent.mbits_per_sec
        }
    }
}

/// A failed test together with whatever was measured before the failure
#[derive(Debug, Error)]
#[error("{error}")]
pub struct TestFailure {
    pub result: Box<IperfResult>,
    #[source]
    pub error: TnError,
}

/// Latency figures plus loss and jitter from one ping run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingStats {
    pub latency: LatencyMetrics,
    pub packet_loss_percent: f64,
    pub jitter_ms: f64,
    pub samples: usize,
}

fn next_test_id() -> String {
    format!("test_{}_{:06x}", Utc::now().timestamp_millis(), fastrand::u32(..0x0100_0000))
}

/// Accept an IP address or an RFC 1123 host name.
pub fn validate_host(field: &str, host: &str) -> Result<(), ValidationError> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if host.is_empty() || host.len() > 253 || !host.split('.').all(valid_label) {
        return Err(ValidationError::new(
            field,
            format!("'{}' is not a valid host", host.escape_debug()),
        ));
    }
    Ok(())
}

fn validate_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        return Err(ValidationError::new("port", "must be 1-65535"));
    }
    Ok(())
}

fn check_duration(duration: Duration, max: Duration) -> TnResult<()> {
    if duration > max {
        return Err(TnError::DurationTooLong {
            requested_secs: duration.as_secs(),
            max_secs: max.as_secs(),
        });
    }
    Ok(())
}

/// iperf3 sizes like `10M`, `512K`, `1G` or plain numbers.
fn validate_size(field: &str, value: &str) -> Result<(), ValidationError> {
    let digits = value.trim_end_matches(['K', 'M', 'G', 'k', 'm', 'g']);
    let numeric = !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        && digits.parse::<f64>().is_ok();
    if !numeric || value.len() - digits.len() > 1 {
        return Err(ValidationError::new(
            field,
            format!("'{}' is not a valid size", value.escape_debug()),
        ));
    }
    Ok(())
}

fn validate_test_config(config: &IperfTestConfig) -> TnResult<()> {
    validate_host("server", &config.server)?;
    validate_port(config.port)?;
    check_duration(config.duration, MAX_THROUGHPUT_DURATION)?;
    validate_client_options(config)
}

/// Check the stream options of a client run: protocol, parallel streams,
/// UDP rate and window size.
pub fn validate_client_options(config: &IperfTestConfig) -> TnResult<()> {
    if config.parallel < 1 || config.parallel > MAX_PARALLEL_STREAMS {
        return Err(TnError::validation(
            "parallel",
            format!("{} is outside 1-{}", config.parallel, MAX_PARALLEL_STREAMS),
        ));
    }
    if !config.protocol.eq_ignore_ascii_case("tcp") && !config.is_udp() {
        return Err(TnError::validation(
            "protocol",
            format!("'{}' is not tcp or udp", config.protocol.escape_debug()),
        ));
    }
    if let Some(bw) = &config.bandwidth {
        validate_size("bandwidth", bw)?;
    }
    if let Some(window) = &config.window_size {
        validate_size("windowSize", window)?;
    }
    Ok(())
}

/// Turn a failed tool run into a network or command error.
fn classify_failure(tool: &str, message: &str) -> TnError {
    match NetworkErrorKind::classify(message) {
        NetworkErrorKind::Other => TnError::command(format!("{} failed: {}", tool, message)),
        _ => TnError::network(format!("{} failed: {}", tool, message)),
    }
}

/// Fill `result` from iperf3 `-J` output. Returns the error string iperf3
/// reported, if any.
pub fn parse_json_output(output: &str, result: &mut IperfResult) -> Result<Option<String>, serde_json::Error> {
    let json: Value = serde_json::from_str(output)?;
    let f = |v: &Value, key: &str| v.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    let u = |v: &Value, key: &str| v.get(key).and_then(Value::as_u64).unwrap_or(0);

    if let Some(start) = json.get("start") {
        if let Some(connecting) = start.get("connecting_to") {
            result.server_info.host = connecting
                .get("host")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            result.server_info.port = u(connecting, "port") as u16;
        }
        if let Some(version) = start.get("version").and_then(Value::as_str) {
            result.server_info.version = version.to_string();
        }
    }

    if let Some(end) = json.get("end") {
        if let Some(sent) = end.get("sum_sent") {
            result.summary.sent = StreamSummary {
                bytes: u(sent, "bytes"),
                retransmits: u(sent, "retransmits"),
                ..StreamSummary::from_bits(f(sent, "bits_per_second"))
            };
        }
        if let Some(received) = end.get("sum_received") {
            result.summary.received = StreamSummary {
                bytes: u(received, "bytes"),
                ..StreamSummary::from_bits(f(received, "bits_per_second"))
            };
        }
        // UDP runs report a single `sum` with loss and jitter
        if let Some(sum) = end.get("sum") {
            result.summary.jitter_ms = f(sum, "jitter_ms");
            result.summary.lost_packets = u(sum, "lost_packets");
            result.summary.lost_percent = f(sum, "lost_percent");
            if result.summary.received.bits_per_sec == 0.0 {
                result.summary.received = StreamSummary {
                    bytes: u(sum, "bytes"),
                    ..StreamSummary::from_bits(f(sum, "bits_per_second"))
                };
            }
        }
        if let Some(cpu) = end.get("cpu_utilization_percent") {
            result.summary.cpu_util = CpuUtilization {
                host_total: f(cpu, "host_total"),
                host_user: f(cpu, "host_user"),
                host_system: f(cpu, "host_system"),
                remote_total: f(cpu, "remote_total"),
                remote_user: f(cpu, "remote_user"),
                remote_system: f(cpu, "remote_system"),
            };
        }
    }

    Ok(json.get("error").and_then(Value::as_str).map(str::to_string))
}

/// Fill `result` from iperf3 plain-text output (`sender`/`receiver` lines).
pub fn parse_text_output(output: &str, result: &mut IperfResult) {
    for line in output.lines().map(str::trim) {
        let is_sender = line.ends_with("sender");
        let is_receiver = line.ends_with("receiver");
        if is_sender || is_receiver {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let rate = parts.iter().position(|p| p.ends_with("bits/sec")).and_then(|i| {
                let value: f64 = parts.get(i.checked_sub(1)?)?.parse().ok()?;
                let scale = match parts[i].chars().next() {
                    Some('G') => 1_000_000_000.0,
                    Some('M') => 1_000_000.0,
                    Some('K') => 1_000.0,
                    _ => 1.0,
                };
                Some(value * scale)
            });
            if let Some(bits) = rate {
                if is_sender {
                    result.summary.sent = StreamSummary::from_bits(bits);
                } else {
                    result.summary.received = StreamSummary::from_bits(bits);
                }
            }
        }

        if let Some(rest) = line.strip_prefix("Connecting to host ") {
            let mut parts = rest.split(|c: char| c == ',' || c.is_whitespace()).filter(|p| !p.is_empty());
            if let Some(host) = parts.next() {
                result.server_info.host = host.to_string();
            }
            if let (Some("port"), Some(port)) = (parts.next(), parts.next()) {
                result.server_info.port = port.parse().unwrap_or_default();
            }
        }
    }
}

/// Parse `ping` output into latency statistics.
pub fn parse_ping_output(output: &str) -> PingStats {
    let rtts: Vec<f64> = output
        .lines()
        .filter_map(|line| line.split_once("time=").map(|(_, rest)| rest))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter_map(|value| value.parse::<f64>().ok())
        .collect();

    let packet_loss_percent = output
        .lines()
        .find(|l| l.contains("packet loss"))
        .and_then(|l| {
            l.split(',')
                .map(str::trim)
                .find(|part| part.ends_with("packet loss"))
                .and_then(|part| part.split('%').next())
                .and_then(|v| v.trim().parse::<f64>().ok())
        })
        .unwrap_or(if rtts.is_empty() { 100.0 } else { 0.0 });

    let mut stats = PingStats {
        packet_loss_percent,
        samples: rtts.len(),
        ..Default::default()
    };
    if rtts.is_empty() {
        return stats;
    }

    let n = rtts.len() as f64;
    let avg = rtts.iter().sum::<f64>() / n;
    let variance = rtts.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / n;
    let jitter = if rtts.len() > 1 {
        rtts.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };

    let mut sorted = rtts.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let percentile = |p: f64| {
        let rank = ((p / 100.0) * n).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    };

    stats.latency = LatencyMetrics {
        rtt_ms: avg,
        min_rtt_ms: sorted[0],
        max_rtt_ms: sorted[sorted.len() - 1],
        avg_rtt_ms: avg,
        std_dev_ms: variance.sqrt(),
        p50_ms: percentile(50.0),
        p95_ms: percentile(95.0),
        p99_ms: percentile(99.0),
        target_ms: 0.0,
    };
    stats.jitter_ms = jitter;
    stats
}

fn combined(output: &CommandOutput) -> String {
    if output.stderr.is_empty() {
        output.stdout.clone()
    } else {
        format!("{}\n{}", output.stdout, output.stderr)
    }
}

/// Manages iperf3 servers and runs client measurements
#[derive(Clone)]
pub struct PerfTestManager {
    executor: Arc<dyn CommandExecutor>,
    servers: Arc<Mutex<HashMap<u16, ServerEntry>>>,
    ports: KeyedLocks<u16>,
    targets: KeyedLocks<String>,
}

impl PerfTestManager {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            servers: Arc::new(Mutex::new(HashMap::new())),
            ports: KeyedLocks::new(),
            targets: KeyedLocks::new(),
        }
    }

    async fn port_has_listener(port: u16) -> bool {
        matches!(
            tokio::time::timeout(READINESS_POLL * 5, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }

    /// Start an iperf3 server on `port`.
    ///
    /// Only starts on the same port are serialized; the server table stays
    /// available to other callers while the process comes up.
    #[instrument(skip(self))]
    pub async fn start_server(&self, port: u16) -> TnResult<IperfServer> {
        validate_port(port)?;
        let _port = self.ports.lock(&port).await;
        if self.servers.lock().await.contains_key(&port) {
            return Err(TnError::Busy {
                resource: format!("port {} (iperf3 server already running)", port),
            });
        }
        if Self::port_has_listener(port).await {
            return Err(TnError::Busy {
                resource: format!("port {} (bound by another process)", port),
            });
        }

        let mut process = self.executor.spawn(&builder::iperf3_server(port)).await?;

        let deadline = Instant::now() + READINESS_TIMEOUT;
        let mut ready = false;
        while Instant::now() < deadline {
            if process.has_exited() {
                break;
            }
            if Self::port_has_listener(port).await {
                ready = true;
                break;
            }
            tokio::time::sleep(READINESS_POLL).await;
        }
        if !ready {
            if let Err(e) = process.kill().await {
                warn!("Failed to kill unready iperf3 server on port {}: {}", port, e);
            }
            return Err(TnError::command(format!(
                "iperf3 server on port {} did not start listening",
                port
            )));
        }

        let info = IperfServer {
            port,
            pid: process.id(),
            started: Utc::now(),
        };
        self.servers
            .lock()
            .await
            .insert(port, ServerEntry { info: info.clone(), process });
        info!("Started iperf3 server on port {}", port);
        Ok(info)
    }

    /// Stop the server on `port`.
    #[instrument(skip(self))]
    pub async fn stop_server(&self, port: u16) -> TnResult<()> {
        let entry = self.servers.lock().await.remove(&port);
        let mut entry = entry.ok_or(TnError::NoServerRunning { port })?;
        entry.process.kill().await?;
        info!("Stopped iperf3 server on port {}", port);
        Ok(())
    }

    /// Stop every server. The active set is empty afterwards even when some
    /// kills fail.
    pub async fn stop_all_servers(&self) -> TnResult<()> {
        let drained: Vec<(u16, ServerEntry)> = self.servers.lock().await.drain().collect();
        let mut failures = Vec::new();
        for (port, mut entry) in drained {
            if let Err(e) = entry.process.kill().await {
                failures.push(format!("port {}: {}", port, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            error!("Failed to stop some iperf3 servers: {:?}", failures);
            Err(TnError::command(format!("errors stopping servers: {}", failures.join("; "))))
        }
    }

    /// Running servers. Servers whose process has exited are dropped.
    pub async fn get_active_servers(&self) -> BTreeMap<u16, IperfServer> {
        let mut servers = self.servers.lock().await;
        servers.retain(|port, entry| {
            let alive = !entry.process.has_exited();
            if !alive {
                warn!("iperf3 server on port {} exited unexpectedly", port);
            }
            alive
        });
        servers.iter().map(|(port, e)| (*port, e.info.clone())).collect()
    }

    /// Run one iperf3 client test.
    #[instrument(skip(self, config), fields(server = %config.server, port = config.port))]
    pub async fn run_test(&self, config: &IperfTestConfig) -> Result<IperfResult, TestFailure> {
        let mut result = IperfResult::new(&config.protocol);
        let fail = |mut result: IperfResult, error: TnError| {
            result.error_messages.push(error.to_string());
            result.error_kind = error.network_kind();
            Err(TestFailure {
                result: Box::new(result),
                error,
            })
        };

        if let Err(e) = validate_test_config(config) {
            warn!("Rejected iperf3 test: {}", e);
            return fail(result, e);
        }

        let argv = builder::iperf3_client(&IperfClientArgs {
            server: config.server.clone(),
            port: config.port,
            duration: config.duration,
            udp: config.is_udp(),
            bandwidth: config.bandwidth.clone(),
            parallel: config.parallel,
            window_size: config.window_size.clone(),
            interval: config.interval,
            direction: config.direction,
        });

        let _target = self.targets.lock(&format!("{}:{}", config.server, config.port)).await;
        let started = Instant::now();
        let output = self.executor.run(&argv, config.duration + CLIENT_GRACE).await;
        result.duration_secs = started.elapsed().as_secs_f64();

        let output = match output {
            Ok(output) => output,
            Err(e) => return fail(result, e),
        };
        result.raw_output = combined(&output);

        let reported_error = match parse_json_output(&output.stdout, &mut result) {
            Ok(reported) => reported,
            Err(json_err) => {
                debug!("iperf3 output is not JSON ({}), falling back to text", json_err);
                parse_text_output(&output.stdout, &mut result);
                None
            }
        };

        if let Some(message) = reported_error.or_else(|| (!output.success()).then(|| output.diagnostic().to_string())) {
            return fail(result, classify_failure("iperf3", &message));
        }

        info!(
            "iperf3 test {} completed: {:.2} Mbps",
            result.test_id,
            result.goodput_mbps()
        );
        Ok(result)
    }

    /// Download, upload and bidirectional TCP runs against one server.
    /// Only the download run is required to succeed.
    pub async fn run_throughput_test(&self, server: &str, port: u16, duration: Duration) -> TnResult<ThroughputMetrics> {
        self.run_throughput_with(IperfTestConfig::tcp(server, port, duration)).await
    }

    /// Like [`run_throughput_test`](Self::run_throughput_test) with the
    /// stream options of `base` (protocol, parallel streams, interval, rate)
    /// applied to every direction.
    #[instrument(skip(self, base), fields(server = %base.server, port = base.port, protocol = %base.protocol))]
    pub async fn run_throughput_with(&self, base: IperfTestConfig) -> TnResult<ThroughputMetrics> {
        let server = base.server.clone();
        validate_host("server", &server)?;
        validate_port(base.port)?;
        check_duration(base.duration, MAX_THROUGHPUT_DURATION)?;
        validate_client_options(&base)?;

        let mut config = IperfTestConfig {
            direction: IperfDirection::Download,
            ..base
        };
        let download = self.run_test(&config).await.map_err(|f| f.error)?;

        config.direction = IperfDirection::Upload;
        let upload = match self.run_test(&config).await {
            Ok(r) => Some(r.goodput_mbps()),
            Err(f) => {
                warn!("Upload test to {} failed: {}", server, f.error);
                None
            }
        };

        config.direction = IperfDirection::Bidirectional;
        let bidir = match self.run_test(&config).await {
            Ok(r) => r.goodput_mbps(),
            Err(f) => {
                warn!("Bidirectional test to {} failed: {}", server, f.error);
                0.0
            }
        };

        let mut samples = vec![download.goodput_mbps()];
        samples.extend(upload);
        let n = samples.len() as f64;
        let avg = samples.iter().sum::<f64>() / n;
        let metrics = ThroughputMetrics {
            downlink_mbps: download.goodput_mbps(),
            uplink_mbps: upload.unwrap_or(0.0),
            bi_dir_mbps: bidir,
            peak_mbps: samples.iter().copied().fold(f64::MIN, f64::max),
            min_mbps: samples.iter().copied().fold(f64::MAX, f64::min),
            avg_mbps: avg,
            std_dev_mbps: (samples.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / n).sqrt(),
            ..Default::default()
        };
        info!(
            "Throughput to {}: DL={:.2} UL={:.2} avg={:.2} Mbps",
            server, metrics.downlink_mbps, metrics.uplink_mbps, metrics.avg_mbps
        );
        Ok(metrics)
    }

    /// Ping-based latency measurement. `port` is validated for symmetry with
    /// the throughput test but ICMP does not use it.
    pub async fn run_latency_test(&self, server: &str, port: u16, duration: Duration) -> TnResult<LatencyMetrics> {
        validate_port(port)?;
        Ok(self.run_ping(server, duration).await?.latency)
    }

    /// Ping `server` for roughly `duration` (at least 10 probes).
    #[instrument(skip(self))]
    pub async fn run_ping(&self, server: &str, duration: Duration) -> TnResult<PingStats> {
        validate_host("server", server)?;
        check_duration(duration, MAX_LATENCY_DURATION)?;

        let count = ((duration.as_secs_f64() / PING_INTERVAL.as_secs_f64()) as u32).max(10);
        let argv = builder::ping(server, count, Some(PING_INTERVAL), 2);
        let timeout = PING_INTERVAL * count + CLIENT_GRACE;
        let output = self.executor.run(&argv, timeout).await?;
        let stats = parse_ping_output(&output.stdout);

        if stats.samples == 0 {
            let message = if output.diagnostic().is_empty() {
                "100% packet loss, host unreachable".to_string()
            } else {
                output.diagnostic().to_string()
            };
            return Err(classify_failure("ping", &message));
        }
        debug!(
            "Ping {}: avg={:.2}ms loss={:.1}%",
            server, stats.latency.avg_rtt_ms, stats.packet_loss_percent
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPERF_JSON: &str = r#"{
        "start": {
            "connecting_to": {"host": "10.0.0.2", "port": 5201},
            "version": "iperf 3.9"
        },
        "end": {
            "sum_sent": {"bytes": 5712500, "bits_per_second": 4570000.0, "retransmits": 3},
            "sum_received": {"bytes": 5250000, "bits_per_second": 4200000.0},
            "cpu_utilization_percent": {
                "host_total": 1.5, "host_user": 0.5, "host_system": 1.0,
                "remote_total": 2.0, "remote_user": 1.0, "remote_system": 1.0
            }
        }
    }"#;

    #[test]
    fn test_parse_json_output() {
        let mut result = IperfResult::new("tcp");
        let reported = parse_json_output(IPERF_JSON, &mut result).unwrap();
        assert!(reported.is_none());
        assert_eq!(result.summary.sent.retransmits, 3);
        assert!((result.summary.received.mbits_per_sec - 4.2).abs() < 1e-9);
        assert_eq!(result.server_info.host, "10.0.0.2");
        assert_eq!(result.server_info.port, 5201);
        assert_eq!(result.server_info.version, "iperf 3.9");
        assert_eq!(result.summary.cpu_util.remote_total, 2.0);
    }

    #[test]
    fn test_json_error_field_is_reported() {
        let mut result = IperfResult::new("tcp");
        let reported = parse_json_output(
            r#"{"start": {}, "end": {}, "error": "unable to connect to server: Connection refused"}"#,
            &mut result,
        )
        .unwrap();
        let err = classify_failure("iperf3", &reported.unwrap());
        assert_eq!(err.network_kind(), Some(NetworkErrorKind::ConnectionRefused));
    }

    #[test]
    fn test_parse_text_output() {
        let text = "\
Connecting to host 10.0.0.2, port 5201
[  5] local 10.0.0.1 port 50000 connected to 10.0.0.2 port 5201
[ ID] Interval           Transfer     Bitrate         Retr
[  5]   0.00-10.00  sec  5.45 MBytes  4.57 Mbits/sec    0             sender
[  5]   0.00-10.04  sec  5.01 MBytes  4.20 Mbits/sec                  receiver
";
        let mut result = IperfResult::new("tcp");
        parse_text_output(text, &mut result);
        assert!((result.summary.sent.mbits_per_sec - 4.57).abs() < 1e-9);
        assert!((result.summary.received.mbits_per_sec - 4.2).abs() < 1e-9);
        assert_eq!(result.server_info.host, "10.0.0.2");
        assert_eq!(result.server_info.port, 5201);
    }

    #[test]
    fn test_parse_ping_output() {
        let text = "\
PING 10.0.0.2 (10.0.0.2) 56(84) bytes of data.
64 bytes from 10.0.0.2: icmp_seq=1 ttl=64 time=16.0 ms
64 bytes from 10.0.0.2: icmp_seq=2 ttl=64 time=18.0 ms
64 bytes from 10.0.0.2: icmp_seq=3 ttl=64 time=17.0 ms
64 bytes from 10.0.0.2: icmp_seq=4 ttl=64 time=17.0 ms

--- 10.0.0.2 ping statistics ---
5 packets transmitted, 4 received, 20% packet loss, time 4005ms
";
        let stats = parse_ping_output(text);
        assert_eq!(stats.samples, 4);
        assert_eq!(stats.packet_loss_percent, 20.0);
        assert_eq!(stats.latency.avg_rtt_ms, 17.0);
        assert_eq!(stats.latency.min_rtt_ms, 16.0);
        assert_eq!(stats.latency.max_rtt_ms, 18.0);
        assert_eq!(stats.latency.p50_ms, 17.0);
        assert_eq!(stats.latency.p99_ms, 18.0);
        assert!((stats.latency.std_dev_ms - 0.5f64.sqrt()).abs() < 1e-9);
        // |18-16| + |17-18| + |17-17| over 3 gaps
        assert!((stats.jitter_ms - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_host() {
        assert!(validate_host("server", "10.0.0.2").is_ok());
        assert!(validate_host("server", "::1").is_ok());
        assert!(validate_host("server", "edge01.cluster.local").is_ok());
        assert!(validate_host("server", "10.0.0.2; rm -rf /").is_err());
        assert!(validate_host("server", "$(reboot)").is_err());
        assert!(validate_host("server", "").is_err());
    }

    #[test]
    fn test_validate_size() {
        assert!(validate_size("bandwidth", "10M").is_ok());
        assert!(validate_size("bandwidth", "1.5G").is_ok());
        assert!(validate_size("bandwidth", "100").is_ok());
        assert!(validate_size("bandwidth", "10MM").is_err());
        assert!(validate_size("bandwidth", "10M;ls").is_err());
    }
}
