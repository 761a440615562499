//! In-process TN agents served over real HTTP on loopback.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tn_agent::commands::FakeExecutor;
use tn_agent::{AgentOptions, TnAgent};
use tn_manager::ManagerOptions;
use tn_shared::retry::RetryPolicy;
use tn_shared::{BandwidthPolicy, TnConfig, VxlanConfig};

const PROC_NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0
vxlan100:  5000      50    0    0    0     0          0         0     4000      40    0    0    0     0       0          0
";

pub const PING_OK: &str = "\
PING 10.0.0.254 (10.0.0.254) 56(84) bytes of data.
64 bytes from 10.0.0.254: icmp_seq=1 ttl=64 time=16.0 ms
64 bytes from 10.0.0.254: icmp_seq=2 ttl=64 time=17.0 ms
64 bytes from 10.0.0.254: icmp_seq=3 ttl=64 time=18.0 ms

--- 10.0.0.254 ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 402ms
rtt min/avg/max/mdev = 16.000/17.000/18.000/0.816 ms
";

/// iperf3 JSON report with the given received rate.
pub fn iperf_report(received_bps: f64) -> String {
    format!(
        r#"{{
    "start": {{"connecting_to": {{"host": "10.0.0.254", "port": 5201}}, "version": "iperf 3.12"}},
    "end": {{
        "sum_sent": {{"bytes": 5712500, "bits_per_second": {sent}, "retransmits": 0}},
        "sum_received": {{"bytes": 5250000, "bits_per_second": {received}}},
        "cpu_utilization_percent": {{"host_total": 1.0, "host_user": 0.5, "host_system": 0.5,
                                     "remote_total": 1.0, "remote_user": 0.5, "remote_system": 0.5}}
    }}
}}"#,
        sent = received_bps,
        received = received_bps
    )
}

pub struct TestAgent {
    pub name: String,
    pub cluster_ip: String,
    pub endpoint: String,
    pub fake: FakeExecutor,
    pub agent: Arc<TnAgent>,
    shutdown: CancellationToken,
    server: Option<JoinHandle<anyhow::Result<()>>>,
    _proc: NamedTempFile,
}

impl TestAgent {
    /// Stop serving HTTP; the endpoint refuses connections afterwards.
    pub async fn stop_server(&mut self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
        }
    }

    pub async fn shutdown(mut self) {
        self.stop_server().await;
        self.agent.stop().await;
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn agent_config(name: &str, cluster_ip: &str) -> TnConfig {
    // iperf3 servers use the three ports above the monitoring port
    let iperf_port = loop {
        let port = free_port();
        if port > 1024 && port < 65_000 {
            break port;
        }
    };
    TnConfig {
        cluster_name: name.to_string(),
        network_cidr: "10.1.0.0/16".to_string(),
        vxlan: VxlanConfig {
            vni: 100,
            remote_ips: vec!["10.0.0.254".to_string()],
            local_ip: cluster_ip.to_string(),
            ..Default::default()
        },
        bandwidth_policy: BandwidthPolicy {
            downlink_mbps: 4.57,
            uplink_mbps: 4.57,
            latency_ms: 16.1,
            priority: 2,
            queue_class: "htb".to_string(),
            ..Default::default()
        },
        qos_class: "eMBB".to_string(),
        interfaces: vec![],
        monitoring_port: iperf_port - 1,
    }
}

/// Agent measuring `throughput_bps` and a 17 ms RTT, served on a random
/// loopback port. `start` controls whether the agent reports healthy.
pub async fn spawn_agent(name: &str, cluster_ip: &str, throughput_bps: f64, start: bool) -> TestAgent {
    let fake = FakeExecutor::new();
    fake.respond(
        "ip link show",
        "7: vxlan100: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc htb state UP mode DEFAULT",
    );
    fake.respond("tc qdisc show", "qdisc htb 1: root refcnt 2 r2q 10 default 0x30");
    fake.respond(
        "tc class show",
        "class htb 1:10 root leaf 100: prio 2 rate 4570Kbit ceil 4570Kbit burst 15Kb cburst 1599b",
    );
    fake.respond("iperf3 -c", &iperf_report(throughput_bps));
    fake.respond("ping", PING_OK);

    let mut proc = NamedTempFile::new().unwrap();
    proc.write_all(PROC_NET_DEV.as_bytes()).unwrap();
    let options = AgentOptions {
        proc_net_dev: Some(proc.path().to_path_buf()),
        ..Default::default()
    };
    let agent = Arc::new(TnAgent::with_executor(
        agent_config(name, cluster_ip),
        options,
        Arc::new(fake.clone()),
    ));
    if start {
        agent.start().await.unwrap();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(tn_agent::http::serve_listener(
        listener,
        agent.clone(),
        shutdown.clone(),
    ));

    TestAgent {
        name: name.to_string(),
        cluster_ip: cluster_ip.to_string(),
        endpoint: format!("http://127.0.0.1:{}", port),
        fake,
        agent,
        shutdown,
        server: Some(server),
        _proc: proc,
    }
}

/// Options with short timeouts, no read retries and no post-placement test.
pub fn test_options() -> ManagerOptions {
    ManagerOptions {
        request_timeout: Duration::from_secs(5),
        cluster_timeout: Duration::from_secs(10),
        validation_test: None,
        read_retry: RetryPolicy::none(),
        ..Default::default()
    }
}
