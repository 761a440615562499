//! Performance test manager: server lifecycle and client measurements.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use tn_agent::commands::FakeExecutor;
use tn_agent::iperf::{IperfTestConfig, PerfTestManager};
use tn_shared::{NetworkErrorKind, TnError};

fn manager() -> (FakeExecutor, PerfTestManager) {
    let fake = FakeExecutor::new();
    let manager = PerfTestManager::new(Arc::new(fake.clone()));
    (fake, manager)
}

/// A port that was free a moment ago.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn port_is_listening(port: u16) -> bool {
    std::net::TcpStream::connect(("127.0.0.1", port)).is_ok()
}

const IPERF_OK: &str = r#"{
    "start": {"connecting_to": {"host": "10.0.0.2", "port": 5201}, "version": "iperf 3.12"},
    "end": {
        "sum_sent": {"bytes": 5712500, "bits_per_second": 4570000.0, "retransmits": 0},
        "sum_received": {"bytes": 5250000, "bits_per_second": 4200000.0},
        "cpu_utilization_percent": {"host_total": 1.0, "host_user": 0.5, "host_system": 0.5,
                                    "remote_total": 1.0, "remote_user": 0.5, "remote_system": 0.5}
    }
}"#;

const PING_OK: &str = "\
PING 10.0.0.2 (10.0.0.2) 56(84) bytes of data.
64 bytes from 10.0.0.2: icmp_seq=1 ttl=64 time=16.0 ms
64 bytes from 10.0.0.2: icmp_seq=2 ttl=64 time=17.0 ms
64 bytes from 10.0.0.2: icmp_seq=3 ttl=64 time=18.0 ms

--- 10.0.0.2 ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 402ms
rtt min/avg/max/mdev = 16.000/17.000/18.000/0.816 ms
";

#[tokio::test]
async fn test_start_twice_on_same_port_is_busy() {
    let (_fake, manager) = manager();
    let port = free_port();

    manager.start_server(port).await.unwrap();
    let err = manager.start_server(port).await.unwrap_err();
    assert!(matches!(err, TnError::Busy { .. }));
    assert_eq!(manager.get_active_servers().await.len(), 1);

    manager.stop_all_servers().await.unwrap();
}

#[tokio::test]
async fn test_foreign_listener_is_busy() {
    let (fake, manager) = manager();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let err = manager.start_server(port).await.unwrap_err();
    assert!(matches!(err, TnError::Busy { .. }));
    assert!(fake.calls_matching("iperf3 -s").is_empty());
}

#[tokio::test]
async fn test_stop_all_leaves_no_servers_or_listeners() {
    let (_fake, manager) = manager();
    let mut ports = Vec::new();
    for _ in 0..3 {
        let port = free_port();
        manager.start_server(port).await.unwrap();
        ports.push(port);
    }
    assert_eq!(manager.get_active_servers().await.len(), 3);
    for port in &ports {
        assert!(port_is_listening(*port));
    }

    manager.stop_all_servers().await.unwrap();

    assert!(manager.get_active_servers().await.is_empty());
    for port in &ports {
        assert!(!port_is_listening(*port), "port {} still listening", port);
    }
}

#[tokio::test]
async fn test_stop_without_server_is_distinct_error() {
    let (_fake, manager) = manager();
    let err = manager.stop_server(5999).await.unwrap_err();
    assert!(matches!(err, TnError::NoServerRunning { port: 5999 }));
}

#[tokio::test]
async fn test_concurrent_start_stop_stays_consistent() {
    let (_fake, manager) = manager();
    let ports: Vec<u16> = (0..6).map(|_| free_port()).collect();

    let starts = ports.iter().map(|port| {
        let manager = manager.clone();
        let port = *port;
        tokio::spawn(async move { manager.start_server(port).await })
    });
    let started: Vec<u16> = futures_util::future::join_all(starts)
        .await
        .into_iter()
        .filter_map(|r| r.ok().and_then(|r| r.ok()).map(|s| s.port))
        .collect();
    assert_eq!(
        manager.get_active_servers().await.len(),
        started.len()
    );

    let stops = started.iter().step_by(2).map(|port| {
        let manager = manager.clone();
        let port = *port;
        tokio::spawn(async move { manager.stop_server(port).await })
    });
    for handle in stops {
        handle.await.unwrap().unwrap();
    }

    let active = manager.get_active_servers().await;
    for (i, port) in started.iter().enumerate() {
        assert_eq!(active.contains_key(port), i % 2 == 1);
        assert_eq!(port_is_listening(*port), i % 2 == 1);
    }
    manager.stop_all_servers().await.unwrap();
}

#[tokio::test]
async fn test_slow_server_start_does_not_block_other_ports() {
    let (fake, manager) = manager();
    let slow_port = free_port();
    let fast_port = free_port();
    fake.spawn_silent(&format!("iperf3 -s -p {}", slow_port));

    let slow = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start_server(slow_port).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The slow start is still polling for readiness
    let listed = tokio::time::timeout(Duration::from_millis(500), manager.get_active_servers())
        .await
        .unwrap();
    assert!(listed.is_empty());
    let fast = tokio::time::timeout(Duration::from_secs(2), manager.start_server(fast_port))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fast.port, fast_port);
    assert!(!slow.is_finished());

    assert!(slow.await.unwrap().is_err());
    let active = manager.get_active_servers().await;
    assert_eq!(active.keys().copied().collect::<Vec<_>>(), vec![fast_port]);
    manager.stop_all_servers().await.unwrap();
}

#[tokio::test]
async fn test_spawn_failure_leaves_no_entry() {
    let (fake, manager) = manager();
    fake.fail_spawn("iperf3 -s");
    let port = free_port();
    assert!(manager.start_server(port).await.is_err());
    assert!(manager.get_active_servers().await.is_empty());
}

#[tokio::test]
async fn test_too_long_durations_spawn_nothing() {
    let (fake, manager) = manager();

    let config = IperfTestConfig::tcp("10.0.0.2", 5201, Duration::from_secs(7200));
    let failure = manager.run_test(&config).await.unwrap_err();
    assert!(matches!(failure.error, TnError::DurationTooLong { requested_secs: 7200, max_secs: 3600 }));
    assert!(!failure.result.error_messages.is_empty());

    let err = manager
        .run_throughput_test("10.0.0.2", 5201, Duration::from_secs(3601))
        .await
        .unwrap_err();
    assert!(matches!(err, TnError::DurationTooLong { .. }));

    let err = manager
        .run_latency_test("10.0.0.2", 5201, Duration::from_secs(601))
        .await
        .unwrap_err();
    assert!(matches!(err, TnError::DurationTooLong { max_secs: 600, .. }));

    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn test_rejected_inputs_still_return_a_result() {
    let (fake, manager) = manager();
    let cases = [
        IperfTestConfig::tcp("10.0.0.2; rm -rf /", 5201, Duration::from_secs(5)),
        IperfTestConfig::tcp("$(curl evil)", 5201, Duration::from_secs(5)),
        IperfTestConfig::tcp("10.0.0.2", 0, Duration::from_secs(5)),
        IperfTestConfig {
            parallel: 0,
            ..IperfTestConfig::tcp("10.0.0.2", 5201, Duration::from_secs(5))
        },
        IperfTestConfig {
            protocol: "sctp".to_string(),
            ..IperfTestConfig::tcp("10.0.0.2", 5201, Duration::from_secs(5))
        },
    ];
    for config in &cases {
        let failure = manager.run_test(config).await.unwrap_err();
        assert!(matches!(failure.error, TnError::Validation(_)), "{:?}", failure.error);
        assert_eq!(failure.result.error_messages.len(), 1);
        assert!(failure.result.error_kind.is_none());
    }
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn test_successful_run_parses_json() {
    let (fake, manager) = manager();
    fake.respond("iperf3 -c 10.0.0.2", IPERF_OK);

    let config = IperfTestConfig::tcp("10.0.0.2", 5201, Duration::from_secs(5));
    let result = manager.run_test(&config).await.unwrap();
    assert!((result.goodput_mbps() - 4.2).abs() < 1e-9);
    assert_eq!(result.server_info.version, "iperf 3.12");
    assert!(result.error_messages.is_empty());
    assert_eq!(
        fake.calls(),
        vec!["iperf3 -c 10.0.0.2 -p 5201 -t 5 -J".to_string()]
    );
}

#[tokio::test]
async fn test_network_failures_are_classified() {
    let (fake, manager) = manager();
    fake.fail(
        "iperf3 -c 10.0.0.9",
        1,
        "iperf3: error - unable to connect to server: Connection refused",
    );
    fake.fail(
        "iperf3 -c nowhere.invalid",
        1,
        "iperf3: error - unable to resolve host: Name or service not known",
    );

    let failure = manager
        .run_test(&IperfTestConfig::tcp("10.0.0.9", 5201, Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        failure.error,
        TnError::Network { kind: NetworkErrorKind::ConnectionRefused, .. }
    ));
    assert_eq!(failure.result.error_kind, Some(NetworkErrorKind::ConnectionRefused));

    let failure = manager
        .run_test(&IperfTestConfig::tcp("nowhere.invalid", 5201, Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert_eq!(failure.result.error_kind, Some(NetworkErrorKind::Dns));
}

#[tokio::test]
async fn test_unreachable_host_completes_with_classified_error() {
    let (fake, manager) = manager();
    fake.fail(
        "ping",
        1,
        "From 10.0.0.1 icmp_seq=1 Destination Host Unreachable\n\
         --- 10.0.0.250 ping statistics ---\n\
         10 packets transmitted, 0 received, +10 errors, 100% packet loss, time 1800ms",
    );

    let err = manager
        .run_ping("10.0.0.250", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TnError::Network { kind: NetworkErrorKind::Unreachable, .. }
    ));
}

#[tokio::test]
async fn test_silent_host_is_unreachable() {
    let (fake, manager) = manager();
    // No replies and nothing on stderr, only the summary on stdout
    fake.fail_with_output(
        "ping",
        1,
        "PING 10.0.0.251 (10.0.0.251) 56(84) bytes of data.\n\n\
         --- 10.0.0.251 ping statistics ---\n\
         10 packets transmitted, 0 received, 100% packet loss, time 1843ms\n",
    );

    let err = manager
        .run_ping("10.0.0.251", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TnError::Network { kind: NetworkErrorKind::Unreachable, .. }),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn test_wrapped_connect_failures_keep_their_cause() {
    let (fake, manager) = manager();
    fake.fail(
        "iperf3 -c 10.0.0.250",
        1,
        "iperf3: error - unable to connect to server: Connection timed out",
    );
    fake.fail(
        "iperf3 -c 10.0.0.251",
        1,
        "iperf3: error - unable to connect to server: No route to host",
    );

    let timed_out = manager
        .run_test(&IperfTestConfig::tcp("10.0.0.250", 5201, Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert_eq!(timed_out.result.error_kind, Some(NetworkErrorKind::Timeout));

    let no_route = manager
        .run_test(&IperfTestConfig::tcp("10.0.0.251", 5201, Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert_eq!(no_route.result.error_kind, Some(NetworkErrorKind::Unreachable));
}

#[tokio::test]
async fn test_hung_client_is_cut_off() {
    let (fake, manager) = manager();
    // iperf3 never returns; the client timeout is duration plus a fixed grace
    fake.delay("iperf3 -c", Duration::from_secs(3600));

    let started = std::time::Instant::now();
    let failure = manager
        .run_test(&IperfTestConfig::tcp("10.0.0.250", 5201, Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, TnError::Timeout { .. }));
    assert_eq!(failure.result.error_kind, Some(NetworkErrorKind::Timeout));
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test]
async fn test_throughput_runs_all_directions() {
    let (fake, manager) = manager();
    fake.respond("iperf3 -c 10.0.0.2", IPERF_OK);

    let metrics = manager
        .run_throughput_test("10.0.0.2", 5201, Duration::from_secs(2))
        .await
        .unwrap();
    assert!((metrics.downlink_mbps - 4.2).abs() < 1e-9);
    assert!((metrics.uplink_mbps - 4.2).abs() < 1e-9);
    assert!((metrics.avg_mbps - 4.2).abs() < 1e-9);

    let calls = fake.calls_matching("iperf3 -c");
    assert_eq!(calls.len(), 3);
    assert!(calls[1].contains(" -R "));
    assert!(calls[2].contains(" --bidir "));
}

#[tokio::test]
async fn test_latency_from_ping() {
    let (fake, manager) = manager();
    fake.respond("ping", PING_OK);

    let stats = manager.run_ping("10.0.0.2", Duration::from_secs(2)).await.unwrap();
    assert_eq!(stats.samples, 3);
    assert!((stats.latency.avg_rtt_ms - 17.0).abs() < 1e-9);
    assert!((stats.latency.min_rtt_ms - 16.0).abs() < 1e-9);
    assert!((stats.latency.max_rtt_ms - 18.0).abs() < 1e-9);
    assert_eq!(stats.packet_loss_percent, 0.0);

    // Ten probes minimum, 200 ms apart
    assert_eq!(
        fake.calls(),
        vec!["ping -c 10 -i 0.2 -W 2 10.0.0.2".to_string()]
    );
}
