//! Traffic control manager behaviour against a scripted executor.

use std::sync::Arc;
use std::time::Duration;

use tn_agent::commands::FakeExecutor;
use tn_agent::op_metrics::OpRecorder;
use tn_agent::tc::TrafficControlManager;
use tn_shared::{BandwidthPolicy, Filter, TnError};

fn manager() -> (FakeExecutor, TrafficControlManager) {
    let fake = FakeExecutor::new();
    let manager =
        TrafficControlManager::new(Arc::new(fake.clone()), OpRecorder::new(), Duration::from_secs(5));
    (fake, manager)
}

fn embb_policy() -> BandwidthPolicy {
    BandwidthPolicy {
        downlink_mbps: 4.57,
        uplink_mbps: 4.57,
        latency_ms: 16.1,
        jitter_ms: 2.0,
        loss_percent: 0.1,
        priority: 2,
        queue_class: "htb".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_apply_installs_root_class_netem_and_filter() {
    let (fake, manager) = manager();
    manager.apply_rules("eth0", &embb_policy()).await.unwrap();

    let calls = fake.calls();
    assert_eq!(calls[0], "tc qdisc del dev eth0 root");
    assert_eq!(calls[1], "tc qdisc del dev eth0 ingress");
    assert_eq!(calls[2], "tc qdisc add dev eth0 root handle 1: htb default 30");
    assert!(calls[3].starts_with("tc class add dev eth0 parent 1: classid 1:10 htb rate 4570kbit ceil 4570kbit burst "));
    assert!(calls[3].ends_with("prio 2"));
    assert_eq!(
        calls[4],
        "tc qdisc add dev eth0 parent 1:10 handle 100: netem delay 16.1ms 2ms 25% loss 0.1%"
    );
    assert!(calls[5].starts_with("tc filter add dev eth0 protocol ip parent 1:0"));
    assert_eq!(calls[6], "tc qdisc add dev eth0 handle ffff: ingress");
    assert!(calls[7].starts_with(
        "tc filter add dev eth0 parent ffff: protocol all prio 1 u32 match u32 0 0 police rate 4570kbit burst "
    ));
    assert_eq!(calls.len(), 8);

    let applied = manager.applied_rules("eth0").unwrap();
    assert!(applied.shaping);
    assert_eq!(applied.policy, embb_policy());
}

#[tokio::test]
async fn test_reapply_clears_before_installing() {
    let (fake, manager) = manager();
    manager.apply_rules("eth0", &embb_policy()).await.unwrap();
    fake.clear_calls();

    let urllc = BandwidthPolicy {
        downlink_mbps: 0.93,
        uplink_mbps: 0.93,
        latency_ms: 6.3,
        jitter_ms: 0.0,
        loss_percent: 0.0,
        ..embb_policy()
    };
    manager.apply_rules("eth0", &urllc).await.unwrap();

    let calls = fake.calls();
    assert_eq!(calls[0], "tc qdisc del dev eth0 root");
    assert_eq!(fake.calls_matching("tc qdisc add dev eth0 root").len(), 1);
    assert!(calls.iter().any(|c| c.contains("rate 930kbit")));
    assert!(!calls.iter().any(|c| c.contains("4570kbit")));
    assert_eq!(manager.applied_rules("eth0").unwrap().policy, urllc);
}

#[tokio::test]
async fn test_invalid_policy_leaves_existing_rules() {
    let (fake, manager) = manager();
    manager.apply_rules("eth0", &embb_policy()).await.unwrap();
    fake.clear_calls();

    let invalid = [
        BandwidthPolicy {
            downlink_mbps: -1.0,
            ..embb_policy()
        },
        BandwidthPolicy {
            latency_ms: f64::NAN,
            ..embb_policy()
        },
        BandwidthPolicy {
            loss_percent: 150.0,
            ..embb_policy()
        },
        BandwidthPolicy {
            priority: 8,
            ..embb_policy()
        },
        BandwidthPolicy {
            filters: vec![Filter {
                protocol: "sctp".to_string(),
                ..Default::default()
            }],
            ..embb_policy()
        },
        BandwidthPolicy {
            filters: vec![Filter {
                protocol: "tcp".to_string(),
                dst_ip: "10.0.0.300".to_string(),
                ..Default::default()
            }],
            ..embb_policy()
        },
        BandwidthPolicy {
            burst: "lots".to_string(),
            ..embb_policy()
        },
    ];
    for policy in &invalid {
        let err = manager.apply_rules("eth0", policy).await.unwrap_err();
        assert!(matches!(err, TnError::Validation(_)), "{:?}", err);
    }

    assert!(fake.calls().is_empty());
    assert_eq!(manager.applied_rules("eth0").unwrap().policy, embb_policy());
}

#[tokio::test]
async fn test_malicious_interface_name_is_rejected() {
    let (fake, manager) = manager();
    for name in ["eth0; reboot", "../eth0", "eth0\0", "a-very-long-interface-name"] {
        assert!(manager.apply_rules(name, &embb_policy()).await.is_err());
        assert!(manager.clear_rules(name).await.is_err());
    }
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn test_uplink_is_policed_separately_from_downlink() {
    let (fake, manager) = manager();
    let asymmetric = BandwidthPolicy {
        downlink_mbps: 10.0,
        uplink_mbps: 2.0,
        ..embb_policy()
    };
    manager.apply_rules("eth0", &asymmetric).await.unwrap();
    assert_eq!(fake.calls_matching("tc class add dev eth0").len(), 1);
    assert!(fake.calls_matching("tc class add dev eth0")[0].contains("rate 10000kbit"));
    let policers = fake.calls_matching("tc filter add dev eth0 parent ffff:");
    assert_eq!(policers.len(), 1);
    assert!(policers[0].contains("police rate 2000kbit"));
    assert!(policers[0].ends_with("drop flowid :1"));

    // No uplink rate: egress shaping only
    fake.clear_calls();
    let downlink_only = BandwidthPolicy {
        uplink_mbps: 0.0,
        ..embb_policy()
    };
    manager.apply_rules("eth0", &downlink_only).await.unwrap();
    assert!(fake.calls_matching("tc qdisc add dev eth0 handle ffff:").is_empty());
    assert!(fake.calls_matching("tc filter add dev eth0 parent ffff:").is_empty());
}

#[tokio::test]
async fn test_oversized_burst_is_rejected() {
    let (fake, manager) = manager();
    for burst in ["18446744073709551615m", "99999999999999999999", "5000mb"] {
        let policy = BandwidthPolicy {
            burst: burst.to_string(),
            ..embb_policy()
        };
        let err = manager.apply_rules("eth0", &policy).await.unwrap_err();
        assert!(matches!(err, TnError::Validation(_)), "{}: {:?}", burst, err);
    }
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn test_best_effort_installs_rules_without_shaping() {
    let (fake, manager) = manager();
    let policy = BandwidthPolicy {
        queue_class: "best-effort".to_string(),
        ..embb_policy()
    };
    manager.apply_rules("eth1", &policy).await.unwrap();
    assert!(fake.calls_matching("tc class add").is_empty());
    assert!(fake.calls_matching("tc qdisc add dev eth1 parent").is_empty());
    assert!(fake.calls_matching("tc qdisc add dev eth1 handle ffff: ingress").is_empty());
    assert!(!manager.applied_rules("eth1").unwrap().shaping);

    fake.respond("tc qdisc show dev eth1", "qdisc htb 1: root refcnt 2 r2q 10 default 0x30");
    fake.respond("tc class show dev eth1", "");
    let status = manager.get_status("eth1").await.unwrap();
    assert!(status.rules_active);
    assert!(!status.shaping_active);
}

#[tokio::test]
async fn test_status_reports_shaping_and_queue_stats() {
    let (fake, manager) = manager();
    fake.respond("tc qdisc show dev eth0", "qdisc htb 1: root refcnt 2 r2q 10 default 0x30");
    fake.respond(
        "tc class show dev eth0",
        "class htb 1:10 root leaf 100: prio 2 rate 4570Kbit ceil 4570Kbit burst 15Kb cburst 1599b",
    );
    fake.respond(
        "tc -s qdisc show dev eth0",
        "qdisc htb 1: root refcnt 2 r2q 10 default 0x30 direct_packets_stat 0\n Sent 123456 bytes 789 pkt (dropped 3, overlimits 12 requeues 0)\n backlog 0b 0p requeues 0\n",
    );

    let status = manager.get_status("eth0").await.unwrap();
    assert!(status.rules_active);
    assert!(status.shaping_active);
    assert_eq!(status.queue_stats.get("sent_bytes"), Some(&123456));
    assert_eq!(status.queue_stats.get("dropped"), Some(&3));
    assert_eq!(status.interfaces, vec!["eth0".to_string()]);
}

#[tokio::test]
async fn test_clear_tolerates_missing_qdisc() {
    let (fake, manager) = manager();
    fake.fail(
        "tc qdisc del dev eth2 root",
        2,
        "Error: Cannot delete qdisc with handle of zero.",
    );
    manager.clear_rules("eth2").await.unwrap();

    fake.fail("tc qdisc del dev eth3 root", 2, "RTNETLINK answers: Operation not permitted");
    let err = manager.clear_rules("eth3").await.unwrap_err();
    assert!(matches!(err, TnError::Command { .. }));
}

#[tokio::test]
async fn test_failed_install_is_rolled_back() {
    let (fake, manager) = manager();
    fake.fail("tc qdisc add dev eth0 parent", 2, "Error: Specified qdisc kind is unknown.");

    let err = manager.apply_rules("eth0", &embb_policy()).await.unwrap_err();
    assert!(matches!(err, TnError::Command { .. }));
    assert!(manager.applied_rules("eth0").is_none());
    // One clear before installing and one during rollback
    assert_eq!(fake.calls_matching("tc qdisc del dev eth0 root").len(), 2);

    let metrics = manager.get_metrics();
    assert_eq!(metrics.failed_operations, 1);
}

#[tokio::test]
async fn test_filters_map_to_u32_matches() {
    let (fake, manager) = manager();
    let policy = BandwidthPolicy {
        filters: vec![Filter {
            protocol: "udp".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            dst_port: 2152,
            class_id: "1:10".to_string(),
            priority: 5,
            ..Default::default()
        }],
        ..embb_policy()
    };
    manager.apply_rules("eth0", &policy).await.unwrap();
    assert_eq!(
        fake.calls_matching("tc filter add dev eth0 protocol ip "),
        vec![
            "tc filter add dev eth0 protocol ip parent 1:0 prio 5 u32 match ip protocol 17 0xff match ip dst 10.0.0.2/32 match ip dport 2152 0xffff flowid 1:10"
                .to_string()
        ]
    );
}

#[tokio::test]
async fn test_clear_all_removes_every_interface() {
    let (_fake, manager) = manager();
    manager.apply_rules("eth0", &embb_policy()).await.unwrap();
    manager.apply_rules("eth1", &embb_policy()).await.unwrap();
    assert_eq!(manager.interfaces(), vec!["eth0".to_string(), "eth1".to_string()]);

    manager.clear_all().await;
    assert!(manager.interfaces().is_empty());
}
