//! Argument builders for `ip`, `bridge`, `tc`, `iperf3` and `ping`.
//!
//! Every function returns a complete argv. Identifiers and addresses are
//! expected to be validated by the caller; the builders only assemble.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use tn_shared::Filter;

/// Accumulates a program and its arguments
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    /// Append `args` only when `condition` holds.
    pub fn args_if<I, S>(self, condition: bool, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        if condition { self.args(args) } else { self }
    }

    pub fn into_argv(self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program);
        argv.extend(self.args);
        argv
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Queueing disciplines installed by the shaping manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QdiscKind {
    Htb,
    Netem,
}

impl fmt::Display for QdiscKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QdiscKind::Htb => write!(f, "htb"),
            QdiscKind::Netem => write!(f, "netem"),
        }
    }
}

// ---- ip / bridge ----

pub fn ip_link_add_vxlan(
    device: &str,
    vni: u32,
    port: u16,
    local: IpAddr,
    physical: Option<&str>,
    learning: bool,
) -> Vec<String> {
    CommandLine::new("ip")
        .args(["link", "add", device, "type", "vxlan"])
        .args(["id".to_string(), vni.to_string()])
        .args(["dstport".to_string(), port.to_string()])
        .args(["local".to_string(), local.to_string()])
        .args_if(physical.is_some(), ["dev", physical.unwrap_or_default()])
        .arg(if learning { "learning" } else { "nolearning" })
        .into_argv()
}

pub fn ip_link_set_mtu(device: &str, mtu: u32) -> Vec<String> {
    CommandLine::new("ip")
        .args(["link", "set", "dev", device, "mtu"])
        .arg(mtu)
        .into_argv()
}

pub fn ip_link_set_up(device: &str) -> Vec<String> {
    CommandLine::new("ip")
        .args(["link", "set", "dev", device, "up"])
        .into_argv()
}

pub fn ip_link_delete(device: &str) -> Vec<String> {
    CommandLine::new("ip")
        .args(["link", "delete", device])
        .into_argv()
}

pub fn ip_link_show(device: &str) -> Vec<String> {
    CommandLine::new("ip")
        .args(["link", "show", device])
        .into_argv()
}

pub fn ip_link_stats(device: &str) -> Vec<String> {
    CommandLine::new("ip")
        .args(["-s", "link", "show", device])
        .into_argv()
}

const FDB_ALL_ZEROS: &str = "00:00:00:00:00:00";

pub fn bridge_fdb_append(device: &str, remote: IpAddr) -> Vec<String> {
    CommandLine::new("bridge")
        .args(["fdb", "append", FDB_ALL_ZEROS, "dev", device, "dst"])
        .arg(remote)
        .into_argv()
}

pub fn bridge_fdb_del(device: &str, remote: IpAddr) -> Vec<String> {
    CommandLine::new("bridge")
        .args(["fdb", "del", FDB_ALL_ZEROS, "dev", device, "dst"])
        .arg(remote)
        .into_argv()
}

// ---- tc ----

pub fn tc_qdisc_del_root(device: &str) -> Vec<String> {
    CommandLine::new("tc")
        .args(["qdisc", "del", "dev", device, "root"])
        .into_argv()
}

pub fn tc_qdisc_del_ingress(device: &str) -> Vec<String> {
    CommandLine::new("tc")
        .args(["qdisc", "del", "dev", device, "ingress"])
        .into_argv()
}

/// `tc qdisc add dev X root handle 1: htb default <class>`
pub fn tc_qdisc_add_htb_root(device: &str, default_class: u32) -> Vec<String> {
    CommandLine::new("tc")
        .args(["qdisc", "add", "dev", device, "root", "handle", "1:"])
        .arg(QdiscKind::Htb)
        .args(["default".to_string(), default_class.to_string()])
        .into_argv()
}

pub fn tc_class_add_htb(
    device: &str,
    class_id: &str,
    rate_kbit: u64,
    burst_bytes: u64,
    priority: u32,
) -> Vec<String> {
    CommandLine::new("tc")
        .args(["class", "add", "dev", device, "parent", "1:", "classid", class_id])
        .arg(QdiscKind::Htb)
        .args(["rate".to_string(), format!("{}kbit", rate_kbit)])
        .args(["ceil".to_string(), format!("{}kbit", rate_kbit)])
        .args(["burst".to_string(), format_burst(burst_bytes)])
        .args(["prio".to_string(), priority.to_string()])
        .into_argv()
}

/// netem child under a shaping class: `delay Xms [Yms 25%] [loss Z%]`
pub fn tc_qdisc_add_netem(
    device: &str,
    parent: &str,
    handle: &str,
    delay_ms: f64,
    jitter_ms: f64,
    loss_percent: f64,
) -> Vec<String> {
    let mut line = CommandLine::new("tc")
        .args(["qdisc", "add", "dev", device, "parent", parent, "handle", handle])
        .arg(QdiscKind::Netem);
    if delay_ms > 0.0 || jitter_ms > 0.0 {
        line = line.args(["delay".to_string(), format!("{}ms", trim_float(delay_ms))]);
        if jitter_ms > 0.0 {
            line = line.args([format!("{}ms", trim_float(jitter_ms)), "25%".to_string()]);
        }
    }
    if loss_percent > 0.0 {
        line = line.args(["loss".to_string(), format!("{}%", trim_float(loss_percent))]);
    }
    line.into_argv()
}

/// `tc qdisc add dev X handle ffff: ingress`
pub fn tc_qdisc_add_ingress(device: &str) -> Vec<String> {
    CommandLine::new("tc")
        .args(["qdisc", "add", "dev", device, "handle", "ffff:", "ingress"])
        .into_argv()
}

/// Police all traffic arriving on `device` to `rate_kbit`, dropping excess.
pub fn tc_filter_police_ingress(device: &str, rate_kbit: u64, burst_bytes: u64) -> Vec<String> {
    CommandLine::new("tc")
        .args(["filter", "add", "dev", device, "parent", "ffff:", "protocol", "all"])
        .args(["prio", "1", "u32", "match", "u32", "0", "0", "police"])
        .args(["rate".to_string(), format!("{}kbit", rate_kbit)])
        .args(["burst".to_string(), format_burst(burst_bytes)])
        .args(["drop", "flowid", ":1"])
        .into_argv()
}

/// Catch-all u32 filter steering every packet to `flow_id`.
pub fn tc_filter_catch_all(device: &str, flow_id: &str) -> Vec<String> {
    CommandLine::new("tc")
        .args(["filter", "add", "dev", device, "protocol", "ip", "parent", "1:0"])
        .args(["prio", "1", "u32", "match", "u32", "0", "0", "flowid", flow_id])
        .into_argv()
}

/// u32 filter for one classifier entry. Fields left empty or zero are not
/// matched on. IPv6 entries use the `ip6` selectors; they default to prio 2
/// since a prio band holds a single protocol and the IPv4 rules sit in 1.
pub fn tc_filter_add_u32(device: &str, filter: &Filter, flow_id: &str) -> Vec<String> {
    let v6 = filter.is_ipv6();
    let (family, selector) = if v6 { ("ipv6", "ip6") } else { ("ip", "ip") };
    let priority = match filter.priority {
        0 if v6 => 2,
        0 => 1,
        p => p,
    };
    let mut line = CommandLine::new("tc")
        .args(["filter", "add", "dev", device, "protocol", family, "parent", "1:0"])
        .args(["prio".to_string(), priority.to_string(), "u32".to_string()]);
    if let Some(proto) = filter.protocol_number() {
        // ICMPv6 has its own protocol number
        let proto = if v6 && proto == 1 { 58 } else { proto };
        line = line.args(["match", selector, "protocol"]).args([proto.to_string(), "0xff".to_string()]);
    }
    if !filter.src_ip.is_empty() {
        line = line.args(["match", selector, "src"]).arg(host_prefix(&filter.src_ip, v6));
    }
    if !filter.dst_ip.is_empty() {
        line = line.args(["match", selector, "dst"]).arg(host_prefix(&filter.dst_ip, v6));
    }
    if filter.src_port != 0 {
        line = line.args(["match", selector, "sport"]).args([filter.src_port.to_string(), "0xffff".to_string()]);
    }
    if filter.dst_port != 0 {
        line = line.args(["match", selector, "dport"]).args([filter.dst_port.to_string(), "0xffff".to_string()]);
    }
    line.args(["flowid", flow_id]).into_argv()
}

pub fn tc_qdisc_show(device: &str) -> Vec<String> {
    CommandLine::new("tc")
        .args(["qdisc", "show", "dev", device])
        .into_argv()
}

pub fn tc_class_show(device: &str) -> Vec<String> {
    CommandLine::new("tc")
        .args(["class", "show", "dev", device])
        .into_argv()
}

pub fn tc_qdisc_stats(device: &str) -> Vec<String> {
    CommandLine::new("tc")
        .args(["-s", "qdisc", "show", "dev", device])
        .into_argv()
}

// ---- iperf3 / ping ----

pub fn iperf3_server(port: u16) -> Vec<String> {
    CommandLine::new("iperf3")
        .args(["-s".to_string(), "-p".to_string(), port.to_string()])
        .into_argv()
}

/// Direction of an iperf3 client run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IperfDirection {
    Download,
    Upload,
    Bidirectional,
}

/// Client-side parameters for `iperf3 -c`
#[derive(Debug, Clone, PartialEq)]
pub struct IperfClientArgs {
    pub server: String,
    pub port: u16,
    pub duration: Duration,
    pub udp: bool,
    pub bandwidth: Option<String>,
    pub parallel: u32,
    pub window_size: Option<String>,
    pub interval: Option<Duration>,
    pub direction: IperfDirection,
}

pub fn iperf3_client(args: &IperfClientArgs) -> Vec<String> {
    let mut line = CommandLine::new("iperf3")
        .args(["-c", &args.server])
        .args(["-p".to_string(), args.port.to_string()])
        .args(["-t".to_string(), args.duration.as_secs().max(1).to_string()]);
    if args.udp {
        line = line.arg("-u");
        if let Some(bw) = &args.bandwidth {
            line = line.args(["-b", bw]);
        }
    }
    if args.parallel > 1 {
        line = line.args(["-P".to_string(), args.parallel.to_string()]);
    }
    if let Some(window) = &args.window_size {
        line = line.args(["-w", window]);
    }
    if let Some(interval) = args.interval {
        line = line.args(["-i".to_string(), trim_float(interval.as_secs_f64())]);
    }
    line = match args.direction {
        IperfDirection::Download => line,
        IperfDirection::Upload => line.arg("-R"),
        IperfDirection::Bidirectional => line.arg("--bidir"),
    };
    line.arg("-J").into_argv()
}

/// `ping -c <count> -i <interval> -W <wait> <target>`
pub fn ping(target: &str, count: u32, interval: Option<Duration>, wait_secs: u32) -> Vec<String> {
    let mut line = CommandLine::new("ping").args(["-c".to_string(), count.to_string()]);
    if let Some(interval) = interval {
        line = line.args(["-i".to_string(), trim_float(interval.as_secs_f64())]);
    }
    line.args(["-W".to_string(), wait_secs.to_string()])
        .arg(target)
        .into_argv()
}

fn host_prefix(ip: &str, v6: bool) -> String {
    format!("{}/{}", ip.trim(), if v6 { 128 } else { 32 })
}

fn format_burst(bytes: u64) -> String {
    if bytes >= 1024 && bytes % 1024 == 0 {
        format!("{}k", bytes / 1024)
    } else {
        format!("{}b", bytes)
    }
}

fn trim_float(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        let text = format!("{:.3}", value);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vxlan_add_command() {
        let argv = ip_link_add_vxlan("vxlan100", 100, 4789, "10.0.0.1".parse().unwrap(), Some("eth0"), false);
        assert_eq!(
            argv.join(" "),
            "ip link add vxlan100 type vxlan id 100 dstport 4789 local 10.0.0.1 dev eth0 nolearning"
        );

        let argv = ip_link_add_vxlan("vxlan7", 7, 4790, "10.0.0.1".parse().unwrap(), None, true);
        assert_eq!(
            argv.join(" "),
            "ip link add vxlan7 type vxlan id 7 dstport 4790 local 10.0.0.1 learning"
        );
    }

    #[test]
    fn test_htb_class_and_netem() {
        let argv = tc_class_add_htb("eth0", "1:10", 4570, 14 * 1024, 1);
        assert_eq!(
            argv.join(" "),
            "tc class add dev eth0 parent 1: classid 1:10 htb rate 4570kbit ceil 4570kbit burst 14k prio 1"
        );

        let argv = tc_qdisc_add_netem("eth0", "1:10", "100:", 16.1, 2.0, 0.5);
        assert_eq!(
            argv.join(" "),
            "tc qdisc add dev eth0 parent 1:10 handle 100: netem delay 16.1ms 2ms 25% loss 0.5%"
        );

        let argv = tc_qdisc_add_netem("eth0", "1:10", "100:", 0.0, 0.0, 1.0);
        assert_eq!(argv.join(" "), "tc qdisc add dev eth0 parent 1:10 handle 100: netem loss 1%");
    }

    #[test]
    fn test_ingress_policer() {
        assert_eq!(tc_qdisc_add_ingress("eth0").join(" "), "tc qdisc add dev eth0 handle ffff: ingress");
        assert_eq!(
            tc_filter_police_ingress("eth0", 2000, 16 * 1024).join(" "),
            "tc filter add dev eth0 parent ffff: protocol all prio 1 u32 match u32 0 0 \
             police rate 2000kbit burst 16k drop flowid :1"
        );
    }

    #[test]
    fn test_u32_filter_fields() {
        let filter = Filter {
            protocol: "udp".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            dst_port: 5201,
            ..Default::default()
        };
        let argv = tc_filter_add_u32("eth0", &filter, "1:10");
        assert_eq!(
            argv.join(" "),
            "tc filter add dev eth0 protocol ip parent 1:0 prio 1 u32 match ip protocol 17 0xff \
             match ip dst 10.0.0.2/32 match ip dport 5201 0xffff flowid 1:10"
        );
    }

    #[test]
    fn test_ipv6_filter_uses_ip6_selectors() {
        let filter = Filter {
            protocol: "tcp".to_string(),
            src_ip: "fd00::1".to_string(),
            dst_port: 443,
            ..Default::default()
        };
        let argv = tc_filter_add_u32("eth0", &filter, "1:10");
        assert_eq!(
            argv.join(" "),
            "tc filter add dev eth0 protocol ipv6 parent 1:0 prio 2 u32 match ip6 protocol 6 0xff \
             match ip6 src fd00::1/128 match ip6 dport 443 0xffff flowid 1:10"
        );

        let icmp = Filter {
            protocol: "icmp".to_string(),
            dst_ip: "fd00::2".to_string(),
            priority: 5,
            ..Default::default()
        };
        assert_eq!(
            tc_filter_add_u32("eth0", &icmp, "1:10").join(" "),
            "tc filter add dev eth0 protocol ipv6 parent 1:0 prio 5 u32 match ip6 protocol 58 0xff \
             match ip6 dst fd00::2/128 flowid 1:10"
        );
    }

    #[test]
    fn test_iperf_client_flags() {
        let args = IperfClientArgs {
            server: "10.0.0.2".to_string(),
            port: 5201,
            duration: Duration::from_secs(10),
            udp: true,
            bandwidth: Some("5M".to_string()),
            parallel: 4,
            window_size: None,
            interval: Some(Duration::from_millis(500)),
            direction: IperfDirection::Upload,
        };
        assert_eq!(
            iperf3_client(&args).join(" "),
            "iperf3 -c 10.0.0.2 -p 5201 -t 10 -u -b 5M -P 4 -i 0.5 -R -J"
        );
    }

    #[test]
    fn test_ping_command() {
        assert_eq!(
            ping("10.0.0.2", 3, None, 2).join(" "),
            "ping -c 3 -W 2 10.0.0.2"
        );
        assert_eq!(
            ping("10.0.0.2", 10, Some(Duration::from_millis(200)), 2).join(" "),
            "ping -c 10 -i 0.2 -W 2 10.0.0.2"
        );
    }
}
