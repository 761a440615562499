//! Shaping parameter calculation.
//!
//! Turns a slice's bandwidth/latency figures into HTB rates and burst sizes
//! and estimates the processing overhead the resulting rule set adds.

use tn_shared::{BandwidthPolicy, SliceType};

/// Headroom applied on top of a profile's reference rate
pub const OVERHEAD_FACTOR: f64 = 1.1;

/// Smallest burst HTB is given (one Ethernet frame).
pub const MIN_BURST_BYTES: u64 = 1500;

const BASE_TC_OVERHEAD: f64 = 2.0;
const NETEM_OVERHEAD: f64 = 3.0;
const FILTER_OVERHEAD: f64 = 1.5;

/// Burst size in bytes: enough to absorb `latency_ms` worth of traffic at
/// `rate_kbit` with 50% headroom, never below one frame, rounded up to KiB.
pub fn burst_bytes(rate_kbit: u64, latency_ms: f64) -> u64 {
    let rate_bps = rate_kbit as f64 * 1000.0;
    let latency_s = latency_ms.max(0.0) / 1000.0;
    let raw = (rate_bps / 8.0 * latency_s * 1.5).ceil() as u64;
    raw.max(MIN_BURST_BYTES).div_ceil(1024) * 1024
}

/// Estimated CPU/latency overhead in percent of a policy's rule set.
pub fn tc_overhead_percent(policy: &BandwidthPolicy) -> f64 {
    let mut overhead = BASE_TC_OVERHEAD;
    if policy.has_netem() {
        overhead += NETEM_OVERHEAD;
    }
    overhead + FILTER_OVERHEAD
}

/// Shaping parameters derived for one slice profile
#[derive(Debug, Clone, PartialEq)]
pub struct ShapingProfile {
    pub slice_type: SliceType,
    pub rate_kbit: u64,
    pub ceil_kbit: u64,
    pub latency_ms: f64,
    pub burst_bytes: u64,
}

/// Reference shaping profile for a slice type: the target rate as the
/// guaranteed rate, with [`OVERHEAD_FACTOR`] headroom as ceiling.
pub fn reference_profile(slice_type: SliceType) -> ShapingProfile {
    let target = slice_type.target();
    let rate_kbit = slice_type.reference_rate_kbit();
    let ceil_kbit = (rate_kbit as f64 * OVERHEAD_FACTOR).round() as u64;
    ShapingProfile {
        slice_type,
        rate_kbit,
        ceil_kbit,
        latency_ms: target.rtt_ms,
        burst_bytes: burst_bytes(ceil_kbit, target.rtt_ms),
    }
}

/// Fill in shaping figures for a slice type where a policy leaves them
/// unset. Values the caller provided are kept.
pub fn policy_for_slice(slice_type: SliceType, base: &BandwidthPolicy) -> BandwidthPolicy {
    let target = slice_type.target();
    let mut policy = base.clone();
    if policy.downlink_mbps <= 0.0 && policy.queue_class != tn_shared::config::BEST_EFFORT_CLASS {
        policy.downlink_mbps = target.throughput_mbps;
    }
    if policy.uplink_mbps <= 0.0 {
        policy.uplink_mbps = policy.downlink_mbps;
    }
    if policy.queue_class.is_empty() {
        policy.queue_class = slice_type.as_str().to_string();
    }
    policy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_floor_and_rounding() {
        // 1 Mbit/s for 1 ms is 187.5 bytes, floored to one frame, rounded to 2 KiB
        assert_eq!(burst_bytes(1000, 1.0), 2048);
        // 4570 kbit/s for 16.1 ms: 571250 * 0.0161 * 1.5 = 13795.7 -> 14 KiB
        assert_eq!(burst_bytes(4570, 16.1), 14 * 1024);
        assert_eq!(burst_bytes(0, 0.0), 2048);
    }

    #[test]
    fn test_overhead() {
        let mut policy = BandwidthPolicy::default();
        assert_eq!(tc_overhead_percent(&policy), 3.5);
        policy.latency_ms = 10.0;
        assert_eq!(tc_overhead_percent(&policy), 6.5);
    }

    #[test]
    fn test_reference_profiles() {
        let embb = reference_profile(SliceType::Embb);
        assert_eq!(embb.rate_kbit, 4570);
        assert_eq!(embb.ceil_kbit, 5027);
        assert!((embb.latency_ms - 16.1).abs() < f64::EPSILON);

        let urllc = reference_profile(SliceType::Urllc);
        assert_eq!(urllc.rate_kbit, 930);
    }

    #[test]
    fn test_policy_for_slice_keeps_explicit_values() {
        let base = BandwidthPolicy {
            downlink_mbps: 10.0,
            ..Default::default()
        };
        let policy = policy_for_slice(SliceType::Embb, &base);
        assert_eq!(policy.downlink_mbps, 10.0);
        assert_eq!(policy.uplink_mbps, 10.0);
        assert_eq!(policy.queue_class, "eMBB");

        let policy = policy_for_slice(SliceType::Miot, &BandwidthPolicy::default());
        assert_eq!(policy.downlink_mbps, 2.77);
    }
}
