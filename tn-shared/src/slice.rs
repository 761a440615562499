//! Slice types and their reference QoS profiles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network slice category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SliceType {
    #[serde(rename = "URLLC", alias = "uRLLC", alias = "urllc")]
    Urllc,
    #[serde(rename = "eMBB", alias = "EMBB", alias = "embb")]
    Embb,
    #[serde(rename = "mIoT", alias = "MIOT", alias = "miot")]
    Miot,
    #[serde(rename = "mMTC", alias = "MMTC", alias = "mmtc")]
    Mmtc,
}

/// Reference throughput/RTT pair a slice is validated against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThesisTarget {
    pub throughput_mbps: f64,
    pub rtt_ms: f64,
}

impl SliceType {
    /// All slice types with a distinct reference profile, in the order the
    /// compliance report lists them (ascending throughput).
    pub const REFERENCE: [SliceType; 3] = [SliceType::Urllc, SliceType::Miot, SliceType::Embb];

    pub fn target(&self) -> ThesisTarget {
        match self {
            SliceType::Urllc => ThesisTarget {
                throughput_mbps: 0.93,
                rtt_ms: 6.3,
            },
            // mMTC shares the massive-IoT profile
            SliceType::Miot | SliceType::Mmtc => ThesisTarget {
                throughput_mbps: 2.77,
                rtt_ms: 15.7,
            },
            SliceType::Embb => ThesisTarget {
                throughput_mbps: 4.57,
                rtt_ms: 16.1,
            },
        }
    }

    /// Shaping rate in kbit/s matching the reference throughput.
    pub fn reference_rate_kbit(&self) -> u64 {
        (self.target().throughput_mbps * 1000.0).round() as u64
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SliceType::Urllc => "URLLC",
            SliceType::Embb => "eMBB",
            SliceType::Miot => "mIoT",
            SliceType::Mmtc => "mMTC",
        }
    }
}

impl fmt::Display for SliceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SliceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "urllc" => Ok(SliceType::Urllc),
            "embb" => Ok(SliceType::Embb),
            "miot" => Ok(SliceType::Miot),
            "mmtc" => Ok(SliceType::Mmtc),
            other => Err(format!("unknown slice type '{}'", other)),
        }
    }
}

/// Reference throughput targets in Mbps, ordered URLLC, mIoT, eMBB.
pub fn throughput_targets() -> Vec<f64> {
    SliceType::REFERENCE
        .iter()
        .map(|s| s.target().throughput_mbps)
        .collect()
}

/// Reference RTT targets in ms, ordered URLLC, mIoT, eMBB.
pub fn rtt_targets() -> Vec<f64> {
    SliceType::REFERENCE
        .iter()
        .map(|s| s.target().rtt_ms)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("uRLLC".parse::<SliceType>().unwrap(), SliceType::Urllc);
        assert_eq!("EMBB".parse::<SliceType>().unwrap(), SliceType::Embb);
        assert_eq!("mIoT".parse::<SliceType>().unwrap(), SliceType::Miot);
        assert!("voice".parse::<SliceType>().is_err());
    }

    #[test]
    fn test_reference_targets_order() {
        assert_eq!(throughput_targets(), vec![0.93, 2.77, 4.57]);
        assert_eq!(rtt_targets(), vec![6.3, 15.7, 16.1]);
    }

    #[test]
    fn test_reference_rates() {
        assert_eq!(SliceType::Embb.reference_rate_kbit(), 4570);
        assert_eq!(SliceType::Miot.reference_rate_kbit(), 2770);
        assert_eq!(SliceType::Urllc.reference_rate_kbit(), 930);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&SliceType::Embb).unwrap();
        assert_eq!(json, "\"eMBB\"");
        let parsed: SliceType = serde_json::from_str("\"urllc\"").unwrap();
        assert_eq!(parsed, SliceType::Urllc);
    }
}
