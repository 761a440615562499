//! Serde adapters for human-readable durations ("30s", "1m30s", "500ms").
//!
//! Integers are accepted on input and read as whole seconds.

use duration_string::DurationString;
use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Text(String),
    Seconds(u64),
}

fn parse_repr(repr: DurationRepr) -> Result<Duration, String> {
    match repr {
        DurationRepr::Seconds(secs) => Ok(Duration::from_secs(secs)),
        DurationRepr::Text(text) => {
            let parsed: DurationString = text
                .trim()
                .parse()
                .map_err(|e| format!("Invalid duration '{}': {}", text, e))?;
            Ok(parsed.into())
        }
    }
}

pub mod duration {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&DurationString::from(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let repr = DurationRepr::deserialize(deserializer)?;
        parse_repr(repr).map_err(serde::de::Error::custom)
    }
}

pub mod option_duration {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&DurationString::from(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let repr = Option::<DurationRepr>::deserialize(deserializer)?;
        repr.map(parse_repr)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
