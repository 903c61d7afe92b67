//! Duration fields in configuration files
//!
//! TOML has no duration type, so timeouts are plain integers. Use
//! `#[serde(with = "duration_secs")]` for timeouts and
//! `#[serde(with = "duration_millis")]` for backoff delays.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

fn to_u64<S: Serializer>(value: u128, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value).unwrap_or(u64::MAX))
}

/// Whole seconds
pub mod duration_secs {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        to_u64(u128::from(value.as_secs()), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Milliseconds
pub mod duration_millis {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        to_u64(value.as_millis(), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::{duration_millis, duration_secs};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timings {
        #[serde(with = "duration_secs")]
        rpc_timeout: Duration,
        #[serde(with = "duration_millis")]
        initial_backoff: Duration,
    }

    #[test]
    fn test_timings_in_toml() {
        let timings: Timings = toml::from_str("rpc_timeout = 10\ninitial_backoff = 250\n").unwrap();
        assert_eq!(timings.rpc_timeout, Duration::from_secs(10));
        assert_eq!(timings.initial_backoff, Duration::from_millis(250));

        let text = toml::to_string(&timings).unwrap();
        assert!(text.contains("rpc_timeout = 10"));
        assert!(text.contains("initial_backoff = 250"));
    }

    #[test]
    fn test_sub_second_timeout_truncates() {
        let json = serde_json::to_value(Timings {
            rpc_timeout: Duration::from_millis(1500),
            initial_backoff: Duration::from_millis(1500),
        })
        .unwrap();
        assert_eq!(json["rpc_timeout"], 1);
        assert_eq!(json["initial_backoff"], 1500);
    }
}
