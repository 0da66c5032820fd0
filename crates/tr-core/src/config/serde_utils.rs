//! Serde helpers for configuration fields

/// `Duration` written as a whole number of milliseconds.
///
/// Heartbeat timings are sub-second, so the config file uses
/// `heartbeat_interval = 250` rather than a seconds value.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timings {
        #[serde(with = "duration_millis")]
        poll: Duration,
    }

    #[test]
    fn test_sub_second_duration_in_toml() {
        let timings = Timings {
            poll: Duration::from_millis(250),
        };
        let text = toml::to_string(&timings).unwrap();
        assert_eq!(text.trim(), "poll = 250");
        assert_eq!(toml::from_str::<Timings>(&text).unwrap(), timings);
    }

    #[test]
    fn test_negative_value_is_rejected() {
        assert!(toml::from_str::<Timings>("poll = -5").is_err());
    }
}
