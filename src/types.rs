// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

/// MQTT client identifier, as supplied in the `CONNECT` packet (or assigned
/// by the broker when the client supplies an empty one).
pub type ClientId = String;

/// Identifies a listener within this broker process.
pub type ListenerId = u32;

/// Identifies a node within the cluster. Configured, not derived.
pub type NodeId = String;

/// Read-compatibility shim for `connectedAt`/`lastActivityAt` fields written
/// by older broker versions, which stored either an object-wrapped epoch
/// seconds value (`{"epochSecond": N}`) or an ISO-8601 string. New records
/// are always written as a plain epoch-millisecond integer; this module
/// only widens what can be *read*.
pub mod epoch_millis {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| serde::de::Error::custom("epoch value out of range")),
            Value::Object(map) => map
                .get("epochSecond")
                .and_then(Value::as_u64)
                .map(|secs| secs * 1000)
                .ok_or_else(|| serde::de::Error::custom("missing epochSecond field")),
            Value::String(s) => parse_iso8601_utc_to_millis(&s)
                .ok_or_else(|| serde::de::Error::custom("unrecognized timestamp string")),
            other => Err(serde::de::Error::custom(format!(
                "unsupported timestamp shape: {other:?}"
            ))),
        }
    }

    /// Parses a narrow but common subset of ISO-8601
    /// (`YYYY-MM-DDTHH:MM:SSZ`) without pulling in a date/time crate just
    /// for this legacy read path.
    fn parse_iso8601_utc_to_millis(s: &str) -> Option<u64> {
        let s = s.strip_suffix('Z')?;
        let (date, time) = s.split_once('T')?;
        let mut date_parts = date.split('-');
        let year: i64 = date_parts.next()?.parse().ok()?;
        let month: i64 = date_parts.next()?.parse().ok()?;
        let day: i64 = date_parts.next()?.parse().ok()?;
        let mut time_parts = time.split(':');
        let hour: i64 = time_parts.next()?.parse().ok()?;
        let minute: i64 = time_parts.next()?.parse().ok()?;
        let second: i64 = time_parts.next()?.parse().ok()?;

        // Days since epoch via a civil calendar formula (Howard Hinnant's
        // days_from_civil), avoiding a chrono dependency for one field.
        let y = if month <= 2 { year - 1 } else { year };
        let era = if y >= 0 { y } else { y - 399 } / 400;
        let yoe = y - era * 400;
        let mp = (month + 9) % 12;
        let doy = (153 * mp + 2) / 5 + day - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        let days = era * 146_097 + doe - 719_468;

        let secs = days * 86400 + hour * 3600 + minute * 60 + second;
        u64::try_from(secs * 1000).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::epoch_millis;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(deserialize_with = "epoch_millis::deserialize")]
        at: u64,
    }

    #[test]
    fn test_read_compat_plain_millis() {
        let wrapper: Wrapper = serde_json::from_str(r#"{"at":1000}"#).unwrap();
        assert_eq!(wrapper.at, 1000);
    }

    #[test]
    fn test_read_compat_epoch_second_object() {
        let wrapper: Wrapper = serde_json::from_str(r#"{"at":{"epochSecond":2}}"#).unwrap();
        assert_eq!(wrapper.at, 2000);
    }

    #[test]
    fn test_read_compat_iso8601() {
        let wrapper: Wrapper = serde_json::from_str(r#"{"at":"1970-01-01T00:00:02Z"}"#).unwrap();
        assert_eq!(wrapper.at, 2000);
    }
}
