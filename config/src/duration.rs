//! Serde glue for human readable durations such as `90s`, `1h 30m` or `30days`.
//! Plain integers are read as seconds.

use serde::{
    de,
    Deserializer,
    Serializer,
};
use std::{
    fmt,
    time::Duration,
};

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(DurationVisitor)
}

struct DurationVisitor;

impl de::Visitor<'_> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a duration like \"90s\" or a number of seconds")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Ok(Duration::from_secs(seconds));
        }
        humantime::parse_duration(value).map_err(|err| E::custom(format!("invalid duration {value:?}: {err}")))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
        Ok(Duration::from_secs(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
        u64::try_from(value)
            .map(Duration::from_secs)
            .map_err(|_| E::custom(format!("negative duration: {value}")))
    }
}
