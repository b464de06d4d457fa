//! Timestamp parsing and formatting shared by Meterline components
//!
//! Every timestamp crossing a component boundary is an ISO-8601 instant in
//! UTC, carried with millisecond precision.

use chrono::{DateTime, DurationRound, NaiveDateTime, TimeDelta, Utc};
use thiserror::Error;

/// Canonical output format, e.g. `2015-01-31T18:24:34.152Z`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("The provided date has an invalid format. Format should be of yyyy-mm-ddThh:mm:ss.msZ, ex: 2015-01-31T18:24:34.1523Z")]
pub struct TimestampError {
    pub value: String,
}

/// Parse a caller-supplied timestamp.
///
/// Accepts RFC 3339 (any offset, normalised to UTC) and offset-less
/// `yyyy-mm-dd[T ]hh:mm:ss[.fff]` forms, which are read as UTC. The result is
/// truncated to millisecond precision.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    let trimmed = value.trim();
    let err = || TimestampError {
        value: value.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return truncate_to_millis(dt.with_timezone(&Utc)).ok_or_else(err);
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return truncate_to_millis(naive.and_utc()).ok_or_else(err);
        }
    }

    Err(err())
}

/// Format a timestamp in the canonical millisecond form.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Drop sub-millisecond precision.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
    ts.duration_trunc(TimeDelta::milliseconds(1)).ok()
}

/// Serde adapter writing timestamps in [`TIMESTAMP_FORMAT`] and reading
/// anything [`parse_timestamp`] accepts.
pub mod iso8601 {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(de::Error::custom)
    }

    pub mod option {
        use super::super::{format_timestamp, parse_timestamp};
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => serializer.serialize_some(&format_timestamp(ts)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| parse_timestamp(&raw).map_err(de::Error::custom))
                .transpose()
        }
    }
}
