use std::{fmt, num::ParseIntError, str::FromStr};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds between the unix epoch and 2015-01-01T00:00:00Z, the origin
/// of every snowflake's embedded timestamp.
pub const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

/// Platform-assigned identifier. Serialized as a decimal string, as the API
/// does, so ids above 2^53 survive JSON consumers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Snowflake(pub u64);

impl Snowflake {
    /// Smallest snowflake created at or after `time`. Times before the
    /// snowflake epoch clamp to zero.
    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        let offset = time.timestamp_millis() - SNOWFLAKE_EPOCH_MS;
        if offset <= 0 {
            Snowflake(0)
        } else {
            Snowflake((offset as u64) << 22)
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        let millis = (self.0 >> 22) as i64 + SNOWFLAKE_EPOCH_MS;
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snowflake {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Snowflake)
    }
}

impl TryFrom<String> for Snowflake {
    type Error = ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Snowflake> for String {
    fn from(value: Snowflake) -> Self {
        value.to_string()
    }
}

impl From<u64> for Snowflake {
    fn from(value: u64) -> Self {
        Snowflake(value)
    }
}

/// Seconds since the unix epoch with microsecond precision, the time format
/// used throughout the record log.
pub fn epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1_000_000.0
}

pub fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
}
