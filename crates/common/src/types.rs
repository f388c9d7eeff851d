use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::DomainError;

/// Layout of directory document timestamps (always UTC)
pub const DIRECTORY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamp in Unix epoch seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_secs())
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Minutes since the epoch, the unit of onion service time periods
    pub fn as_minutes(&self) -> u64 {
        self.0 / 60
    }

    /// Hour of the day in UTC
    pub fn hour_of_day(&self) -> u64 {
        (self.0 % 86_400) / 3600
    }

    /// Parses a `YYYY-MM-DD HH:MM:SS` UTC timestamp
    pub fn parse_directory_time(value: &str) -> Result<Self, DomainError> {
        let parsed = NaiveDateTime::parse_from_str(value.trim(), DIRECTORY_TIME_FORMAT)
            .map_err(|err| DomainError::InvalidTimestamp(format!("{value:?}: {err}")))?;
        let secs = parsed.and_utc().timestamp();
        u64::try_from(secs).map(Self).map_err(|_| {
            DomainError::InvalidTimestamp(format!("{value:?} is before the epoch"))
        })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp(self.0 as i64, 0) {
            Some(dt) => write!(f, "{}", dt.format(DIRECTORY_TIME_FORMAT)),
            None => write!(f, "@{}", self.0),
        }
    }
}
