//! UTC instant with attosecond resolution.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{KaraboError, Result};

pub const ATTOSEC_PER_SEC: u64 = 1_000_000_000_000_000_000;
pub const ATTOSEC_PER_MICROSEC: u64 = 1_000_000_000_000;
const ATTOSEC_PER_NANOSEC: u64 = 1_000_000_000;
const DATE_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Seconds since the Unix epoch plus an attosecond fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Epochstamp {
    sec: u64,
    frac: u64,
}

impl Epochstamp {
    /// Fractions of a second or more carry into the seconds.
    #[must_use]
    pub fn new(sec: u64, frac: u64) -> Self {
        Self {
            sec: sec + frac / ATTOSEC_PER_SEC,
            frac: frac % ATTOSEC_PER_SEC,
        }
    }

    /// The current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let now = Utc::now();
        let sec = u64::try_from(now.timestamp()).unwrap_or(0);
        Self::new(sec, u64::from(now.timestamp_subsec_nanos()) * ATTOSEC_PER_NANOSEC)
    }

    #[must_use]
    pub fn seconds(&self) -> u64 {
        self.sec
    }

    #[must_use]
    pub fn fractional_seconds(&self) -> u64 {
        self.frac
    }

    fn total_attoseconds(&self) -> i128 {
        i128::from(self.sec) * i128::from(ATTOSEC_PER_SEC) + i128::from(self.frac)
    }

    /// Signed distance `self - earlier` in attoseconds.
    #[must_use]
    pub fn attoseconds_since(&self, earlier: &Epochstamp) -> i128 {
        self.total_attoseconds() - earlier.total_attoseconds()
    }

    /// Absolute distance between two instants.
    #[must_use]
    pub fn elapsed(&self, other: &Epochstamp) -> Duration {
        let atto = self.attoseconds_since(other).unsigned_abs();
        let per_sec = u128::from(ATTOSEC_PER_SEC);
        let secs = u64::try_from(atto / per_sec).unwrap_or(u64::MAX);
        // sub-nanosecond remainder is truncated
        let nanos = ((atto % per_sec) / u128::from(ATTOSEC_PER_NANOSEC)) as u32;
        Duration::new(secs, nanos)
    }

    #[must_use]
    pub fn add(&self, duration: Duration) -> Epochstamp {
        Epochstamp::new(
            self.sec + duration.as_secs(),
            self.frac + u64::from(duration.subsec_nanos()) * ATTOSEC_PER_NANOSEC,
        )
    }

    /// `YYYYMMDDThhmmss.ffffffffffffffffff` (UTC).
    #[must_use]
    pub fn to_iso8601(&self) -> String {
        let date = i64::try_from(self.sec)
            .ok()
            .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
            .map(|d| d.format(DATE_FORMAT).to_string())
            .unwrap_or_else(|| "99991231T235959".to_string());
        format!("{date}.{:018}", self.frac)
    }

    /// Parse the form written by [`to_iso8601`](Self::to_iso8601); the
    /// fraction may have up to 18 digits and may be absent.
    pub fn from_iso8601(text: &str) -> Result<Epochstamp> {
        let bad = || KaraboError::Parse(format!("'{text}' is not an ISO-8601 timestamp"));
        let trimmed = text.trim().trim_end_matches('Z');
        let (date, fraction) = match trimmed.split_once('.') {
            Some((d, f)) => (d, f),
            None => (trimmed, ""),
        };
        let naive = NaiveDateTime::parse_from_str(date, DATE_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S"))
            .map_err(|_| bad())?;
        let sec = u64::try_from(naive.and_utc().timestamp()).map_err(|_| bad())?;
        if fraction.len() > 18 || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(bad());
        }
        let frac = if fraction.is_empty() {
            0
        } else {
            format!("{fraction:0<18}").parse::<u64>().map_err(|_| bad())?
        };
        Ok(Epochstamp::new(sec, frac))
    }
}

impl fmt::Display for Epochstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

impl FromStr for Epochstamp {
    type Err = KaraboError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_iso8601(s)
    }
}
