//! Epoch-millisecond time arithmetic.
//!
//! All timestamps in the collector are UTC epoch milliseconds (`i64`).
//! History is sampled on a fixed 5-minute grid anchored at 00:00 UTC,
//! so every UTC day holds exactly [`POINTS_PER_DAY`] slots.

use crate::error::{CoreError, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Spacing of the history grid (5 minutes).
pub const HISTORY_STEP_MS: i64 = 5 * 60 * 1000;

/// One minute in milliseconds.
pub const MINUTE_MS: i64 = 60 * 1000;

/// One UTC day in milliseconds.
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Number of 5-minute slots in a UTC day.
pub const POINTS_PER_DAY: usize = (DAY_MS / HISTORY_STEP_MS) as usize;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Truncate to the start of the containing minute.
pub fn truncate_to_minute(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(MINUTE_MS)
}

/// Round down to the containing 5-minute slot.
pub fn align_down(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(HISTORY_STEP_MS)
}

/// Round up to the next 5-minute boundary (identity when already aligned).
pub fn align_up(ts_ms: i64) -> i64 {
    let rem = ts_ms.rem_euclid(HISTORY_STEP_MS);
    if rem == 0 {
        ts_ms
    } else {
        ts_ms + (HISTORY_STEP_MS - rem)
    }
}

/// Whether the timestamp sits exactly on the 5-minute grid.
pub fn is_aligned(ts_ms: i64) -> bool {
    ts_ms.rem_euclid(HISTORY_STEP_MS) == 0
}

/// Convert epoch millis to a UTC datetime.
pub fn to_datetime(ts_ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .ok_or(CoreError::InvalidTimestamp(ts_ms))
}

/// RFC 3339 rendering with a trailing `Z` (e.g., "2024-03-01T00:05:00Z").
pub fn iso_utc(ts_ms: i64) -> Result<String> {
    Ok(to_datetime(ts_ms)?.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// A UTC calendar day, the unit of atomic history replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DayKey(NaiveDate);

impl DayKey {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// The UTC day containing `ts_ms`.
    pub fn from_timestamp_ms(ts_ms: i64) -> Result<Self> {
        Ok(Self(to_datetime(ts_ms)?.date_naive()))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// 00:00:00.000 UTC of this day.
    pub fn start_ms(&self) -> i64 {
        self.0
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or_default()
    }

    /// First millisecond of the following day.
    pub fn end_ms(&self) -> i64 {
        self.start_ms() + DAY_MS
    }

    /// Timestamp of the day's final 5-minute slot (23:55 UTC).
    pub fn last_slot_ms(&self) -> i64 {
        self.end_ms() - HISTORY_STEP_MS
    }

    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms() && ts_ms < self.end_ms()
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for DayKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Self)
            .map_err(|_| CoreError::InvalidDay(s.to_string()))
    }
}
