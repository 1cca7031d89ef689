//! CSV row encoding shared by live and history files.

use crate::error::{PersistenceError, PersistenceResult};
use oi_core::{time, HistoryPoint, SnapshotRecord, Symbol};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

pub const HEADER: [&str; 4] = ["timestamp", "datetime_utc", "openInterest", "sumOpenInterestValue"];

fn opt_decimal(value: Option<Decimal>) -> String {
    value.map(|d| d.to_string()).unwrap_or_default()
}

pub fn snapshot_row(record: &SnapshotRecord) -> [String; 4] {
    [
        record.timestamp_ms.to_string(),
        record.captured_at_iso.clone(),
        record.open_interest.to_string(),
        opt_decimal(record.notional_value),
    ]
}

pub fn history_row(point: &HistoryPoint) -> PersistenceResult<[String; 4]> {
    Ok([
        point.timestamp_ms.to_string(),
        time::iso_utc(point.timestamp_ms)?,
        point.sum_open_interest.to_string(),
        opt_decimal(point.sum_open_interest_value),
    ])
}

/// Leading timestamp of a row, if it is numeric.
pub fn row_timestamp(row: &csv::StringRecord) -> Option<i64> {
    row.get(0).and_then(|s| s.trim().parse().ok())
}

pub fn parse_history_row(
    symbol: &Symbol,
    row: &csv::StringRecord,
    path: &Path,
) -> PersistenceResult<HistoryPoint> {
    let invalid = |reason: String| PersistenceError::InvalidRow {
        path: path.to_path_buf(),
        reason,
    };

    let timestamp_ms =
        row_timestamp(row).ok_or_else(|| invalid(format!("bad timestamp in {:?}", row)))?;
    let oi = row.get(2).unwrap_or_default().trim();
    let sum_open_interest =
        Decimal::from_str(oi).map_err(|e| invalid(format!("bad openInterest {oi:?}: {e}")))?;
    let value = row.get(3).unwrap_or_default().trim();
    let sum_open_interest_value = if value.is_empty() {
        None
    } else {
        Some(
            Decimal::from_str(value)
                .map_err(|e| invalid(format!("bad sumOpenInterestValue {value:?}: {e}")))?,
        )
    };

    Ok(HistoryPoint {
        symbol: symbol.clone(),
        timestamp_ms,
        sum_open_interest,
        sum_open_interest_value,
    })
}
