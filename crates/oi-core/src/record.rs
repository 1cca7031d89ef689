//! Persisted record shapes.

use crate::symbol::Symbol;
use crate::time;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One live open-interest observation.
///
/// Created once per poll tick and never updated. Every record captured in
/// the same batch carries the same `timestamp_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub symbol: Symbol,
    pub open_interest: Decimal,
    /// `open_interest * mark_price`; absent when the mark price was unavailable.
    pub notional_value: Option<Decimal>,
    pub timestamp_ms: i64,
    pub captured_at_iso: String,
}

impl SnapshotRecord {
    pub fn new(
        symbol: Symbol,
        open_interest: Decimal,
        mark_price: Option<Decimal>,
        timestamp_ms: i64,
    ) -> crate::Result<Self> {
        Ok(Self {
            symbol,
            open_interest,
            notional_value: mark_price.map(|px| open_interest * px),
            timestamp_ms,
            captured_at_iso: time::iso_utc(timestamp_ms)?,
        })
    }
}

/// One point of the 5-minute aggregated history series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub symbol: Symbol,
    /// Aligned to a 5-minute boundary.
    pub timestamp_ms: i64,
    pub sum_open_interest: Decimal,
    pub sum_open_interest_value: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_notional() {
        let sym = Symbol::new("BTCUSDT").unwrap();
        let rec = SnapshotRecord::new(sym.clone(), dec!(1.5), Some(dec!(40000)), 1_709_251_200_000)
            .unwrap();
        assert_eq!(rec.notional_value, Some(dec!(60000.0)));
        assert_eq!(rec.captured_at_iso, "2024-03-01T00:00:00Z");

        let rec = SnapshotRecord::new(sym, dec!(1.5), None, 1_709_251_200_000).unwrap();
        assert!(rec.notional_value.is_none());
    }
}
