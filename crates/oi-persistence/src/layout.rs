//! On-disk layout under the data directory.
//!
//! ```text
//! open_interest/<SYM>/1m/<SYM>-oi-<day>.csv                  live snapshots
//! open_interest/<SYM>/1m/<SYM>-oi-<day>.<YYYYMMDD_HHMMSS>.csv rotated
//! open_interest/<SYM>/5m/<SYM>-oi-5m-<day>.csv               history day file
//! errors/<day>/error_<SYM>_<day>_<HH-MM-SS>.json             error events
//! logs/batch_summary-<day>.csv                               batch audit
//! error_statistics.json                                      error aggregate
//! ```

use chrono::{DateTime, Utc};
use oi_core::{DayKey, Symbol};
use std::path::{Path, PathBuf};

pub const OPEN_INTEREST_DIR: &str = "open_interest";
pub const ERRORS_DIR: &str = "errors";
pub const LOGS_DIR: &str = "logs";
pub const ERROR_STATISTICS_FILE: &str = "error_statistics.json";
pub const TMP_SUFFIX: &str = "tmp";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn symbol_dir(&self, symbol: &Symbol) -> PathBuf {
        self.root.join(OPEN_INTEREST_DIR).join(symbol.as_str())
    }

    pub fn live_dir(&self, symbol: &Symbol) -> PathBuf {
        self.symbol_dir(symbol).join("1m")
    }

    pub fn live_file(&self, symbol: &Symbol, day: DayKey) -> PathBuf {
        self.live_dir(symbol)
            .join(format!("{}-oi-{}.csv", symbol, day))
    }

    /// Name a live file takes when rotated aside at `stamp` (local time,
    /// `YYYYMMDD_HHMMSS`).
    pub fn rotated_file(&self, symbol: &Symbol, day: DayKey, stamp: &str) -> PathBuf {
        self.live_dir(symbol)
            .join(format!("{}-oi-{}.{}.csv", symbol, day, stamp))
    }

    pub fn history_dir(&self, symbol: &Symbol) -> PathBuf {
        self.symbol_dir(symbol).join("5m")
    }

    pub fn history_file(&self, symbol: &Symbol, day: DayKey) -> PathBuf {
        self.history_dir(symbol)
            .join(format!("{}-oi-5m-{}.csv", symbol, day))
    }

    pub fn error_event_file(&self, symbol: &Symbol, at: DateTime<Utc>) -> PathBuf {
        let day = at.format("%Y-%m-%d").to_string();
        self.root.join(ERRORS_DIR).join(&day).join(format!(
            "error_{}_{}_{}.json",
            symbol,
            day,
            at.format("%H-%M-%S")
        ))
    }

    pub fn batch_summary_file(&self, day: DayKey) -> PathBuf {
        self.root
            .join(LOGS_DIR)
            .join(format!("batch_summary-{}.csv", day))
    }

    pub fn error_statistics_file(&self) -> PathBuf {
        self.root.join(ERROR_STATISTICS_FILE)
    }
}

/// Sibling temp path used while a file is being replaced.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

/// Whether a file name carries a rotation suffix (`.<8 digits>_<6 digits>.csv`).
pub fn is_rotated_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".csv") else {
        return false;
    };
    let Some((_, stamp)) = stem.rsplit_once('.') else {
        return false;
    };
    let stamp = stamp.split('-').next().unwrap_or(stamp);
    let bytes = stamp.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'_'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 8 || b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn btc() -> Symbol {
        Symbol::new("BTCUSDT").unwrap()
    }

    #[test]
    fn test_paths() {
        let layout = StorageLayout::new("/data");
        let day: DayKey = "2024-03-01".parse().unwrap();
        assert_eq!(
            layout.live_file(&btc(), day),
            PathBuf::from("/data/open_interest/BTCUSDT/1m/BTCUSDT-oi-2024-03-01.csv")
        );
        assert_eq!(
            layout.history_file(&btc(), day),
            PathBuf::from("/data/open_interest/BTCUSDT/5m/BTCUSDT-oi-5m-2024-03-01.csv")
        );
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 13, 4, 5).unwrap();
        assert_eq!(
            layout.error_event_file(&btc(), at),
            PathBuf::from("/data/errors/2024-03-01/error_BTCUSDT_2024-03-01_13-04-05.json")
        );
        assert_eq!(
            tmp_path(&layout.history_file(&btc(), day)),
            PathBuf::from("/data/open_interest/BTCUSDT/5m/BTCUSDT-oi-5m-2024-03-01.csv.tmp")
        );
    }

    #[test]
    fn test_rotated_name() {
        assert!(is_rotated_name("BTCUSDT-oi-2024-03-01.20240301_120000.csv"));
        assert!(is_rotated_name("BTCUSDT-oi-2024-03-01.20240301_120000-1.csv"));
        assert!(!is_rotated_name("BTCUSDT-oi-2024-03-01.csv"));
        assert!(!is_rotated_name("BTCUSDT-oi-5m-2024-03-01.csv"));
    }
}
