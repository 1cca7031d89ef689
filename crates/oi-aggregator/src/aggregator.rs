//! Classify, record and report unresolved failures.
//!
//! The durable document is the single source of truth. It is loaded once,
//! kept in memory as a write-through cache and rewritten atomically on
//! every `record`, all under one lock so concurrent workers serialize.

use crate::error::AggregatorResult;
use crate::statistics::ErrorStatistics;
use chrono::{Duration as ChronoDuration, Utc};
use oi_core::{ErrorKind, ErrorRecord, ErrorSource, Symbol};
use oi_persistence::{write_json_atomic, Storage};
use oi_telemetry::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// In-memory records retained for `recent()` and reports.
pub const HISTORY_CAPACITY: usize = 1000;

/// Records included in an exported report.
pub const REPORT_RECORDS: usize = 100;

/// Classify free text. Prefer the structured kind when one is available.
pub fn classify(message: &str) -> ErrorKind {
    ErrorKind::from_message(message)
}

/// Whether a recorded failure identifies an instrument the exchange does
/// not know.
pub fn is_invalid_symbol_error(kind: ErrorKind, message: &str) -> bool {
    let lower = message.to_lowercase();
    kind == ErrorKind::Api && (lower.contains("1121") || lower.contains("invalid symbol"))
}

struct State {
    stats: ErrorStatistics,
    history: VecDeque<ErrorRecord>,
}

pub struct ErrorAggregator {
    storage: Storage,
    stats_path: PathBuf,
    state: Mutex<State>,
}

#[derive(Serialize)]
struct Report<'a> {
    generated_at: chrono::DateTime<Utc>,
    statistics: &'a ErrorStatistics,
    recent_errors: Vec<&'a ErrorRecord>,
}

impl ErrorAggregator {
    /// Load the durable document; a missing or unreadable one starts empty.
    pub fn open(storage: Storage) -> Self {
        let stats_path = storage.layout().error_statistics_file();
        let stats = load_statistics(&stats_path);
        info!(
            path = %stats_path.display(),
            total_errors = stats.total_errors,
            "Error aggregator ready"
        );
        Self {
            storage,
            stats_path,
            state: Mutex::new(State {
                stats,
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
            }),
        }
    }

    /// Build a record and merge it. `kind` falls back to text classification.
    pub fn record_failure(
        &self,
        symbol: &Symbol,
        kind: Option<ErrorKind>,
        message: impl Into<String>,
        source: ErrorSource,
        retry_count: u32,
    ) -> ErrorRecord {
        let message = message.into();
        let record = ErrorRecord {
            symbol: symbol.clone(),
            kind: kind.unwrap_or_else(|| classify(&message)),
            message,
            timestamp: Utc::now(),
            source,
            retry_count,
        };
        self.record(record.clone());
        record
    }

    /// Merge `record` into the aggregate and persist it.
    ///
    /// Persistence problems are logged, never returned: the caller's only
    /// outcome for a failed symbol is "no result".
    pub fn record(&self, record: ErrorRecord) {
        error!(
            symbol = %record.symbol,
            kind = %record.kind,
            source = %record.source,
            retry_count = record.retry_count,
            reason = %record.message,
            "Unresolved failure"
        );
        Metrics::failure_recorded(record.kind.as_str(), record.source.as_str());

        if let Err(e) = self.storage.write_error_event(&record) {
            warn!(symbol = %record.symbol, error = %e, "Failed to write error event");
        }

        let mut state = self.state.lock();
        state.stats.merge(&record);
        if let Err(e) = write_json_atomic(&self.stats_path, &state.stats) {
            warn!(path = %self.stats_path.display(), error = %e, "Failed to persist error statistics");
        }
        state.history.push_back(record);
        while state.history.len() > HISTORY_CAPACITY {
            state.history.pop_front();
        }
    }

    pub fn statistics(&self) -> ErrorStatistics {
        self.state.lock().stats.clone()
    }

    /// Up to `limit` most recent in-memory records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Drop in-memory records older than `days`. Durable counters are kept.
    pub fn clear_older_than(&self, days: u32) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let mut state = self.state.lock();
        let before = state.history.len();
        state.history.retain(|r| r.timestamp >= cutoff);
        let removed = before - state.history.len();
        if removed > 0 {
            debug!(removed, days, "Cleared old in-memory error records");
        }
        removed
    }

    /// Write statistics and the latest records to `path` as JSON.
    pub fn export_report(&self, path: &Path) -> AggregatorResult<()> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(REPORT_RECORDS);
        let report = Report {
            generated_at: Utc::now(),
            statistics: &state.stats,
            recent_errors: state.history.iter().skip(skip).collect(),
        };
        write_json_atomic(path, &report)?;
        info!(path = %path.display(), "Exported error report");
        Ok(())
    }

    /// Symbols whose recorded details show an unknown-instrument failure.
    pub fn invalid_symbols(&self) -> BTreeSet<Symbol> {
        self.state
            .lock()
            .stats
            .details
            .iter()
            .filter(|d| is_invalid_symbol_error(d.error_type, &d.error_message))
            .map(|d| d.symbol.clone())
            .collect()
    }
}

fn load_statistics(path: &Path) -> ErrorStatistics {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ErrorStatistics::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read error statistics, starting empty");
            return ErrorStatistics::default();
        }
    };
    serde_json::from_str(&text).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Corrupt error statistics, starting empty");
        ErrorStatistics::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    fn aggregator(dir: &TempDir) -> ErrorAggregator {
        ErrorAggregator::open(Storage::open(dir.path()).unwrap())
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("connection timeout after 5s"), ErrorKind::Timeout);
        assert_eq!(classify("HTTP 429 Too Many Requests"), ErrorKind::RateLimit);
        assert_eq!(classify("something odd"), ErrorKind::Unknown);
    }

    #[test]
    fn test_record_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let agg = aggregator(&dir);
        agg.record_failure(
            &sym("BUSDT"),
            Some(ErrorKind::Api),
            "invalid symbol (api code -1121)",
            ErrorSource::Realtime,
            1,
        );
        agg.record_failure(&sym("AUSDT"), None, "network unreachable", ErrorSource::History, 3);

        let reopened = aggregator(&dir);
        let stats = reopened.statistics();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.errors_by_type[&ErrorKind::Network], 1);
        assert_eq!(stats.count_for(&sym("BUSDT")), 1);
        assert!(reopened.recent(10).is_empty());
        assert_eq!(reopened.invalid_symbols(), BTreeSet::from([sym("BUSDT")]));

        let events = fs::read_dir(dir.path().join("errors")).unwrap().count();
        assert_eq!(events, 1);
    }

    #[test]
    fn test_corrupt_document_starts_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("error_statistics.json"), "{not json").unwrap();
        assert_eq!(aggregator(&dir).statistics(), ErrorStatistics::default());
    }

    #[test]
    fn test_concurrent_records_are_all_counted() {
        let dir = TempDir::new().unwrap();
        let agg = Arc::new(aggregator(&dir));

        std::thread::scope(|s| {
            for worker in 0..8 {
                let agg = Arc::clone(&agg);
                s.spawn(move || {
                    for _ in 0..10 {
                        agg.record_failure(
                            &sym(&format!("S{worker}USDT")),
                            Some(ErrorKind::Timeout),
                            "timed out",
                            ErrorSource::Realtime,
                            3,
                        );
                    }
                });
            }
        });

        assert_eq!(agg.statistics().total_errors, 80);
        let on_disk: ErrorStatistics = serde_json::from_str(
            &fs::read_to_string(dir.path().join("error_statistics.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk.total_errors, 80);
        assert_eq!(on_disk.count_for(&sym("S3USDT")), 10);
    }

    #[test]
    fn test_recent_clear_and_export() {
        let dir = TempDir::new().unwrap();
        let agg = aggregator(&dir);
        for i in 0..5 {
            agg.record_failure(&sym("AUSDT"), Some(ErrorKind::Data), format!("bad json {i}"), ErrorSource::History, 1);
        }
        let mut old = agg.recent(1).remove(0);
        old.timestamp = Utc::now() - ChronoDuration::days(10);
        agg.record(old);

        let recent = agg.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "bad json 4");

        assert_eq!(agg.clear_older_than(7), 1);
        assert_eq!(agg.recent(100).len(), 5);

        let report = dir.path().join("report.json");
        agg.export_report(&report).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(report).unwrap()).unwrap();
        assert_eq!(value["statistics"]["total_errors"], 6);
        assert_eq!(value["recent_errors"].as_array().unwrap().len(), 5);
    }
}
