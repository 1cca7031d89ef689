//! Batch audit log and per-event error documents.

use crate::atomic::write_json_atomic;
use crate::error::PersistenceResult;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use oi_core::{DayKey, ErrorRecord, Symbol};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use tracing::debug;

const SUMMARY_HEADER: [&str; 7] = [
    "timestamp",
    "duration_seconds",
    "processed_count",
    "total_symbols",
    "success_count",
    "failed_symbols",
    "interrupted",
];

/// One dispatcher run, as recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub timestamp: DateTime<Utc>,
    pub duration_secs: f64,
    pub processed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<Symbol>,
    pub interrupted: bool,
}

impl Storage {
    /// Append a row to the day's `batch_summary` CSV.
    pub fn append_batch_summary(&self, summary: &BatchSummary) -> PersistenceResult<PathBuf> {
        let day = DayKey::new(summary.timestamp.date_naive());
        let path = self.layout.batch_summary_file(day);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let needs_header = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(SUMMARY_HEADER)?;
        }

        let failed = summary
            .failed
            .iter()
            .map(Symbol::as_str)
            .collect::<Vec<_>>()
            .join(";");
        writer.write_record([
            summary.timestamp.to_rfc3339(),
            format!("{:.3}", summary.duration_secs),
            summary.processed.to_string(),
            summary.total.to_string(),
            summary.succeeded.to_string(),
            failed,
            summary.interrupted.to_string(),
        ])?;
        writer.flush()?;
        Ok(path)
    }

    /// Persist one error event as its own JSON document.
    pub fn write_error_event(&self, record: &ErrorRecord) -> PersistenceResult<PathBuf> {
        let path = self.layout.error_event_file(&record.symbol, record.timestamp);
        write_json_atomic(&path, record)?;
        debug!(symbol = %record.symbol, path = %path.display(), "Wrote error event");
        Ok(path)
    }
}
