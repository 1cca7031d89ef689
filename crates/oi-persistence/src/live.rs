//! Append-only live snapshot files with size-based rotation.

use crate::error::PersistenceResult;
use crate::rows::{snapshot_row, HEADER};
use crate::storage::Storage;
use chrono::Local;
use oi_core::{DayKey, SnapshotRecord};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use tracing::{debug, info};

/// Result of one live append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub path: PathBuf,
    /// Where the previous file went, when this append rotated it.
    pub rotated_to: Option<PathBuf>,
}

impl Storage {
    /// Append one snapshot to its symbol's live file for the snapshot's UTC day.
    ///
    /// The header is written only when the file is created. A file already
    /// at or above the rotation threshold is renamed aside first, so the
    /// record lands in a fresh file under the original name.
    pub fn append_snapshot(&self, record: &SnapshotRecord) -> PersistenceResult<AppendOutcome> {
        let day = DayKey::from_timestamp_ms(record.timestamp_ms)?;
        let path = self.layout.live_file(&record.symbol, day);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let rotated_to = match fs::metadata(&path) {
            Ok(meta) if meta.len() >= self.rotate_bytes => {
                let target = self.rotation_target(record, day);
                fs::rename(&path, &target)?;
                info!(
                    symbol = %record.symbol,
                    from = %path.display(),
                    to = %target.display(),
                    size = meta.len(),
                    "Rotated live file"
                );
                Some(target)
            }
            _ => None,
        };

        let needs_header = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(HEADER)?;
        }
        writer.write_record(snapshot_row(record))?;
        writer.flush()?;

        debug!(symbol = %record.symbol, ts = record.timestamp_ms, "Appended snapshot");
        Ok(AppendOutcome { path, rotated_to })
    }

    fn rotation_target(&self, record: &SnapshotRecord, day: DayKey) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut target = self.layout.rotated_file(&record.symbol, day, &stamp);
        let mut n = 1;
        while target.exists() {
            target = self
                .layout
                .rotated_file(&record.symbol, day, &format!("{stamp}-{n}"));
            n += 1;
        }
        target
    }
}
