//! History day files: atomic whole-day replace and the read side used to
//! resume backfill.

use crate::atomic::write_atomic;
use crate::error::{PersistenceError, PersistenceResult};
use crate::rows::{history_row, parse_history_row, row_timestamp, HEADER};
use crate::storage::Storage;
use oi_core::time::is_aligned;
use oi_core::{DayKey, HistoryPoint, Symbol};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

impl Storage {
    /// Group `points` by UTC day and atomically replace each affected day
    /// file with that day's points. Returns the days written, ascending.
    ///
    /// Callers pass the complete set of a day's points; anything previously
    /// in the file is discarded.
    pub fn replace_history(
        &self,
        symbol: &Symbol,
        points: &[HistoryPoint],
    ) -> PersistenceResult<Vec<DayKey>> {
        let mut by_day: BTreeMap<DayKey, Vec<HistoryPoint>> = BTreeMap::new();
        for point in points {
            by_day
                .entry(DayKey::from_timestamp_ms(point.timestamp_ms)?)
                .or_default()
                .push(point.clone());
        }

        let mut written = Vec::with_capacity(by_day.len());
        for (day, day_points) in by_day {
            self.write_history_day(symbol, day, day_points)?;
            written.push(day);
        }
        Ok(written)
    }

    /// Atomically replace one (symbol, day) file.
    ///
    /// Points are sorted and de-duplicated by timestamp. Every point must
    /// belong to `symbol`, fall inside `day` and sit on the 5-minute grid.
    pub fn write_history_day(
        &self,
        symbol: &Symbol,
        day: DayKey,
        mut points: Vec<HistoryPoint>,
    ) -> PersistenceResult<PathBuf> {
        if let Some(bad) = points.iter().find(|p| {
            &p.symbol != symbol || !day.contains(p.timestamp_ms) || !is_aligned(p.timestamp_ms)
        }) {
            return Err(PersistenceError::InvalidBatch(format!(
                "point {} {} does not belong to {} {}",
                bad.symbol, bad.timestamp_ms, symbol, day
            )));
        }
        points.sort_by_key(|p| p.timestamp_ms);
        points.dedup_by_key(|p| p.timestamp_ms);

        let path = self.layout.history_file(symbol, day);
        write_atomic(&path, |w| {
            let mut writer = csv::Writer::from_writer(w);
            writer.write_record(HEADER)?;
            for point in &points {
                writer.write_record(history_row(point)?)?;
            }
            writer.flush()?;
            Ok(())
        })?;

        info!(symbol = %symbol, day = %day, points = points.len(), "Wrote history day file");
        Ok(path)
    }

    /// Delete the (symbol, day) file. Returns whether one existed.
    pub fn remove_history_day(&self, symbol: &Symbol, day: DayKey) -> PersistenceResult<bool> {
        let path = self.layout.history_file(symbol, day);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(symbol = %symbol, day = %day, "Removed history day file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a (symbol, day) file exists with at least one data row.
    pub fn history_day_exists(&self, symbol: &Symbol, day: DayKey) -> bool {
        let path = self.layout.history_file(symbol, day);
        match csv::Reader::from_path(&path) {
            Ok(mut reader) => reader.records().next().is_some_and(|r| r.is_ok()),
            Err(_) => false,
        }
    }

    /// All points stored for (symbol, day), ascending. Empty when absent.
    pub fn read_history_day(
        &self,
        symbol: &Symbol,
        day: DayKey,
    ) -> PersistenceResult<Vec<HistoryPoint>> {
        let path = self.layout.history_file(symbol, day);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)?;
        let mut points = Vec::new();
        for row in reader.records() {
            points.push(parse_history_row(symbol, &row?, &path)?);
        }
        points.sort_by_key(|p| p.timestamp_ms);
        Ok(points)
    }

    /// Newest persisted history timestamp for `symbol`.
    ///
    /// Scans day files newest-modified first (file name breaks ties) and
    /// returns the leading field of the last row that has a numeric one.
    /// Unreadable files are skipped.
    pub fn last_history_timestamp(&self, symbol: &Symbol) -> PersistenceResult<Option<i64>> {
        let dir = self.layout.history_dir(symbol);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, path));
        }
        files.sort_by(|a, b| b.cmp(a));

        for (_, path) in files {
            match last_row_timestamp(&path) {
                Ok(Some(ts)) => {
                    debug!(symbol = %symbol, file = %path.display(), ts, "Found continuation cursor");
                    return Ok(Some(ts));
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unreadable history file");
                }
            }
        }
        Ok(None)
    }
}

fn last_row_timestamp(path: &Path) -> PersistenceResult<Option<i64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut last = None;
    for row in reader.records() {
        if let Some(ts) = row_timestamp(&row?) {
            last = Some(ts);
        }
    }
    Ok(last)
}
