//! Startup cleanup, retention sweep and storage statistics.

use crate::error::PersistenceResult;
use crate::layout::{is_rotated_name, ERRORS_DIR, LOGS_DIR, OPEN_INTEREST_DIR, TMP_SUFFIX};
use crate::storage::Storage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const MANAGED_DIRS: [&str; 3] = [OPEN_INTEREST_DIR, ERRORS_DIR, LOGS_DIR];

/// File count and size of one top-level directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirStats {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub dirs: BTreeMap<String, DirStats>,
    pub total: DirStats,
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

impl Storage {
    /// Remove `*.tmp` files left behind by an interrupted day replace.
    pub fn cleanup_temp_files(&self) -> PersistenceResult<usize> {
        let mut files = Vec::new();
        walk_files(self.root(), &mut files)?;

        let mut removed = 0;
        for path in files
            .iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(TMP_SUFFIX))
        {
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
            }
        }
        if removed > 0 {
            info!(removed, "Removed stale temp files");
        }
        Ok(removed)
    }

    /// Delete data, error and log files not modified within `retention_days`.
    ///
    /// Rotated live files go first. The error statistics document is never
    /// touched. Returns the number of files deleted.
    pub fn sweep_retention(&self, retention_days: u32) -> PersistenceResult<usize> {
        let max_age = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut files = Vec::new();
        for dir in MANAGED_DIRS {
            walk_files(&self.root().join(dir), &mut files)?;
        }

        let mut expired: Vec<(bool, PathBuf)> = files
            .into_iter()
            .filter(|p| {
                fs::metadata(p)
                    .and_then(|m| m.modified())
                    .map(|t| t < cutoff)
                    .unwrap_or(false)
            })
            .map(|p| (!is_rotated_name(file_name(&p)), p))
            .collect();
        expired.sort();

        let mut deleted = 0;
        for (_, path) in expired {
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete expired file"),
            }
        }
        info!(deleted, retention_days, "Retention sweep finished");
        Ok(deleted)
    }

    pub fn storage_stats(&self) -> PersistenceResult<StorageStats> {
        let mut stats = StorageStats::default();
        for dir in MANAGED_DIRS {
            let mut files = Vec::new();
            walk_files(&self.root().join(dir), &mut files)?;
            let mut entry = DirStats::default();
            for path in files {
                entry.files += 1;
                entry.bytes += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            }
            stats.total.files += entry.files;
            stats.total.bytes += entry.bytes;
            stats.dirs.insert(dir.to_string(), entry);
        }
        Ok(stats)
    }
}
