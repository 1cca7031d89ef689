//! Write-to-temp-then-rename file replacement.

use crate::error::PersistenceResult;
use crate::layout::tmp_path;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Replace `path` with the bytes produced by `fill`.
///
/// Readers see either the previous file or the complete new one. The data
/// goes to `<path>.tmp`, is flushed and fsynced, then renamed over `path`.
/// If `fill` or any I/O step fails the temp file is removed and `path` is
/// left untouched.
pub fn write_atomic<F>(path: &Path, fill: F) -> PersistenceResult<()>
where
    F: FnOnce(&mut BufWriter<File>) -> PersistenceResult<()>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);

    let result = (|| -> PersistenceResult<()> {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        fill(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if let Err(e) = &result {
        warn!(path = %path.display(), error = %e, "Atomic write failed, discarding temp file");
        if let Err(rm) = fs::remove_file(&tmp) {
            if rm.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %rm, "Failed to remove temp file");
            }
        }
    } else {
        debug!(path = %path.display(), "Atomically replaced file");
    }
    result
}

/// `write_atomic` for a value serialized as pretty JSON.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> PersistenceResult<()> {
    write_atomic(path, |w| {
        serde_json::to_writer_pretty(&mut *w, value)?;
        w.write_all(b"\n")?;
        Ok(())
    })
}
