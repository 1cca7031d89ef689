//! File-backed store for snapshots, history days and audit records.

use crate::error::PersistenceResult;
use crate::layout::StorageLayout;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Live files at or above this size are rotated before the next append.
pub const DEFAULT_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

/// Entry point for every persisted artifact under one data directory.
///
/// Per-symbol files have a single logical writer at a time, so no locking
/// happens here; history days rely on atomic rename for consistency.
#[derive(Debug, Clone)]
pub struct Storage {
    pub(crate) layout: StorageLayout,
    pub(crate) rotate_bytes: u64,
}

impl Storage {
    /// Open (creating if needed) the data directory.
    pub fn open(root: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let layout = StorageLayout::new(root);
        fs::create_dir_all(layout.root())?;
        info!(root = %layout.root().display(), "Storage opened");
        Ok(Self {
            layout,
            rotate_bytes: DEFAULT_ROTATE_BYTES,
        })
    }

    pub fn with_rotate_bytes(mut self, bytes: u64) -> Self {
        self.rotate_bytes = bytes.max(1);
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }
}
