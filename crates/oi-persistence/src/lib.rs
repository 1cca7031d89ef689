//! File persistence for the open-interest collector.
//!
//! Two write modes:
//! - append: live snapshots, header on creation, size-based rotation
//! - atomic replace: history day files written to a temp file and renamed
//!
//! Plus the read side used to resume backfill, the batch audit log,
//! per-event error documents, retention and temp-file cleanup.

pub mod atomic;
pub mod audit;
pub mod error;
pub mod history;
pub mod layout;
pub mod live;
pub mod maintenance;
mod rows;
pub mod storage;

pub use atomic::{write_atomic, write_json_atomic};
pub use audit::BatchSummary;
pub use error::{PersistenceError, PersistenceResult};
pub use layout::StorageLayout;
pub use live::AppendOutcome;
pub use maintenance::{DirStats, StorageStats};
pub use storage::{Storage, DEFAULT_ROTATE_BYTES};
