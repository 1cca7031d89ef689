//! Core domain types for the open-interest collector.
//!
//! This crate provides the types shared by every other crate:
//! - `Symbol`: validated, upper-cased instrument identifier
//! - `SnapshotRecord`, `HistoryPoint`: the two persisted record shapes
//! - `ErrorKind`, `ErrorSource`, `ErrorRecord`: failure taxonomy
//! - `time`: 5-minute slot, minute and UTC-day arithmetic on epoch millis

pub mod error;
pub mod failure;
pub mod record;
pub mod symbol;
pub mod time;

pub use error::{CoreError, Result};
pub use failure::{ErrorKind, ErrorRecord, ErrorSource};
pub use record::{HistoryPoint, SnapshotRecord};
pub use symbol::Symbol;
pub use time::{DayKey, HISTORY_STEP_MS, POINTS_PER_DAY};
