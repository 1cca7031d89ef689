//! Open-interest collector.
//!
//! Orchestrates the components:
//! - snapshot batches fanned out over a bounded worker pool
//! - continuous history backfill resumed from what is on disk
//! - configuration, run modes and shutdown wiring

pub mod app;
pub mod backfill;
pub mod config;
pub mod dispatcher;
pub mod error;

pub use app::Application;
pub use backfill::{BackfillSettings, BackfillStop, BackfillWorker, CycleReport, Horizon, SymbolBackfill};
pub use config::AppConfig;
pub use dispatcher::{BatchOutcome, SnapshotDispatcher};
pub use error::{AppError, AppResult};
