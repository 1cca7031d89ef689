//! Persistence error types.

use oi_core::CoreError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("invalid row in {path}: {reason}")]
    InvalidRow { path: PathBuf, reason: String },

    #[error("rejected day batch: {0}")]
    InvalidBatch(String),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
