//! Aggregator error types.

use oi_persistence::PersistenceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("failed to persist error report: {0}")]
    Persistence(#[from] PersistenceError),
}

pub type AggregatorResult<T> = Result<T, AggregatorError>;
