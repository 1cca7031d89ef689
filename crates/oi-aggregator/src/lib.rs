//! Error aggregation for the open-interest collector.
//!
//! Failures surfaced by the client (after its own retries) are classified,
//! logged, counted and persisted here. Nothing in this crate retries or
//! substitutes data.

pub mod aggregator;
pub mod error;
pub mod statistics;

pub use aggregator::{classify, is_invalid_symbol_error, ErrorAggregator};
pub use error::{AggregatorError, AggregatorResult};
pub use statistics::{ErrorDetail, ErrorStatistics, MAX_DETAILS};
