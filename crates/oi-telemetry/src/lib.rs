//! Prometheus metrics and structured logging for the open-interest collector.
//!
//! - Structured logging via `tracing` (pretty for development, JSON in production)
//! - Prometheus counters/histograms for requests, retries, failures, batches and files

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
