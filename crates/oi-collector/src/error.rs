//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] oi_client::FetchError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] oi_persistence::PersistenceError),

    #[error("Aggregator error: {0}")]
    Aggregator(#[from] oi_aggregator::AggregatorError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] oi_telemetry::TelemetryError),

    #[error("Domain error: {0}")]
    Core(#[from] oi_core::CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
