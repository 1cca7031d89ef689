//! Acquisition client for exchange open-interest endpoints.
//!
//! - `OiClient`: current value, mark price, server time and 5-minute history
//! - `retry`: exponential backoff with fast-fail classification and
//!   cooperative cancellation
//! - `transport`: the HTTP seam (`reqwest` in production, scripted in tests)

pub mod client;
pub mod error;
pub mod retry;
pub mod transport;
mod wire;

pub use client::{OiClient, MAX_HISTORY_LIMIT};
pub use error::{FetchError, FetchResult};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use transport::{
    BoxFuture, HttpTransport, OiTransport, ProxyConfig, RawResponse, RecordedCall,
    ScriptedTransport,
};
pub use wire::INVALID_SYMBOL_CODE;
