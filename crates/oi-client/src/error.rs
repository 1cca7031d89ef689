//! Acquisition error types.
//!
//! Every variant carries its classification from the point of failure:
//! the transport tags timeouts and connection problems, the HTTP layer tags
//! status codes and application error codes, the decoder tags malformed
//! bodies. Only `Other` falls back to substring classification.

use oi_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network connection error: {0}")]
    Network(String),

    #[error("rate limited: HTTP {status}: {body}")]
    RateLimited { status: u16, body: String },

    #[error("server error: HTTP {status}: {body}")]
    Server { status: u16, body: String },

    #[error("client error: HTTP {status}, code={code:?}: {body}")]
    Client {
        status: u16,
        code: Option<i64>,
        body: String,
    },

    #[error("invalid symbol (api code {code}): {body}")]
    InvalidSymbol { code: i64, body: String },

    #[error("malformed response from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },

    #[error("{endpoint} failed after {attempts} attempts: {last}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last: Box<FetchError>,
    },

    #[error("retry cancelled by shutdown after {attempts} attempts: {last}")]
    Cancelled { attempts: u32, last: Box<FetchError> },

    #[error("HTTP client setup failed: {0}")]
    Setup(String),

    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Network(_) => ErrorKind::Network,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Server { .. } | Self::Client { .. } | Self::InvalidSymbol { .. } => ErrorKind::Api,
            Self::Malformed { .. } => ErrorKind::Data,
            Self::Exhausted { last, .. } => last.kind(),
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Setup(_) => ErrorKind::Unknown,
            Self::Other(msg) => ErrorKind::from_message(msg),
        }
    }

    /// Whether another attempt may succeed.
    ///
    /// Client errors, invalid instruments and malformed bodies never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_)
            | Self::Network(_)
            | Self::RateLimited { .. }
            | Self::Server { .. }
            | Self::Other(_) => true,
            Self::Client { .. }
            | Self::InvalidSymbol { .. }
            | Self::Malformed { .. }
            | Self::Exhausted { .. }
            | Self::Cancelled { .. }
            | Self::Setup(_) => false,
        }
    }

    /// Number of attempts consumed before this error surfaced.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
