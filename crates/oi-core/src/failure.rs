//! Failure taxonomy shared by the client, aggregator and dispatcher.

use crate::symbol::Symbol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failed acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "network_error")]
    Network,
    #[serde(rename = "api_error")]
    Api,
    #[serde(rename = "timeout_error")]
    Timeout,
    #[serde(rename = "rate_limit_error")]
    RateLimit,
    #[serde(rename = "data_error")]
    Data,
    #[serde(rename = "unknown_error")]
    Unknown,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Stable label used in JSON documents and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network_error",
            Self::Api => "api_error",
            Self::Timeout => "timeout_error",
            Self::RateLimit => "rate_limit_error",
            Self::Data => "data_error",
            Self::Unknown => "unknown_error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify free text by ordered substring inspection.
    ///
    /// Priority: timeout > rate limit > network > api > data > unknown.
    /// Only used when no structured kind was attached at the failure site.
    pub fn from_message(message: &str) -> Self {
        const RULES: &[(ErrorKind, &[&str])] = &[
            (ErrorKind::Timeout, &["timeout", "time out", "timed out"]),
            (ErrorKind::RateLimit, &["rate limit", "too many requests"]),
            (ErrorKind::Network, &["network", "connection"]),
            (ErrorKind::Api, &["api", "400", "500"]),
            (ErrorKind::Data, &["data", "json"]),
        ];

        let lower = message.to_lowercase();
        RULES
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    /// Multiplier applied to the exponential backoff delay.
    pub fn backoff_factor(&self) -> f64 {
        match self {
            Self::RateLimit => 2.0,
            Self::Timeout => 1.5,
            _ => 1.0,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pipeline produced the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSource {
    Realtime,
    History,
}

impl ErrorSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::History => "history",
        }
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unresolved failure. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub symbol: Symbol,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub source: ErrorSource,
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels_match_serde() {
        for kind in [
            ErrorKind::Network,
            ErrorKind::Api,
            ErrorKind::Timeout,
            ErrorKind::RateLimit,
            ErrorKind::Data,
            ErrorKind::Unknown,
            ErrorKind::Cancelled,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_from_message_priority() {
        assert_eq!(
            ErrorKind::from_message("connection timeout after 5s"),
            ErrorKind::Timeout
        );
        assert_eq!(
            ErrorKind::from_message("Too Many Requests on connection"),
            ErrorKind::RateLimit
        );
        assert_eq!(
            ErrorKind::from_message("connection reset by peer"),
            ErrorKind::Network
        );
        assert_eq!(ErrorKind::from_message("HTTP 500 from api"), ErrorKind::Api);
        assert_eq!(ErrorKind::from_message("bad json body"), ErrorKind::Data);
        assert_eq!(ErrorKind::from_message("boom"), ErrorKind::Unknown);
    }

    #[test]
    fn test_backoff_factor() {
        assert_eq!(ErrorKind::RateLimit.backoff_factor(), 2.0);
        assert_eq!(ErrorKind::Timeout.backoff_factor(), 1.5);
        assert_eq!(ErrorKind::Network.backoff_factor(), 1.0);
    }
}
