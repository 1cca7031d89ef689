//! Durable error statistics document (`error_statistics.json`).

use chrono::{DateTime, Utc};
use oi_core::{ErrorKind, ErrorRecord, ErrorSource, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Detail entries kept in the document.
pub const MAX_DETAILS: usize = 200;

/// Longest message stored in a detail entry, in characters.
pub const MAX_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub symbol: Symbol,
    pub error_type: ErrorKind,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub source: ErrorSource,
}

impl From<&ErrorRecord> for ErrorDetail {
    fn from(record: &ErrorRecord) -> Self {
        Self {
            symbol: record.symbol.clone(),
            error_type: record.kind,
            error_message: record.message.chars().take(MAX_MESSAGE_CHARS).collect(),
            timestamp: record.timestamp,
            retry_count: record.retry_count,
            source: record.source,
        }
    }
}

/// Aggregate counters plus the most recent details.
///
/// Counters only grow. `fallback_usage` and `resolved_errors` are carried
/// in the document but nothing increments them: a failure never yields
/// substitute data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub errors_by_type: BTreeMap<ErrorKind, u64>,
    pub errors_by_symbol: BTreeMap<Symbol, u64>,
    pub errors_by_source: BTreeMap<ErrorSource, u64>,
    pub details: VecDeque<ErrorDetail>,
    pub fallback_usage: u64,
    pub resolved_errors: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl ErrorStatistics {
    /// Merge one record into the counters and the detail ring.
    pub fn merge(&mut self, record: &ErrorRecord) {
        self.total_errors += 1;
        *self.errors_by_type.entry(record.kind).or_default() += 1;
        *self
            .errors_by_symbol
            .entry(record.symbol.clone())
            .or_default() += 1;
        *self.errors_by_source.entry(record.source).or_default() += 1;

        self.details.push_back(ErrorDetail::from(record));
        while self.details.len() > MAX_DETAILS {
            self.details.pop_front();
        }
        self.last_updated = Some(Utc::now());
    }

    pub fn count_for(&self, symbol: &Symbol) -> u64 {
        self.errors_by_symbol.get(symbol).copied().unwrap_or(0)
    }
}
