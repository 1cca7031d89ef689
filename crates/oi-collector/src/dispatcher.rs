//! Concurrent snapshot batches.
//!
//! One capture timestamp per batch, one task per symbol, a semaphore
//! bounding how many run at once. A failing symbol never affects its
//! siblings; cancellation stops collection and leaves the rest unattempted.

use oi_aggregator::ErrorAggregator;
use oi_client::OiClient;
use oi_core::time::{now_ms, truncate_to_minute};
use oi_core::{ErrorSource, Symbol};
use oi_persistence::{BatchSummary, Storage};
use oi_telemetry::Metrics;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hard ceiling on concurrent snapshot tasks.
pub const MAX_POOL_SIZE: usize = 32;

/// min(override, 2 x parallelism, 32, symbol count), never below 1.
pub fn pool_size(override_workers: Option<usize>, parallelism: usize, symbols: usize) -> usize {
    let mut size = (parallelism * 2).min(MAX_POOL_SIZE).min(symbols);
    if let Some(workers) = override_workers {
        size = size.min(workers);
    }
    size.max(1)
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Result of one snapshot batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Attempted symbols only; unattempted ones are absent.
    pub results: BTreeMap<Symbol, bool>,
    pub captured_at_ms: i64,
    pub duration: Duration,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub interrupted: bool,
}

impl BatchOutcome {
    pub fn failed(&self) -> Vec<Symbol> {
        self.results
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(s, _)| s.clone())
            .collect()
    }

    fn summary(&self) -> BatchSummary {
        BatchSummary {
            timestamp: chrono::Utc::now(),
            duration_secs: self.duration.as_secs_f64(),
            processed: self.processed,
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed(),
            interrupted: self.interrupted,
        }
    }
}

#[derive(Clone)]
pub struct SnapshotDispatcher {
    client: OiClient,
    storage: Storage,
    aggregator: Arc<ErrorAggregator>,
    max_workers: Option<usize>,
    shutdown: CancellationToken,
}

impl SnapshotDispatcher {
    pub fn new(
        client: OiClient,
        storage: Storage,
        aggregator: Arc<ErrorAggregator>,
        max_workers: Option<usize>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            storage,
            aggregator,
            max_workers,
            shutdown,
        }
    }

    /// Fetch and persist one symbol's snapshot stamped `timestamp_ms`.
    ///
    /// Returns whether a record was written. Failures are routed to the
    /// aggregator and never propagate.
    pub async fn collect_one(&self, symbol: &Symbol, timestamp_ms: i64) -> bool {
        let record = match self.client.fetch_current(symbol, Some(timestamp_ms)).await {
            Ok(record) => record,
            Err(e) => {
                self.aggregator.record_failure(
                    symbol,
                    Some(e.kind()),
                    e.to_string(),
                    ErrorSource::Realtime,
                    e.attempts().saturating_sub(1),
                );
                return false;
            }
        };

        match self.storage.append_snapshot(&record) {
            Ok(outcome) => {
                Metrics::snapshot_written();
                if outcome.rotated_to.is_some() {
                    Metrics::live_file_rotated();
                }
                debug!(symbol = %symbol, oi = %record.open_interest, "Snapshot stored");
                true
            }
            Err(e) => {
                self.aggregator.record_failure(
                    symbol,
                    None,
                    format!("failed to persist snapshot: {e}"),
                    ErrorSource::Realtime,
                    0,
                );
                false
            }
        }
    }

    /// Run one batch over `symbols` with a shared capture timestamp.
    pub async fn run_batch(&self, symbols: &[Symbol]) -> BatchOutcome {
        let started = Instant::now();
        let captured_at_ms = truncate_to_minute(now_ms());
        let workers = pool_size(self.max_workers, available_parallelism(), symbols.len());
        info!(symbols = symbols.len(), workers, captured_at_ms, "Snapshot batch started");

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<Symbol> = BTreeSet::new();
        let mut interrupted = false;

        for symbol in symbols {
            if self.shutdown.is_cancelled() {
                interrupted = true;
                break;
            }
            if !pending.insert(symbol.clone()) {
                continue;
            }
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let symbol = symbol.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (symbol, None);
                };
                if this.shutdown.is_cancelled() {
                    return (symbol, None);
                }
                let ok = this.collect_one(&symbol, captured_at_ms).await;
                (symbol, Some(ok))
            });
        }

        let mut results = BTreeMap::new();
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    interrupted = true;
                    // Keep what already finished; leave the rest running detached.
                    while let Some(joined) = tasks.try_join_next() {
                        absorb(joined, &mut results, &mut pending);
                    }
                    tasks.detach_all();
                    pending.clear();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(joined) => {
                        if !absorb(joined, &mut results, &mut pending) {
                            interrupted = true;
                        }
                    }
                },
            }
        }

        // Tasks that panicked never reported back.
        for symbol in pending {
            results.insert(symbol, false);
        }

        let succeeded = results.values().filter(|ok| **ok).count();
        let outcome = BatchOutcome {
            processed: results.len(),
            succeeded,
            results,
            captured_at_ms,
            duration: started.elapsed(),
            total: symbols.len(),
            interrupted,
        };

        Metrics::batch_completed(outcome.duration.as_secs_f64());
        if let Err(e) = self.storage.append_batch_summary(&outcome.summary()) {
            warn!(error = %e, "Failed to append batch summary");
        }
        info!(
            processed = outcome.processed,
            succeeded = outcome.succeeded,
            total = outcome.total,
            interrupted = outcome.interrupted,
            duration_ms = outcome.duration.as_millis() as u64,
            "Snapshot batch finished"
        );
        outcome
    }
}

/// Fold one finished task into `results`. Returns false when the task
/// skipped its symbol because of shutdown.
fn absorb(
    joined: Result<(Symbol, Option<bool>), JoinError>,
    results: &mut BTreeMap<Symbol, bool>,
    pending: &mut BTreeSet<Symbol>,
) -> bool {
    match joined {
        Ok((symbol, attempted)) => {
            pending.remove(&symbol);
            match attempted {
                Some(ok) => {
                    results.insert(symbol, ok);
                    true
                }
                None => false,
            }
        }
        Err(e) => {
            error!(error = %e, "Snapshot task panicked");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oi_client::{FetchError, RawResponse, RetryPolicy, ScriptedTransport};
    use tempfile::TempDir;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    fn dispatcher(
        dir: &TempDir,
        transport: Arc<ScriptedTransport>,
        shutdown: CancellationToken,
    ) -> (SnapshotDispatcher, Arc<ErrorAggregator>) {
        let storage = Storage::open(dir.path()).unwrap();
        let aggregator = Arc::new(ErrorAggregator::open(storage.clone()));
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let client = OiClient::new(transport, policy, shutdown.clone());
        (
            SnapshotDispatcher::new(client, storage, Arc::clone(&aggregator), Some(4), shutdown),
            aggregator,
        )
    }

    #[test]
    fn test_pool_size() {
        assert_eq!(pool_size(None, 8, 100), 16);
        assert_eq!(pool_size(None, 64, 100), 32);
        assert_eq!(pool_size(None, 8, 3), 3);
        assert_eq!(pool_size(Some(2), 8, 100), 2);
        assert_eq!(pool_size(Some(64), 8, 100), 16);
        assert_eq!(pool_size(None, 8, 0), 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new(|call| {
            match (call.path.as_str(), call.param("symbol")) {
                ("/fapi/v1/openInterest", Some("FAILUSDT")) => {
                    Err(FetchError::Network("connection reset".to_string()))
                }
                ("/fapi/v1/openInterest", _) => Ok(RawResponse::ok(r#"{"openInterest":"5"}"#)),
                _ => Ok(RawResponse::ok(r#"{"markPrice":"2"}"#)),
            }
        }));
        let (dispatcher, aggregator) = dispatcher(&dir, transport.clone(), CancellationToken::new());

        let symbols = vec![sym("AUSDT"), sym("FAILUSDT"), sym("CUSDT")];
        let outcome = dispatcher.run_batch(&symbols).await;

        assert!(outcome.results[&sym("AUSDT")]);
        assert!(!outcome.results[&sym("FAILUSDT")]);
        assert!(outcome.results[&sym("CUSDT")]);
        assert_eq!((outcome.processed, outcome.succeeded), (3, 2));
        assert!(!outcome.interrupted);
        assert_eq!(outcome.captured_at_ms % 60_000, 0);

        let stats = aggregator.statistics();
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.details[0].retry_count, 2);
        assert_eq!(
            transport
                .calls()
                .iter()
                .filter(|c| c.param("symbol") == Some("FAILUSDT"))
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn test_shared_capture_timestamp() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new(|call| {
            if call.path == "/fapi/v1/openInterest" {
                Ok(RawResponse::ok(r#"{"openInterest":"1"}"#))
            } else {
                Ok(RawResponse::ok(r#"{"markPrice":"1"}"#))
            }
        }));
        let (dispatcher, _) = dispatcher(&dir, transport, CancellationToken::new());
        let outcome = dispatcher.run_batch(&[sym("AUSDT"), sym("BUSDT")]).await;

        let day = oi_core::DayKey::from_timestamp_ms(outcome.captured_at_ms).unwrap();
        let layout = oi_persistence::StorageLayout::new(dir.path());
        for s in ["AUSDT", "BUSDT"] {
            let text = std::fs::read_to_string(layout.live_file(&sym(s), day)).unwrap();
            let row = text.lines().nth(1).unwrap();
            assert!(row.starts_with(&format!("{},", outcome.captured_at_ms)));
        }
        let audit = std::fs::read_to_string(layout.batch_summary_file(
            oi_core::DayKey::from_timestamp_ms(now_ms()).unwrap(),
        ))
        .unwrap();
        assert_eq!(audit.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(RawResponse::ok("{}"))));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let (dispatcher, _) = dispatcher(&dir, transport.clone(), shutdown);

        let outcome = dispatcher.run_batch(&[sym("AUSDT"), sym("BUSDT")]).await;
        assert!(outcome.interrupted);
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.processed, 0);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_batch_keeps_finished_and_skips_in_flight() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(
            ScriptedTransport::new(|call| {
                if call.path == "/fapi/v1/openInterest" {
                    Ok(RawResponse::ok(r#"{"openInterest":"1"}"#))
                } else {
                    Ok(RawResponse::ok(r#"{"markPrice":"1"}"#))
                }
            })
            .with_latency(|call| match call.param("symbol") {
                Some("SLOWUSDT") => Duration::from_secs(30),
                _ => Duration::ZERO,
            }),
        );
        let shutdown = CancellationToken::new();
        let (dispatcher, aggregator) = dispatcher(&dir, transport.clone(), shutdown.clone());

        let canceller = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move {
                while transport.call_count("/fapi/v1/openInterest") < 2 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                shutdown.cancel();
            }
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.run_batch(&[sym("AUSDT"), sym("SLOWUSDT")]),
        )
        .await
        .unwrap();
        canceller.await.unwrap();

        assert!(outcome.interrupted);
        assert_eq!(outcome.results, BTreeMap::from([(sym("AUSDT"), true)]));
        assert_eq!((outcome.processed, outcome.succeeded, outcome.total), (1, 1, 2));
        assert_eq!(aggregator.statistics().total_errors, 0);

        let layout = oi_persistence::StorageLayout::new(dir.path());
        let audit = std::fs::read_to_string(layout.batch_summary_file(
            oi_core::DayKey::from_timestamp_ms(now_ms()).unwrap(),
        ))
        .unwrap();
        let row = audit.lines().nth(1).unwrap();
        assert!(row.ends_with(",1,2,1,,true"), "{row}");
    }

    #[tokio::test]
    async fn test_cancel_keeps_results_already_finished() {
        let dir = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        // The only task cancels the batch as it fetches and still finishes.
        let transport = Arc::new(ScriptedTransport::new({
            let shutdown = shutdown.clone();
            move |call| {
                if call.path == "/fapi/v1/openInterest" {
                    shutdown.cancel();
                    Ok(RawResponse::ok(r#"{"openInterest":"1"}"#))
                } else {
                    Ok(RawResponse::ok(r#"{"markPrice":"1"}"#))
                }
            }
        }));
        let (dispatcher, _) = dispatcher(&dir, transport, shutdown);

        let outcome = dispatcher.run_batch(&[sym("AUSDT")]).await;
        assert!(outcome.interrupted);
        assert_eq!(outcome.results, BTreeMap::from([(sym("AUSDT"), true)]));
        assert_eq!(outcome.succeeded, 1);
    }
}
