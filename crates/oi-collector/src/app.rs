//! Application wiring and run modes.

use crate::backfill::{BackfillSettings, BackfillWorker};
use crate::config::AppConfig;
use crate::dispatcher::{BatchOutcome, SnapshotDispatcher};
use crate::error::AppResult;
use oi_aggregator::ErrorAggregator;
use oi_client::{HttpTransport, OiClient, OiTransport};
use oi_core::time::{now_ms, truncate_to_minute};
use oi_core::{DayKey, Symbol};
use oi_persistence::Storage;
use oi_telemetry::Metrics;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// In-memory error records older than this are dropped by daily maintenance.
const ERROR_HISTORY_DAYS: u32 = 7;

pub struct Application {
    config: AppConfig,
    symbols: Vec<Symbol>,
    client: OiClient,
    storage: Storage,
    aggregator: Arc<ErrorAggregator>,
    shutdown: CancellationToken,
}

impl Application {
    /// Build with the `reqwest` transport described by `config`.
    pub fn new(config: AppConfig, shutdown: CancellationToken) -> AppResult<Self> {
        let transport = HttpTransport::new(&config.base_url, config.request_timeout(), &config.proxy)?;
        Self::with_transport(config, Arc::new(transport), shutdown)
    }

    pub fn with_transport(
        config: AppConfig,
        transport: Arc<dyn OiTransport>,
        shutdown: CancellationToken,
    ) -> AppResult<Self> {
        config.validate()?;
        let symbols = config.parsed_symbols()?;

        let storage = Storage::open(&config.data_dir)?;
        storage.cleanup_temp_files()?;
        let aggregator = Arc::new(ErrorAggregator::open(storage.clone()));
        let client = OiClient::new(transport, config.retry_policy(), shutdown.clone());

        info!(
            symbols = symbols.len(),
            data_dir = %config.data_dir.display(),
            base_url = %config.base_url,
            "Application initialized"
        );
        Ok(Self {
            config,
            symbols,
            client,
            storage,
            aggregator,
            shutdown,
        })
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn aggregator(&self) -> &Arc<ErrorAggregator> {
        &self.aggregator
    }

    pub fn dispatcher(&self) -> SnapshotDispatcher {
        SnapshotDispatcher::new(
            self.client.clone(),
            self.storage.clone(),
            Arc::clone(&self.aggregator),
            self.config.max_workers,
            self.shutdown.clone(),
        )
    }

    pub fn backfill_worker(&self, shutdown: CancellationToken) -> BackfillWorker {
        BackfillWorker::new(
            self.client.clone(),
            self.storage.clone(),
            Arc::clone(&self.aggregator),
            self.symbols.clone(),
            BackfillSettings::from(&self.config.backfill),
            shutdown,
        )
    }

    /// One snapshot batch over every configured symbol.
    pub async fn run_once(&self) -> BatchOutcome {
        self.dispatcher().run_batch(&self.symbols).await
    }

    /// Default mode: background backfill plus a snapshot batch on every
    /// interval boundary, until shutdown.
    pub async fn run(&self) -> AppResult<()> {
        let interval = Duration::from_secs(self.config.snapshot_interval_secs);
        let backfill_token = self.shutdown.child_token();
        let worker = self.backfill_worker(backfill_token.clone());
        let backfill = tokio::spawn(async move { worker.run().await });
        let dispatcher = self.dispatcher();

        info!(interval_secs = interval.as_secs(), "Scheduler started");
        let mut maintained: Option<DayKey> = None;
        loop {
            let today = DayKey::from_timestamp_ms(now_ms())?;
            if maintained != Some(today) {
                self.run_maintenance();
                maintained = Some(today);
            }
            if !sleep_until_next_tick(interval, &self.shutdown).await {
                break;
            }
            dispatcher.run_batch(&self.symbols).await;
        }

        backfill_token.cancel();
        if let Err(e) = backfill.await {
            warn!(error = %e, "Backfill task ended abnormally");
        }
        info!("Scheduler stopped");
        Ok(())
    }

    /// Sequential mode: every whole minute, collect each symbol in turn,
    /// for `hours` hours.
    pub async fn run_for_hours(&self, hours: f64) -> AppResult<()> {
        let deadline = Instant::now() + Duration::from_secs_f64(hours.max(0.0) * 3600.0);
        let dispatcher = self.dispatcher();
        info!(hours, symbols = self.symbols.len(), "Continuous collection started");

        let mut rounds = 0u64;
        while Instant::now() < deadline {
            if !sleep_until_next_tick(Duration::from_secs(60), &self.shutdown).await {
                break;
            }
            let ts = truncate_to_minute(now_ms());
            let mut succeeded = 0usize;
            for symbol in &self.symbols {
                if self.shutdown.is_cancelled() {
                    break;
                }
                if dispatcher.collect_one(symbol, ts).await {
                    succeeded += 1;
                }
            }
            rounds += 1;
            info!(round = rounds, ts, succeeded, total = self.symbols.len(), "Collection round finished");
        }
        info!(rounds, "Continuous collection stopped");
        Ok(())
    }

    /// Run only the backfill worker for `minutes`, then stop it.
    pub async fn run_history_only(&self, minutes: u64) -> AppResult<()> {
        let token = self.shutdown.child_token();
        let worker = self.backfill_worker(token.clone());
        let handle = tokio::spawn(async move { worker.run().await });
        info!(minutes, "History-only mode started");

        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {}
            () = self.shutdown.cancelled() => {}
        }
        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Backfill task ended abnormally");
        }
        Ok(())
    }

    fn run_maintenance(&self) {
        if let Err(e) = self.storage.sweep_retention(self.config.retention_days) {
            warn!(error = %e, "Retention sweep failed");
        }
        self.aggregator.clear_older_than(ERROR_HISTORY_DAYS);
    }
}

/// Sleep until the next multiple of `interval` since the epoch.
///
/// Returns `false` when shutdown interrupted the wait.
pub async fn sleep_until_next_tick(interval: Duration, shutdown: &CancellationToken) -> bool {
    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1);
    let now = now_ms();
    let next = (now / interval_ms + 1) * interval_ms;
    let wait = Duration::from_millis(u64::try_from(next - now).unwrap_or(0));

    tokio::select! {
        () = tokio::time::sleep(wait) => !shutdown.is_cancelled(),
        () = shutdown.cancelled() => false,
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
pub fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Shutdown signal received");
        shutdown.cancel();
    });
}

/// Storage statistics, error statistics and metrics as printable text.
pub fn stats_report(data_dir: &Path) -> AppResult<String> {
    let storage = Storage::open(data_dir)?;
    let files = storage.storage_stats()?;
    let errors = ErrorAggregator::open(storage).statistics();

    let error_summary = serde_json::json!({
        "total_errors": errors.total_errors,
        "errors_by_type": errors.errors_by_type,
        "errors_by_source": errors.errors_by_source,
        "errors_by_symbol": errors.errors_by_symbol,
        "details_retained": errors.details.len(),
        "fallback_usage": errors.fallback_usage,
        "resolved_errors": errors.resolved_errors,
        "last_updated": errors.last_updated,
    });

    Ok(format!(
        "== Storage ==\n{}\n\n== Errors ==\n{}\n\n== Metrics ==\n{}",
        serde_json::to_string_pretty(&files)?,
        serde_json::to_string_pretty(&error_summary)?,
        Metrics::render()?
    ))
}
