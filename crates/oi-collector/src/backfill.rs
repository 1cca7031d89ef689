//! Continuation tracking and the long-lived history backfill loop.
//!
//! Each cycle reads the exchange clock, derives the fetchable horizon and,
//! per symbol, resumes right after the newest persisted point. Pages are
//! requested strictly in time order. Points are buffered per UTC day until
//! the requested range has covered the whole day, then the day is merged
//! with what is already on disk and replaced atomically:
//! - a closed day (its last slot is inside the horizon) is written only
//!   with all 288 points, otherwise discarded and any earlier partial file
//!   for it removed;
//! - a day still open at the horizon end is written with what it has so
//!   the cursor can advance.
//!
//! A partial day left behind by an earlier cycle is dropped as soon as it
//! has closed and the resume point has moved past it.

use crate::config::BackfillConfig;
use crate::error::AppResult;
use oi_aggregator::ErrorAggregator;
use oi_client::OiClient;
use oi_core::time::{align_up, DAY_MS};
use oi_core::{DayKey, ErrorKind, ErrorSource, HistoryPoint, Symbol, HISTORY_STEP_MS, POINTS_PER_DAY};
use oi_persistence::{PersistenceResult, Storage};
use oi_telemetry::Metrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillSettings {
    pub cycle: Duration,
    pub lookback_ms: i64,
    pub buffer_ms: i64,
    pub page_limit: u32,
}

impl From<&BackfillConfig> for BackfillSettings {
    fn from(cfg: &BackfillConfig) -> Self {
        Self {
            cycle: Duration::from_secs(cfg.cycle_secs),
            lookback_ms: i64::from(cfg.lookback_days) * DAY_MS,
            buffer_ms: i64::try_from(cfg.buffer_secs)
                .unwrap_or(i64::MAX / 1000)
                .saturating_mul(1000),
            page_limit: cfg.page_limit.clamp(1, oi_client::MAX_HISTORY_LIMIT),
        }
    }
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self::from(&BackfillConfig::default())
    }
}

/// Range of history the exchange serves and has finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizon {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl Horizon {
    /// `[server - lookback + buffer, server - buffer]`
    pub fn at(server_time_ms: i64, lookback_ms: i64, buffer_ms: i64) -> Self {
        Self {
            start_ms: server_time_ms - lookback_ms + buffer_ms,
            end_ms: server_time_ms - buffer_ms,
        }
    }
}

/// First timestamp to request: right after the newest persisted point, never
/// before the horizon, rounded up onto the 5-minute grid.
pub fn resume_start(last_persisted_ms: Option<i64>, horizon: &Horizon) -> i64 {
    let start = match last_persisted_ms {
        Some(ts) => (ts + HISTORY_STEP_MS).max(horizon.start_ms),
        None => horizon.start_ms,
    };
    align_up(start)
}

/// Inclusive end of a page of `limit` slots starting at `start_ms`.
pub fn page_end(start_ms: i64, limit: u32, horizon: &Horizon) -> i64 {
    let span = i64::from(limit.max(1) - 1) * HISTORY_STEP_MS;
    (start_ms + span).min(horizon.end_ms)
}

/// Why a symbol's backfill ended for this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillStop {
    /// Nothing new inside the horizon.
    UpToDate,
    /// Paged through to the horizon end.
    Completed,
    EmptyPage,
    Failed(ErrorKind),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolBackfill {
    pub start_ms: Option<i64>,
    pub pages: u32,
    pub points_written: usize,
    pub days_written: usize,
    pub days_discarded: usize,
    pub stop: BackfillStop,
}

impl Default for SymbolBackfill {
    fn default() -> Self {
        Self {
            start_ms: None,
            pages: 0,
            points_written: 0,
            days_written: 0,
            days_discarded: 0,
            stop: BackfillStop::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub server_time_ms: i64,
    pub horizon: Horizon,
    pub symbols: BTreeMap<Symbol, SymbolBackfill>,
    pub interrupted: bool,
}

type DayBuffer = BTreeMap<DayKey, BTreeMap<i64, HistoryPoint>>;

pub struct BackfillWorker {
    client: OiClient,
    storage: Storage,
    aggregator: Arc<ErrorAggregator>,
    symbols: Vec<Symbol>,
    settings: BackfillSettings,
    shutdown: CancellationToken,
}

impl BackfillWorker {
    /// The client's retry loops are rebound to `shutdown`.
    pub fn new(
        client: OiClient,
        storage: Storage,
        aggregator: Arc<ErrorAggregator>,
        symbols: Vec<Symbol>,
        settings: BackfillSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client: client.with_shutdown(shutdown.clone()),
            storage,
            aggregator,
            symbols,
            settings,
            shutdown,
        }
    }

    /// Run cycles until cancelled.
    pub async fn run(&self) {
        info!(
            symbols = self.symbols.len(),
            cycle_secs = self.settings.cycle.as_secs(),
            "Backfill worker started"
        );
        while !self.shutdown.is_cancelled() {
            match self.run_cycle().await {
                Ok(report) => log_cycle(&report),
                Err(e) => warn!(error = %e, "Backfill cycle skipped"),
            }

            tokio::select! {
                () = tokio::time::sleep(self.settings.cycle) => {}
                () = self.shutdown.cancelled() => break,
            }
        }
        info!("Backfill worker stopped");
    }

    /// One pass over every symbol, sequentially.
    ///
    /// Fails only when the exchange clock cannot be read; per-symbol
    /// failures are recorded and reported in the result.
    pub async fn run_cycle(&self) -> AppResult<CycleReport> {
        let server_time_ms = self.client.fetch_server_time().await?;
        let horizon = Horizon::at(
            server_time_ms,
            self.settings.lookback_ms,
            self.settings.buffer_ms,
        );
        debug!(server_time_ms, ?horizon, "Backfill cycle started");

        let mut report = CycleReport {
            server_time_ms,
            horizon,
            symbols: BTreeMap::new(),
            interrupted: false,
        };
        for symbol in &self.symbols {
            if self.shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let result = self.backfill_symbol(symbol, &horizon).await;
            if result.stop == BackfillStop::Cancelled {
                report.interrupted = true;
            }
            report.symbols.insert(symbol.clone(), result);
        }
        Ok(report)
    }

    async fn backfill_symbol(&self, symbol: &Symbol, horizon: &Horizon) -> SymbolBackfill {
        let mut report = SymbolBackfill::default();

        let last = match self.storage.last_history_timestamp(symbol) {
            Ok(last) => last,
            Err(e) => {
                report.stop = self.fail(symbol, None, format!("failed to read cursor: {e}"), 0);
                return report;
            }
        };
        let mut start = resume_start(last, horizon);
        report.start_ms = Some(start);
        if let Some(last) = last {
            if let Err(e) = self.drop_stranded_day(symbol, last, start, horizon, &mut report) {
                report.stop = self.fail(symbol, None, format!("failed to persist history: {e}"), 0);
                return report;
            }
        }
        if start > horizon.end_ms {
            report.stop = BackfillStop::UpToDate;
            return report;
        }

        let mut buffer = DayBuffer::new();
        let stop = loop {
            if start > horizon.end_ms {
                break BackfillStop::Completed;
            }
            if self.shutdown.is_cancelled() {
                break BackfillStop::Cancelled;
            }

            let end = page_end(start, self.settings.page_limit, horizon);
            let page = match self
                .client
                .fetch_history_window(symbol, start, end, self.settings.page_limit)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    let stop = self.fail(
                        symbol,
                        Some(e.kind()),
                        e.to_string(),
                        e.attempts().saturating_sub(1),
                    );
                    break if e.is_cancelled() { BackfillStop::Cancelled } else { stop };
                }
            };
            report.pages += 1;

            let Some(last_ts) = page.last().map(|p| p.timestamp_ms) else {
                self.fail(
                    symbol,
                    Some(ErrorKind::Data),
                    format!("empty history page for [{start}, {end}]"),
                    0,
                );
                break BackfillStop::EmptyPage;
            };
            // Pages only hold points inside [start, end], so this advances.
            let next = last_ts + HISTORY_STEP_MS;

            for point in page {
                match DayKey::from_timestamp_ms(point.timestamp_ms) {
                    Ok(day) => {
                        buffer.entry(day).or_default().insert(point.timestamp_ms, point);
                    }
                    Err(e) => warn!(symbol = %symbol, error = %e, "Dropping history point"),
                }
            }
            start = next;
            debug!(symbol = %symbol, pages = report.pages, next_start = start, "History page received");

            if let Err(e) = self.settle(symbol, &mut buffer, Some(start), horizon, &mut report) {
                break self.fail(symbol, None, format!("failed to persist history: {e}"), 0);
            }
        };

        if let Err(e) = self.settle(symbol, &mut buffer, None, horizon, &mut report) {
            self.fail(symbol, None, format!("failed to persist history: {e}"), 0);
        }
        report.stop = stop;
        report
    }

    /// Persist buffered days fully covered before `covered_until`
    /// (every buffered day when `None`).
    fn settle(
        &self,
        symbol: &Symbol,
        buffer: &mut DayBuffer,
        covered_until: Option<i64>,
        horizon: &Horizon,
        report: &mut SymbolBackfill,
    ) -> PersistenceResult<()> {
        let ready: Vec<DayKey> = buffer
            .keys()
            .copied()
            .filter(|day| covered_until.map_or(true, |until| day.last_slot_ms() < until))
            .collect();

        for day in ready {
            if let Some(points) = buffer.remove(&day) {
                self.persist_day(symbol, day, points, horizon, report)?;
            }
        }
        Ok(())
    }

    fn persist_day(
        &self,
        symbol: &Symbol,
        day: DayKey,
        fresh: BTreeMap<i64, HistoryPoint>,
        horizon: &Horizon,
        report: &mut SymbolBackfill,
    ) -> PersistenceResult<()> {
        let fresh_count = fresh.len();
        let mut merged: BTreeMap<i64, HistoryPoint> = self
            .storage
            .read_history_day(symbol, day)?
            .into_iter()
            .map(|p| (p.timestamp_ms, p))
            .collect();
        merged.extend(fresh);

        let closed = day.last_slot_ms() <= horizon.end_ms;
        if closed && merged.len() != POINTS_PER_DAY {
            return self.discard_day(symbol, day, merged.len(), report);
        }

        self.storage
            .write_history_day(symbol, day, merged.into_values().collect())?;
        Metrics::history_points_written(fresh_count);
        report.points_written += fresh_count;
        report.days_written += 1;
        Ok(())
    }

    /// The day holding the cursor was last written while open. Once it has
    /// closed and `start_ms` lies past its last slot, its missing slots are
    /// never requested again, so a short file is dropped.
    fn drop_stranded_day(
        &self,
        symbol: &Symbol,
        last_ms: i64,
        start_ms: i64,
        horizon: &Horizon,
        report: &mut SymbolBackfill,
    ) -> PersistenceResult<()> {
        let day = DayKey::from_timestamp_ms(last_ms)?;
        if day.last_slot_ms() > horizon.end_ms || start_ms <= day.last_slot_ms() {
            return Ok(());
        }
        let points = self.storage.read_history_day(symbol, day)?.len();
        if points == POINTS_PER_DAY {
            return Ok(());
        }
        self.discard_day(symbol, day, points, report)
    }

    fn discard_day(
        &self,
        symbol: &Symbol,
        day: DayKey,
        points: usize,
        report: &mut SymbolBackfill,
    ) -> PersistenceResult<()> {
        let removed_file = self.storage.remove_history_day(symbol, day)?;
        warn!(
            symbol = %symbol,
            day = %day,
            points,
            expected = POINTS_PER_DAY,
            removed_file,
            "Incomplete closed day discarded"
        );
        Metrics::history_day_discarded();
        report.days_discarded += 1;
        Ok(())
    }

    fn fail(
        &self,
        symbol: &Symbol,
        kind: Option<ErrorKind>,
        message: String,
        retry_count: u32,
    ) -> BackfillStop {
        let record =
            self.aggregator
                .record_failure(symbol, kind, message, ErrorSource::History, retry_count);
        BackfillStop::Failed(record.kind)
    }
}

fn log_cycle(report: &CycleReport) {
    let points: usize = report.symbols.values().map(|s| s.points_written).sum();
    let days: usize = report.symbols.values().map(|s| s.days_written).sum();
    let discarded: usize = report.symbols.values().map(|s| s.days_discarded).sum();
    let failed = report
        .symbols
        .values()
        .filter(|s| matches!(s.stop, BackfillStop::Failed(_) | BackfillStop::EmptyPage))
        .count();
    info!(
        symbols = report.symbols.len(),
        points,
        days,
        discarded,
        failed,
        interrupted = report.interrupted,
        "Backfill cycle finished"
    );
}
