//! Prometheus metrics for the collector.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A failure there means duplicate
//! metric names, which can only happen at static initialization.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram, register_int_counter, CounterVec, Encoder,
    Histogram, IntCounter, TextEncoder,
};

/// Remote requests issued, one per attempt.
/// Labels: endpoint
pub static REQUEST_ATTEMPTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "oi_request_attempts_total",
        "Remote request attempts (including retries)",
        &["endpoint"]
    )
    .unwrap()
});

/// Retries scheduled after a transient failure.
/// Labels: kind
pub static RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "oi_retries_total",
        "Retries scheduled after transient failures",
        &["kind"]
    )
    .unwrap()
});

/// Failures that reached the error aggregator.
/// Labels: kind, source
pub static FAILURES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "oi_failures_total",
        "Unresolved failures recorded by the aggregator",
        &["kind", "source"]
    )
    .unwrap()
});

/// Snapshot batch wall-clock duration.
pub static BATCH_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "oi_snapshot_batch_duration_seconds",
        "Snapshot batch duration in seconds",
        vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap()
});

/// Snapshot rows appended to live files.
pub static SNAPSHOTS_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "oi_snapshots_written_total",
        "Snapshot rows appended to live files"
    )
    .unwrap()
});

/// History points committed through atomic day replacement.
pub static HISTORY_POINTS_WRITTEN_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "oi_history_points_written_total",
        "History points committed to day files"
    )
    .unwrap()
});

/// History days dropped because a closed day was incomplete.
pub static HISTORY_DAYS_DISCARDED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "oi_history_days_discarded_total",
        "Closed history days discarded as incomplete"
    )
    .unwrap()
});

/// Live files renamed aside by size rotation.
pub static LIVE_ROTATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "oi_live_file_rotations_total",
        "Live snapshot files rotated by size"
    )
    .unwrap()
});

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    /// Record one remote request attempt.
    pub fn request_attempt(endpoint: &str) {
        REQUEST_ATTEMPTS_TOTAL.with_label_values(&[endpoint]).inc();
    }

    /// Record a scheduled retry.
    pub fn retry_scheduled(kind: &str) {
        RETRIES_TOTAL.with_label_values(&[kind]).inc();
    }

    /// Record a failure reaching the aggregator.
    pub fn failure_recorded(kind: &str, source: &str) {
        FAILURES_TOTAL.with_label_values(&[kind, source]).inc();
    }

    pub fn batch_completed(duration_secs: f64) {
        BATCH_DURATION_SECONDS.observe(duration_secs);
    }

    pub fn snapshot_written() {
        SNAPSHOTS_WRITTEN_TOTAL.inc();
    }

    pub fn history_points_written(count: usize) {
        HISTORY_POINTS_WRITTEN_TOTAL.inc_by(count as u64);
    }

    pub fn history_day_discarded() {
        HISTORY_DAYS_DISCARDED_TOTAL.inc();
    }

    pub fn live_file_rotated() {
        LIVE_ROTATIONS_TOTAL.inc();
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buf)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
