//! End-to-end batch integration tests.
//!
//! Runs the application against a scripted exchange:
//! - per-symbol failure isolation within one batch
//! - error aggregation and the durable statistics document
//! - live files and the batch audit log on disk

use oi_client::{RawResponse, RecordedCall, ScriptedTransport};
use oi_collector::{AppConfig, Application};
use oi_core::{DayKey, Symbol};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn sym(s: &str) -> Symbol {
    Symbol::new(s).unwrap()
}

fn exchange() -> Arc<ScriptedTransport> {
    Arc::new(ScriptedTransport::new(|call: &RecordedCall| {
        match (call.path.as_str(), call.param("symbol")) {
            (_, Some("BUSDT")) => Ok(RawResponse::status(
                400,
                r#"{"code":-1121,"msg":"Invalid symbol."}"#,
            )),
            ("/fapi/v1/openInterest", Some(s)) => Ok(RawResponse::ok(format!(
                r#"{{"symbol":"{s}","openInterest":"1234.5","time":1709251200000}}"#
            ))),
            ("/fapi/v1/premiumIndex", Some(_)) => Ok(RawResponse::ok(r#"{"markPrice":"2"}"#)),
            (path, _) => panic!("unexpected call to {path}"),
        }
    }))
}

fn app(dir: &TempDir, transport: Arc<ScriptedTransport>) -> Application {
    let mut config = AppConfig::from_toml(&format!(
        "symbols = [\"AUSDT\", \"BUSDT\", \"CUSDT\"]\ndata_dir = {:?}\nmax_attempts = 3\n",
        dir.path().display().to_string()
    ))
    .unwrap();
    config.max_workers = Some(2);
    Application::with_transport(config, transport, CancellationToken::new()).unwrap()
}

/// Invalid instrument B fails fast while A and C succeed.
#[tokio::test]
async fn test_batch_isolates_invalid_symbol() {
    let dir = TempDir::new().unwrap();
    let transport = exchange();
    let app = app(&dir, transport.clone());

    let outcome = app.run_once().await;

    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.results[&sym("AUSDT")]);
    assert!(!outcome.results[&sym("BUSDT")]);
    assert!(outcome.results[&sym("CUSDT")]);
    assert_eq!(outcome.succeeded, 2);
    assert_eq!(outcome.failed(), vec![sym("BUSDT")]);

    // Fast-fail: a single request for B, no mark-price lookup.
    let b_calls = transport
        .calls()
        .into_iter()
        .filter(|c| c.param("symbol") == Some("BUSDT"))
        .count();
    assert_eq!(b_calls, 1);

    let stats = app.aggregator().statistics();
    assert_eq!(stats.total_errors, 1);
    assert_eq!(stats.count_for(&sym("BUSDT")), 1);
    assert_eq!(stats.details[0].retry_count, 0);

    let doc: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("error_statistics.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(doc["total_errors"], 1);
    assert_eq!(doc["errors_by_symbol"]["BUSDT"], 1);
    assert_eq!(doc["errors_by_type"]["api_error"], 1);
    assert_eq!(doc["errors_by_source"]["realtime"], 1);

    assert_eq!(
        app.aggregator().invalid_symbols().into_iter().collect::<Vec<_>>(),
        vec![sym("BUSDT")]
    );
}

#[tokio::test]
async fn test_batch_writes_live_files_and_audit_row() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir, exchange());

    let outcome = app.run_once().await;
    let day = DayKey::from_timestamp_ms(outcome.captured_at_ms).unwrap();
    let layout = app.storage().layout();

    let a = std::fs::read_to_string(layout.live_file(&sym("AUSDT"), day)).unwrap();
    let rows: Vec<&str> = a.lines().collect();
    assert_eq!(rows[0], "timestamp,datetime_utc,openInterest,sumOpenInterestValue");
    assert!(rows[1].starts_with(&outcome.captured_at_ms.to_string()));
    assert!(rows[1].ends_with(",1234.5,2469.0"));
    assert!(!layout.live_file(&sym("BUSDT"), day).exists());

    let audit_day = DayKey::from_timestamp_ms(oi_core::time::now_ms()).unwrap();
    let audit = std::fs::read_to_string(layout.batch_summary_file(audit_day)).unwrap();
    let row = audit.lines().nth(1).unwrap();
    assert!(row.ends_with(",3,3,2,BUSDT,false"));

    // The same day gets a second row, not a second header.
    app.run_once().await;
    let audit = std::fs::read_to_string(layout.batch_summary_file(audit_day)).unwrap();
    assert_eq!(audit.lines().count(), 3);
}

/// A restarted process keeps counting from the durable document.
#[tokio::test]
async fn test_error_counts_survive_restart() {
    let dir = TempDir::new().unwrap();
    app(&dir, exchange()).run_once().await;

    let restarted = app(&dir, exchange());
    restarted.run_once().await;

    let stats = restarted.aggregator().statistics();
    assert_eq!(stats.total_errors, 2);
    assert_eq!(stats.count_for(&sym("BUSDT")), 2);
}
