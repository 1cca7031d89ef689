//! Open-interest acquisition client.
//!
//! Each operation runs inside its own retry loop. The client is cheap to
//! clone and shared by every dispatcher worker and the backfill loop.

use crate::error::{FetchError, FetchResult};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::transport::OiTransport;
use crate::wire::{
    decode, HistoryEntry, MarkPriceResponse, OpenInterestResponse, ServerTimeResponse,
};
use oi_core::time::{self, HISTORY_STEP_MS};
use oi_core::{HistoryPoint, SnapshotRecord, Symbol};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Largest page the history endpoint serves.
pub const MAX_HISTORY_LIMIT: u32 = 1000;

/// Request paths, relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoints {
    open_interest: String,
    mark_price: String,
    server_time: String,
    history: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            open_interest: "/fapi/v1/openInterest".to_string(),
            mark_price: "/fapi/v1/premiumIndex".to_string(),
            server_time: "/fapi/v1/time".to_string(),
            history: "/futures/data/openInterestHist".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct OiClient {
    transport: Arc<dyn OiTransport>,
    endpoints: Endpoints,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl OiClient {
    pub fn new(
        transport: Arc<dyn OiTransport>,
        policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            endpoints: Endpoints::default(),
            policy,
            shutdown,
        }
    }

    /// Same client, retry loops bound to a different shutdown token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: Vec<(&'static str, String)>,
    ) -> FetchResult<T> {
        retry_with_backoff(&self.policy, &self.shutdown, path, |_attempt| {
            let query = &query;
            async move {
                let raw = self.transport.get(path, query).await?;
                decode(path, &raw)
            }
        })
        .await
    }

    /// Current open interest for `symbol`, stamped with `timestamp_ms`
    /// (defaults to the current minute).
    ///
    /// The mark price is fetched afterwards as a soft dependency: when it
    /// fails the snapshot is still returned with no notional value.
    pub async fn fetch_current(
        &self,
        symbol: &Symbol,
        timestamp_ms: Option<i64>,
    ) -> FetchResult<SnapshotRecord> {
        let path = self.endpoints.open_interest.clone();
        let oi: OpenInterestResponse = self
            .get_json(&path, vec![("symbol", symbol.to_string())])
            .await?;

        let mark_price = match self.fetch_mark_price(symbol).await {
            Ok(px) => Some(px),
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Mark price unavailable, notional omitted");
                None
            }
        };

        let ts = timestamp_ms.unwrap_or_else(|| time::truncate_to_minute(time::now_ms()));
        SnapshotRecord::new(symbol.clone(), oi.open_interest, mark_price, ts).map_err(|e| {
            FetchError::Malformed {
                endpoint: path,
                reason: e.to_string(),
            }
        })
    }

    pub async fn fetch_mark_price(&self, symbol: &Symbol) -> FetchResult<Decimal> {
        let path = self.endpoints.mark_price.clone();
        let resp: MarkPriceResponse = self
            .get_json(&path, vec![("symbol", symbol.to_string())])
            .await?;
        Ok(resp.mark_price)
    }

    /// Exchange clock in epoch millis.
    pub async fn fetch_server_time(&self) -> FetchResult<i64> {
        let path = self.endpoints.server_time.clone();
        let resp: ServerTimeResponse = self.get_json(&path, Vec::new()).await?;
        Ok(resp.server_time)
    }

    /// One page of the 5-minute history in `[start_ms, end_ms]`.
    ///
    /// `limit` is clamped to `1..=1000`. The page is returned sorted,
    /// de-duplicated, grid-aligned and within the requested bounds.
    pub async fn fetch_history_window(
        &self,
        symbol: &Symbol,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> FetchResult<Vec<HistoryPoint>> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        let path = self.endpoints.history.clone();
        let entries: Vec<HistoryEntry> = self
            .get_json(
                &path,
                vec![
                    ("symbol", symbol.to_string()),
                    ("period", "5m".to_string()),
                    ("startTime", start_ms.to_string()),
                    ("endTime", end_ms.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let received = entries.len();
        let points = normalize_history(symbol, entries, start_ms, end_ms);
        if points.len() != received {
            debug!(
                symbol = %symbol,
                received,
                kept = points.len(),
                "Dropped out-of-range, unaligned or duplicate history points"
            );
        }
        Ok(points)
    }
}

fn normalize_history(
    symbol: &Symbol,
    mut entries: Vec<HistoryEntry>,
    start_ms: i64,
    end_ms: i64,
) -> Vec<HistoryPoint> {
    entries.retain(|e| {
        e.timestamp >= start_ms && e.timestamp <= end_ms && e.timestamp % HISTORY_STEP_MS == 0
    });
    entries.sort_by_key(|e| e.timestamp);
    entries.dedup_by_key(|e| e.timestamp);

    entries
        .into_iter()
        .map(|e| HistoryPoint {
            symbol: symbol.clone(),
            timestamp_ms: e.timestamp,
            sum_open_interest: e.sum_open_interest,
            sum_open_interest_value: e.sum_open_interest_value,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RawResponse, ScriptedTransport};
    use oi_core::ErrorKind;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    // 2024-03-01T00:00:00Z
    const MAR_1: i64 = 1_709_251_200_000;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> OiClient {
        OiClient::new(transport, fast_policy(), CancellationToken::new())
    }

    fn btc() -> Symbol {
        Symbol::new("BTCUSDT").unwrap()
    }

    #[tokio::test]
    async fn test_fetch_current_with_mark_price() {
        let transport = Arc::new(ScriptedTransport::new(|call| match call.path.as_str() {
            "/fapi/v1/openInterest" => Ok(RawResponse::ok(
                r#"{"symbol":"BTCUSDT","openInterest":"2.5","time":1}"#,
            )),
            "/fapi/v1/premiumIndex" => Ok(RawResponse::ok(r#"{"markPrice":"40000"}"#)),
            other => panic!("unexpected path {other}"),
        }));
        let rec = client(transport.clone())
            .fetch_current(&btc(), Some(MAR_1))
            .await
            .unwrap();

        assert_eq!(rec.open_interest, dec!(2.5));
        assert_eq!(rec.notional_value, Some(dec!(100000.0)));
        assert_eq!(rec.timestamp_ms, MAR_1);
        assert_eq!(transport.calls()[0].param("symbol"), Some("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_mark_price_failure_degrades_notional() {
        let transport = Arc::new(ScriptedTransport::new(|call| match call.path.as_str() {
            "/fapi/v1/openInterest" => Ok(RawResponse::ok(r#"{"openInterest":"2.5"}"#)),
            _ => Ok(RawResponse::status(503, "unavailable")),
        }));
        let rec = client(transport.clone())
            .fetch_current(&btc(), Some(MAR_1))
            .await
            .unwrap();

        assert!(rec.notional_value.is_none());
        assert_eq!(transport.call_count("/fapi/v1/premiumIndex"), 3);
    }

    #[tokio::test]
    async fn test_unknown_instrument_fails_fast() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(RawResponse::status(
                400,
                r#"{"code":-1121,"msg":"Invalid symbol."}"#,
            ))
        }));
        let err = client(transport.clone())
            .fetch_current(&Symbol::new("NOPEUSDT").unwrap(), Some(MAR_1))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Api);
        assert_eq!(err.attempts(), 1);
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(RawResponse::status(500, "internal"))
        }));
        let err = client(transport.clone())
            .fetch_server_time()
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.kind(), ErrorKind::Api);
        assert_eq!(transport.call_count("/fapi/v1/time"), 3);
    }

    #[tokio::test]
    async fn test_server_time() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(RawResponse::ok(r#"{"serverTime":1709251200123}"#))
        }));
        assert_eq!(
            client(transport).fetch_server_time().await.unwrap(),
            1_709_251_200_123
        );
    }

    #[tokio::test]
    async fn test_history_window_is_normalized() {
        let body = format!(
            r#"[
                {{"symbol":"BTCUSDT","sumOpenInterest":"3","sumOpenInterestValue":"30","timestamp":{t2}}},
                {{"symbol":"BTCUSDT","sumOpenInterest":"1","sumOpenInterestValue":"10","timestamp":{t0}}},
                {{"symbol":"BTCUSDT","sumOpenInterest":"1","sumOpenInterestValue":"10","timestamp":{t0}}},
                {{"symbol":"BTCUSDT","sumOpenInterest":"9","sumOpenInterestValue":"90","timestamp":{odd}}},
                {{"symbol":"BTCUSDT","sumOpenInterest":"2","sumOpenInterestValue":"20","timestamp":{t1}}},
                {{"symbol":"BTCUSDT","sumOpenInterest":"7","sumOpenInterestValue":"70","timestamp":{late}}}
            ]"#,
            t0 = MAR_1,
            t1 = MAR_1 + HISTORY_STEP_MS,
            t2 = MAR_1 + 2 * HISTORY_STEP_MS,
            odd = MAR_1 + 60_000,
            late = MAR_1 + 10 * HISTORY_STEP_MS,
        );
        let transport = Arc::new(ScriptedTransport::new(move |_| Ok(RawResponse::ok(body.clone()))));
        let end = MAR_1 + 5 * HISTORY_STEP_MS;
        let points = client(transport.clone())
            .fetch_history_window(&btc(), MAR_1, end, 5000)
            .await
            .unwrap();

        let ts: Vec<i64> = points.iter().map(|p| p.timestamp_ms).collect();
        assert_eq!(ts, vec![MAR_1, MAR_1 + HISTORY_STEP_MS, MAR_1 + 2 * HISTORY_STEP_MS]);
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
        assert!(ts.iter().all(|t| *t >= MAR_1 && *t <= end));
        assert_eq!(points[1].sum_open_interest_value, Some(dec!(20)));

        let call = &transport.calls()[0];
        assert_eq!(call.param("limit"), Some("1000"));
        assert_eq!(call.param("period"), Some("5m"));
        assert_eq!(call.param("startTime"), Some(MAR_1.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_malformed_history_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(RawResponse::ok(r#"{"unexpected":"object"}"#))
        }));
        let err = client(transport.clone())
            .fetch_history_window(&btc(), MAR_1, MAR_1 + HISTORY_STEP_MS, 10)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Data);
        assert_eq!(transport.calls().len(), 1);
    }
}
