//! Transport seam for remote calls.
//!
//! `OiTransport` abstracts a single HTTP GET so the retry loop and the
//! response decoding can be exercised without a network:
//! - `HttpTransport`: production implementation on `reqwest`
//! - `ScriptedTransport`: closure-driven fake for tests

use crate::error::{FetchError, FetchResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::info;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One GET against the exchange.
///
/// Implementations return `FetchError::Timeout` / `FetchError::Network` for
/// transport failures and a `RawResponse` for anything that produced a
/// status line, successful or not.
pub trait OiTransport: Send + Sync {
    fn get<'a>(
        &'a self,
        path: &'a str,
        query: &'a [(&'a str, String)],
    ) -> BoxFuture<'a, FetchResult<RawResponse>>;
}

/// Outbound proxy settings.
///
/// A SOCKS proxy, when set, is used for both HTTP and HTTPS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub http: Option<String>,
    #[serde(default)]
    pub https: Option<String>,
    #[serde(default)]
    pub socks: Option<String>,
}

impl ProxyConfig {
    /// Fill unset fields from `HTTP_PROXY`, `HTTPS_PROXY`, `SOCKS_PROXY` /
    /// `ALL_PROXY` (upper or lower case).
    pub fn with_env_fallback(mut self) -> Self {
        fn env_any(names: &[&str]) -> Option<String> {
            names
                .iter()
                .find_map(|n| std::env::var(n).ok())
                .filter(|v| !v.is_empty())
        }

        if self.http.is_none() {
            self.http = env_any(&["HTTP_PROXY", "http_proxy"]);
        }
        if self.https.is_none() {
            self.https = env_any(&["HTTPS_PROXY", "https_proxy"]);
        }
        if self.socks.is_none() {
            self.socks = env_any(&["SOCKS_PROXY", "socks_proxy", "ALL_PROXY"]);
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.http.is_some() || self.https.is_some() || self.socks.is_some()
    }
}

/// `reqwest`-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport with a per-attempt timeout and optional proxy.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        proxy: &ProxyConfig,
    ) -> FetchResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);

        if let Some(socks) = &proxy.socks {
            info!(proxy = %socks, "Using SOCKS proxy");
            builder = builder.proxy(
                reqwest::Proxy::all(socks)
                    .map_err(|e| FetchError::Setup(format!("invalid SOCKS proxy: {e}")))?,
            );
        } else {
            if let Some(http) = &proxy.http {
                info!(proxy = %http, "Using HTTP proxy");
                builder = builder.proxy(
                    reqwest::Proxy::http(http)
                        .map_err(|e| FetchError::Setup(format!("invalid HTTP proxy: {e}")))?,
                );
            }
            if let Some(https) = &proxy.https {
                info!(proxy = %https, "Using HTTPS proxy");
                builder = builder.proxy(
                    reqwest::Proxy::https(https)
                        .map_err(|e| FetchError::Setup(format!("invalid HTTPS proxy: {e}")))?,
                );
            }
        }

        if !proxy.is_enabled() {
            info!("No proxy configured, connecting directly");
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::Setup(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

impl OiTransport for HttpTransport {
    fn get<'a>(
        &'a self,
        path: &'a str,
        query: &'a [(&'a str, String)],
    ) -> BoxFuture<'a, FetchResult<RawResponse>> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, path);
            let response = self
                .client
                .get(&url)
                .query(query)
                .send()
                .await
                .map_err(map_reqwest_error)?;

            let status = response.status().as_u16();
            let body = response.text().await.map_err(map_reqwest_error)?;
            Ok(RawResponse { status, body })
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() || e.is_body() {
        FetchError::Network(e.to_string())
    } else {
        FetchError::Other(e.to_string())
    }
}

/// A request observed by `ScriptedTransport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl RecordedCall {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

type Handler = dyn Fn(&RecordedCall) -> FetchResult<RawResponse> + Send + Sync;
type Latency = dyn Fn(&RecordedCall) -> Duration + Send + Sync;

/// Test transport answering every call through a closure.
pub struct ScriptedTransport {
    handler: Box<Handler>,
    latency: Option<Box<Latency>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new(
        handler: impl Fn(&RecordedCall) -> FetchResult<RawResponse> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            latency: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Delay each response by `latency(call)` before it resolves.
    pub fn with_latency(
        mut self,
        latency: impl Fn(&RecordedCall) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.latency = Some(Box::new(latency));
        self
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls made to `path`.
    pub fn call_count(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.path == path).count()
    }
}

impl OiTransport for ScriptedTransport {
    fn get<'a>(
        &'a self,
        path: &'a str,
        query: &'a [(&'a str, String)],
    ) -> BoxFuture<'a, FetchResult<RawResponse>> {
        let call = RecordedCall {
            path: path.to_string(),
            query: query
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        };
        self.calls.lock().push(call.clone());
        let result = (self.handler)(&call);
        let delay = self.latency.as_ref().map(|latency| latency(&call));
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_socks_takes_precedence_flag() {
        let proxy = ProxyConfig {
            socks: Some("socks5://127.0.0.1:1080".to_string()),
            ..Default::default()
        };
        assert!(proxy.is_enabled());
        assert!(!ProxyConfig::default().is_enabled());
    }

    #[tokio::test]
    async fn test_scripted_transport_records_calls() {
        let transport = ScriptedTransport::new(|call| {
            Ok(RawResponse::ok(format!(
                "{{\"symbol\":\"{}\"}}",
                call.param("symbol").unwrap_or_default()
            )))
        });
        let query = [("symbol", "BTCUSDT".to_string())];
        let resp = transport.get("/x", &query).await.unwrap();
        assert_eq!(resp.body, r#"{"symbol":"BTCUSDT"}"#);
        assert_eq!(transport.call_count("/x"), 1);
        assert_eq!(transport.calls()[0].param("symbol"), Some("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_scripted_latency_delays_response() {
        let transport = ScriptedTransport::new(|_| Ok(RawResponse::ok("{}")))
            .with_latency(|call| match call.path.as_str() {
                "/slow" => Duration::from_millis(50),
                _ => Duration::ZERO,
            });
        let started = std::time::Instant::now();
        transport.get("/slow", &[]).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        // Recorded when issued, not when answered.
        assert_eq!(transport.call_count("/slow"), 1);
    }
}
