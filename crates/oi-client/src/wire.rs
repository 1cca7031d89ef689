//! Exchange response payloads and status interpretation.

use crate::error::{FetchError, FetchResult};
use crate::transport::RawResponse;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

/// Application error code the exchange uses for an unknown instrument.
pub const INVALID_SYMBOL_CODE: i64 = -1121;

/// `GET /fapi/v1/openInterest`
#[derive(Debug, Deserialize)]
pub(crate) struct OpenInterestResponse {
    #[allow(dead_code)]
    pub symbol: Option<String>,
    #[serde(rename = "openInterest", deserialize_with = "decimal")]
    pub open_interest: Decimal,
}

/// `GET /fapi/v1/premiumIndex`
#[derive(Debug, Deserialize)]
pub(crate) struct MarkPriceResponse {
    #[serde(rename = "markPrice", deserialize_with = "decimal")]
    pub mark_price: Decimal,
}

/// `GET /fapi/v1/time`
#[derive(Debug, Deserialize)]
pub(crate) struct ServerTimeResponse {
    #[serde(rename = "serverTime")]
    pub server_time: i64,
}

/// One element of `GET /futures/data/openInterestHist`.
#[derive(Debug, Deserialize)]
pub(crate) struct HistoryEntry {
    #[allow(dead_code)]
    pub symbol: Option<String>,
    #[serde(rename = "sumOpenInterest", deserialize_with = "decimal")]
    pub sum_open_interest: Decimal,
    #[serde(
        rename = "sumOpenInterestValue",
        default,
        deserialize_with = "optional_decimal"
    )]
    pub sum_open_interest_value: Option<Decimal>,
    pub timestamp: i64,
}

/// `{"code": -1121, "msg": "Invalid symbol."}`
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<i64>,
}

/// Decimal encoded either as a JSON string or a JSON number.
#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    Text(String),
    Int(i64),
    Float(f64),
}

fn numeric_to_decimal(n: Numeric) -> Result<Option<Decimal>, String> {
    match n {
        Numeric::Text(s) if s.trim().is_empty() => Ok(None),
        Numeric::Text(s) => Decimal::from_str(s.trim())
            .map(Some)
            .map_err(|e| format!("invalid decimal {s:?}: {e}")),
        Numeric::Int(i) => Ok(Some(Decimal::from(i))),
        Numeric::Float(f) => Decimal::try_from(f)
            .map(Some)
            .map_err(|e| format!("invalid decimal {f}: {e}")),
    }
}

fn decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Decimal, D::Error> {
    numeric_to_decimal(Numeric::deserialize(d)?)
        .map_err(serde::de::Error::custom)?
        .ok_or_else(|| serde::de::Error::custom("empty decimal"))
}

fn optional_decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Decimal>, D::Error> {
    match Option::<Numeric>::deserialize(d)? {
        None => Ok(None),
        Some(n) => numeric_to_decimal(n).map_err(serde::de::Error::custom),
    }
}

/// Map a non-success response (or an error envelope) to a `FetchError`.
///
/// The invalid-instrument code wins over the status; 429/418 are rate
/// limits; other 4xx are client errors; everything else is a server error.
pub(crate) fn check_status(raw: &RawResponse) -> FetchResult<()> {
    let code = serde_json::from_str::<ApiErrorBody>(&raw.body)
        .ok()
        .and_then(|b| b.code);

    if code.map(i64::abs) == Some(INVALID_SYMBOL_CODE.abs()) {
        return Err(FetchError::InvalidSymbol {
            code: code.unwrap_or(INVALID_SYMBOL_CODE),
            body: raw.body.clone(),
        });
    }

    if raw.is_success() {
        return Ok(());
    }

    match raw.status {
        429 | 418 => Err(FetchError::RateLimited {
            status: raw.status,
            body: raw.body.clone(),
        }),
        400..=499 => Err(FetchError::Client {
            status: raw.status,
            code,
            body: raw.body.clone(),
        }),
        _ => Err(FetchError::Server {
            status: raw.status,
            body: raw.body.clone(),
        }),
    }
}

/// Check the status then decode the body; undecodable bodies are `Malformed`.
pub(crate) fn decode<T: DeserializeOwned>(endpoint: &str, raw: &RawResponse) -> FetchResult<T> {
    check_status(raw)?;
    serde_json::from_str(&raw.body).map_err(|e| FetchError::Malformed {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })
}
