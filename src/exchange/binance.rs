// =============================================================================
// Binance Source — public klines over REST, live prints over aggTrade WS
// =============================================================================
//
// Only public market-data endpoints are used, so no API key is needed.
// Klines arrive as an array of arrays:
//   [0] openTime (ms), [1] open, [2] high, [3] low, [4] close, [5] volume, ...
// Numeric fields are JSON strings. A row that cannot be parsed is skipped and
// logged; the rest of the page is kept.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{FeedError, Result};
use crate::exchange::rate_limit::RateLimitTracker;
use crate::exchange::{ExchangeDataSource, TickStream};
use crate::granularity::Granularity;
use crate::types::{Candle, Tick};

const REST_BASE_URL: &str = "https://api.binance.com";
const WS_BASE_URL: &str = "wss://stream.binance.com:9443/ws";
/// Binance's own page limit is 1000; 300 keeps pages cheap.
const MAX_CANDLES_PER_CALL: usize = 300;
/// Request weight of a klines call with limit <= 100 is 2 (1000 => 2 too).
const KLINES_WEIGHT: u32 = 2;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BinanceSource {
    rest_base: String,
    ws_base: String,
    max_candles_per_call: usize,
    client: reqwest::Client,
    rate_limit: RateLimitTracker,
    clock: Arc<dyn Clock>,
}

impl BinanceSource {
    pub fn new() -> Result<Self> {
        Self::with_endpoints(REST_BASE_URL, WS_BASE_URL)
    }

    /// Point the source at alternative endpoints (testnet, a local mock).
    pub fn with_endpoints(rest_base: impl Into<String>, ws_base: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let rest_base = rest_base.into();
        debug!(rest_base = %rest_base, "BinanceSource initialised");
        Ok(Self {
            rest_base,
            ws_base: ws_base.into(),
            max_candles_per_call: MAX_CANDLES_PER_CALL,
            client,
            rate_limit: RateLimitTracker::new(),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_max_candles_per_call(mut self, max: usize) -> Self {
        self.max_candles_per_call = max.max(1);
        self
    }

    pub fn rate_limit(&self) -> &RateLimitTracker {
        &self.rate_limit
    }
}

#[async_trait]
impl ExchangeDataSource for BinanceSource {
    fn name(&self) -> &str {
        "binance"
    }

    fn max_candles_per_call(&self) -> usize {
        self.max_candles_per_call
    }

    #[instrument(skip(self), name = "binance::get_candles")]
    async fn get_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>> {
        let now = self.clock.now();
        if !self.rate_limit.can_send_request(KLINES_WEIGHT, now) {
            return Err(FeedError::RateLimited {
                used: self.rate_limit.used_weight(now),
            });
        }

        let slots = ((end - start) / granularity.period_secs() + 1).max(1) as usize;
        let limit = slots.min(self.max_candles_per_call);
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.rest_base,
            symbol,
            granularity.label(),
            start * 1000,
            end * 1000,
            limit
        );

        let resp = self.client.get(&url).send().await?;
        self.rate_limit.update_from_headers(resp.headers(), self.clock.now());

        let status = resp.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(FeedError::RateLimited {
                used: self.rate_limit.used_weight(self.clock.now()),
            });
        }
        let body: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            return Err(FeedError::UpstreamUnavailable(format!(
                "GET /api/v3/klines returned {status}: {body}"
            )));
        }

        let candles = parse_klines(&body)?;
        debug!(symbol, interval = granularity.label(), count = candles.len(), "klines fetched");
        Ok(candles)
    }

    async fn subscribe_ticks(&self, symbol: &str) -> Result<TickStream> {
        let lower = symbol.to_lowercase();
        let url = format!("{}/{lower}@aggTrade", self.ws_base);
        info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

        let (ws_stream, _response) = connect_async(&url).await?;
        info!(symbol = %symbol, "trade WebSocket connected");
        let (_write, read) = ws_stream.split();

        let stream = read.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => match parse_agg_trade(&text) {
                    Ok(tick) => Some(Ok(tick)),
                    Err(e) => {
                        warn!(error = %e, "failed to parse aggTrade message");
                        None
                    }
                },
                Ok(Message::Close(frame)) => Some(Err(FeedError::UpstreamUnavailable(
                    format!("trade WebSocket closed: {frame:?}"),
                ))),
                // tungstenite answers pings itself.
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            }
        });
        Ok(stream.boxed())
    }
}

impl std::fmt::Debug for BinanceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceSource")
            .field("rest_base", &self.rest_base)
            .field("ws_base", &self.ws_base)
            .field("max_candles_per_call", &self.max_candles_per_call)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a klines page. Only a non-array body fails the whole page.
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let rows = body
        .as_array()
        .ok_or_else(|| FeedError::MalformedResponse("klines response is not an array".into()))?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        match parse_kline_row(row) {
            Ok(candle) => candles.push(candle),
            Err(reason) => warn!(reason = %reason, "skipping malformed kline entry"),
        }
    }
    Ok(candles)
}

fn parse_kline_row(row: &serde_json::Value) -> std::result::Result<Candle, String> {
    let arr = row.as_array().ok_or("kline entry is not an array")?;
    if arr.len() < 6 {
        return Err(format!("kline entry has {} elements", arr.len()));
    }
    let open_time_ms = arr[0].as_i64().ok_or("openTime is not an integer")?;
    Ok(Candle {
        open_time: open_time_ms.div_euclid(1000),
        open: parse_str_f64(&arr[1], "open")?,
        high: parse_str_f64(&arr[2], "high")?,
        low: parse_str_f64(&arr[3], "low")?,
        close: parse_str_f64(&arr[4], "close")?,
        volume: parse_str_f64(&arr[5], "volume")?,
    })
}

/// Parse a Binance aggTrade message.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "T": 1700000000000 }
/// ```
fn parse_agg_trade(text: &str) -> std::result::Result<Tick, String> {
    let root: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
    let price = parse_str_f64(&root["p"], "p")?;
    let volume = parse_str_f64(&root["q"], "q")?;
    let timestamp_ms = root["T"]
        .as_i64()
        .or_else(|| root["E"].as_i64())
        .ok_or("missing trade time")?;
    if !(price.is_finite() && price > 0.0) {
        return Err(format!("non-positive price {price}"));
    }
    Ok(Tick {
        price,
        volume,
        timestamp_ms,
    })
}

/// Binance sends numeric values as JSON strings; accept plain numbers too.
fn parse_str_f64(val: &serde_json::Value, name: &str) -> std::result::Result<f64, String> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("field {name} is not a valid f64")),
        _ => Err(format!("field {name} has unexpected JSON type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn klines_page_parses_and_skips_bad_rows() {
        let body: serde_json::Value = serde_json::from_str(
            r#"[
                [1700000040000, "37010.0", "37050.0", "36990.0", "37020.0", "12.5", 1700000099999],
                [1700000000000, "37000.0", "37030.0", "36980.0", "37010.0", "8.0"],
                [1700000100000, "37020.0"],
                [1700000160000, "oops", "1", "1", "1", "1"],
                "not-a-row"
            ]"#,
        )
        .unwrap();
        let candles = parse_klines(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, 1_700_000_040);
        assert_eq!(candles[1].open_time, 1_700_000_000);
        assert!((candles[0].close - 37_020.0).abs() < f64::EPSILON);
        assert!((candles[1].volume - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn non_array_body_is_malformed() {
        let body = serde_json::json!({ "code": -1121, "msg": "Invalid symbol." });
        assert!(matches!(
            parse_klines(&body),
            Err(FeedError::MalformedResponse(_))
        ));
    }

    #[test]
    fn agg_trade_parses() {
        let tick = parse_agg_trade(
            r#"{"e":"aggTrade","E":1700000000123,"s":"BTCUSDT","p":"37000.50","q":"0.25","T":1700000000100,"m":true}"#,
        )
        .unwrap();
        assert_eq!(tick.timestamp_ms, 1_700_000_000_100);
        assert!((tick.price - 37_000.5).abs() < f64::EPSILON);
        assert!((tick.volume - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn agg_trade_rejects_garbage() {
        assert!(parse_agg_trade("{}").is_err());
        assert!(parse_agg_trade(r#"{"p":"0","q":"1","T":1}"#).is_err());
        assert!(parse_agg_trade("not json").is_err());
    }
}
