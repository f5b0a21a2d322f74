// =============================================================================
// Shared types used across the candle feed
// =============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FeedError, Result};
use crate::granularity::{Granularity, EARLIEST_TIMESTAMP, LATEST_TIMESTAMP};

/// A single OHLCV bar. `open_time` is the period start in UTC seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// A candle whose four prices are all `price`.
    pub fn flat(open_time: i64, price: f64) -> Self {
        Self::new(open_time, price, price, price, price, 0.0)
    }

    /// Check the OHLC envelope and numeric sanity. Returns the reason on
    /// failure so callers can log it next to the offending candle.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) || !self.volume.is_finite() {
            return Err("non-finite value".into());
        }
        if self.volume < 0.0 {
            return Err(format!("negative volume {}", self.volume));
        }
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || body_high > self.high {
            return Err(format!(
                "OHLC envelope violated (o={} h={} l={} c={})",
                self.open, self.high, self.low, self.close
            ));
        }
        Ok(())
    }

    /// `validate` plus period alignment for `granularity`.
    pub fn validate_for(&self, granularity: Granularity) -> std::result::Result<(), String> {
        self.validate()?;
        if !(EARLIEST_TIMESTAMP..=LATEST_TIMESTAMP).contains(&self.open_time) {
            return Err(format!("open_time {} out of range", self.open_time));
        }
        if !granularity.is_aligned(self.open_time) {
            return Err(format!(
                "open_time {} not aligned to {granularity}",
                self.open_time
            ));
        }
        Ok(())
    }

    /// Same OHLCV within float tolerance.
    pub fn same_values(&self, other: &Candle) -> bool {
        const EPS: f64 = 1e-9;
        self.open_time == other.open_time
            && (self.open - other.open).abs() < EPS
            && (self.high - other.high).abs() < EPS
            && (self.low - other.low).abs() < EPS
            && (self.close - other.close).abs() < EPS
            && (self.volume - other.volume).abs() < EPS
    }
}

/// One live trade/price print from the exchange stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub price: f64,
    /// Base-asset quantity traded, zero when the stream does not carry it.
    #[serde(default)]
    pub volume: f64,
    /// Exchange event time, UTC milliseconds.
    pub timestamp_ms: i64,
}

/// Inclusive range of period starts with no cached candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GapRange {
    pub start: i64,
    pub end: i64,
}

impl GapRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Number of candle slots the gap spans at `granularity`.
    pub fn slots(&self, granularity: Granularity) -> i64 {
        (self.end - self.start) / granularity.period_secs() + 1
    }
}

/// A live candle pushed to subscribers. `closed` marks a finalized period;
/// a closed candle may be re-sent once more if reconciliation corrected it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleUpdate {
    pub symbol: String,
    pub granularity: Granularity,
    pub candle: Candle,
    pub closed: bool,
}

/// Identifies one consumer instance (a chart pane, a simulation run, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(Uuid);

impl ConsumerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upper-case a symbol and reject characters that cannot appear in a store
/// key segment.
pub fn normalize_symbol(symbol: &str) -> Result<String> {
    let upper = symbol.trim().to_uppercase();
    let ok = !upper.is_empty()
        && upper
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(upper)
    } else {
        Err(FeedError::InvalidSymbol(symbol.to_string()))
    }
}
