// =============================================================================
// Chunk — one boundary window of candles for a (symbol, granularity)
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::granularity::Granularity;
use crate::types::Candle;

/// Store key of the chunk whose boundary window starts at `boundary`.
pub fn chunk_key(symbol: &str, granularity: Granularity, boundary: i64) -> String {
    format!("{}{boundary:012}", series_prefix(symbol, granularity))
}

/// Prefix shared by every chunk of one series.
pub fn series_prefix(symbol: &str, granularity: Granularity) -> String {
    format!("chunk/{symbol}/{}/", granularity.label())
}

/// Prefix shared by every chunk of one symbol, across granularities.
pub fn symbol_prefix(symbol: &str) -> String {
    format!("chunk/{symbol}/")
}

/// Outcome of merging a batch into a chunk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub replaced: usize,
}

/// Persisted record. Candles are kept strictly ascending with unique
/// `open_time`, and every `open_time` lies in `[start_time, end_time]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub symbol: String,
    pub granularity: Granularity,
    /// Boundary start, or the oldest retained candle after a partial prune.
    pub start_time: i64,
    /// Inclusive last second of the boundary window.
    pub end_time: i64,
    pub candles: Vec<Candle>,
    /// Wall-clock ms of the last write.
    pub last_updated: i64,
    /// Every period slot of the window holds a candle.
    pub is_complete: bool,
}

impl Chunk {
    pub fn new(symbol: &str, granularity: Granularity, boundary: i64) -> Self {
        Self {
            chunk_id: chunk_key(symbol, granularity, boundary),
            symbol: symbol.to_string(),
            granularity,
            start_time: boundary,
            end_time: granularity.chunk_end(boundary),
            candles: Vec::new(),
            last_updated: 0,
            is_complete: false,
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn boundary(&self) -> i64 {
        self.granularity.chunk_start(self.start_time)
    }

    pub fn contains_time(&self, ts: i64) -> bool {
        ts >= self.boundary() && ts <= self.end_time
    }

    /// Merge `incoming` into the chunk. A candle sharing an `open_time` with
    /// a stored one replaces it. Candles outside the window are ignored.
    pub fn merge(&mut self, incoming: &[Candle], now_ms: i64) -> MergeStats {
        let mut by_time: BTreeMap<i64, Candle> =
            self.candles.iter().map(|c| (c.open_time, *c)).collect();
        let mut stats = MergeStats::default();

        for candle in incoming {
            if !self.contains_time(candle.open_time) {
                continue;
            }
            match by_time.insert(candle.open_time, *candle) {
                Some(_) => stats.replaced += 1,
                None => stats.inserted += 1,
            }
        }

        self.candles = by_time.into_values().collect();
        if let Some(first) = self.candles.first() {
            self.start_time = self.start_time.min(first.open_time);
        }
        self.last_updated = now_ms;
        self.refresh_complete();
        stats
    }

    /// Drop the `n` oldest candles and advance `start_time` to the oldest
    /// survivor. Returns how many were removed.
    pub fn trim_oldest(&mut self, n: usize, now_ms: i64) -> usize {
        let n = n.min(self.candles.len());
        self.candles.drain(..n);
        if let Some(first) = self.candles.first() {
            self.start_time = first.open_time;
        }
        self.last_updated = now_ms;
        self.refresh_complete();
        n
    }

    /// Candles with `open_time` in `[start, end]`.
    pub fn candles_in(&self, start: i64, end: i64) -> impl Iterator<Item = &Candle> {
        self.candles
            .iter()
            .filter(move |c| c.open_time >= start && c.open_time <= end)
    }

    fn refresh_complete(&mut self) {
        let period = self.granularity.period_secs();
        let first_slot = self.granularity.align_up(self.boundary());
        let expected = if self.end_time >= first_slot {
            ((self.end_time - first_slot) / period + 1) as usize
        } else {
            0
        };
        self.is_complete = self.candles.len() == expected;
    }
}
