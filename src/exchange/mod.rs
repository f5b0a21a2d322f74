// =============================================================================
// Exchange Data Source — the upstream the cache is filled from
// =============================================================================
//
// Contract every implementation must honour (and every caller must assume):
//   - `get_candles` returns at most `max_candles_per_call()` candles, in no
//     guaranteed order, possibly fewer than asked near the start of history,
//     and may fail or hang (callers wrap it in a timeout).
//   - `subscribe_ticks` yields a push stream that can end or error at any
//     moment; reconnecting is the caller's job.
// =============================================================================

pub mod binance;
pub mod rate_limit;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;
use crate::granularity::Granularity;
use crate::types::{Candle, Tick};

pub use binance::BinanceSource;

/// Live tick stream. An `Err` item or the end of the stream means the
/// connection is gone.
pub type TickStream = BoxStream<'static, Result<Tick>>;

#[async_trait]
pub trait ExchangeDataSource: Send + Sync {
    /// Short name used in logs and breaker names.
    fn name(&self) -> &str;

    /// Upper bound on candles returned by one `get_candles` call.
    fn max_candles_per_call(&self) -> usize {
        300
    }

    /// Candles whose `open_time` (seconds) lies in `[start, end]`.
    async fn get_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>>;

    async fn subscribe_ticks(&self, symbol: &str) -> Result<TickStream>;
}
