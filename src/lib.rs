// =============================================================================
// Candle Feed — local candle cache and aggregation pipeline
// =============================================================================
//
// Historical candles are served from a chunked on-disk cache, backfilled from
// the exchange on demand, rolled up into coarser granularities, and kept live
// by folding the exchange's trade stream into one-minute candles.
// =============================================================================

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod exchange;
pub mod gap_filler;
pub mod granularity;
pub mod orchestrator;
pub mod resilience;
pub mod runtime_config;
pub mod store;
pub mod tick_aggregator;
pub mod types;

#[cfg(test)]
mod testing;

pub use error::{FeedError, Result};
pub use granularity::Granularity;
pub use orchestrator::{DataFeed, LiveSubscription};
pub use runtime_config::FeedConfig;
pub use types::{Candle, CandleUpdate, ConsumerId, GapRange, Tick};
