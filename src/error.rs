// =============================================================================
// Feed Errors — one error type for the whole candle pipeline
// =============================================================================
//
// Upstream failures are soft: callers retry, back off, or give up on a gap and
// return whatever the cache already holds. Store failures are hard: they are
// always propagated so that cache corruption never goes unnoticed.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

use crate::granularity::Granularity;
use crate::types::ConsumerId;

/// Errors produced by the candle cache, the exchange adapters and the
/// orchestrator.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The exchange could not be reached or answered with an error.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A single upstream call exceeded its deadline.
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    /// Local request-weight budget is exhausted.
    #[error("upstream rate limit reached (used weight {used})")]
    RateLimited { used: u32 },

    /// The exchange sent something that does not look like candles or ticks.
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    /// Calls are rejected because the named circuit breaker is open.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// The persistent store rejected an operation.
    #[error("store failure: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The owning consumer instance was deactivated mid-flight.
    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown consumer {0}")]
    UnknownConsumer(ConsumerId),

    #[error("invalid symbol '{0}'")]
    InvalidSymbol(String),

    #[error("invalid range [{start}, {end}]")]
    InvalidRange { start: i64, end: i64 },

    /// No rollup path exists between the two granularities.
    #[error("cannot roll up {from} candles into {to}")]
    UnsupportedRollup { from: Granularity, to: Granularity },
}

impl FeedError {
    /// Transient exchange-side failures that a retry or backoff may cure.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable(_)
                | Self::Timeout(_)
                | Self::RateLimited { .. }
                | Self::MalformedResponse(_)
                | Self::CircuitOpen(_)
        )
    }

    /// Failures of the local cache. These must reach the caller.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Io(_) | Self::Serialization(_))
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        Self::UpstreamUnavailable(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::UpstreamUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(FeedError::Timeout(Duration::from_secs(5)).is_upstream());
        assert!(FeedError::CircuitOpen("ticks".into()).is_upstream());
        assert!(!FeedError::Cancelled.is_upstream());
        assert!(FeedError::Store("disk full".into()).is_store());
        assert!(!FeedError::UpstreamUnavailable("x".into()).is_store());
    }

    #[test]
    fn display_names_the_breaker() {
        let e = FeedError::CircuitOpen("BTCUSDT ticks".into());
        assert_eq!(e.to_string(), "circuit 'BTCUSDT ticks' is open");
    }
}
