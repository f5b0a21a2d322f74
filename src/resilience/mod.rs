pub mod backoff;
pub mod circuit_breaker;
pub mod tick_feed;

pub use backoff::ReconnectBackoff;
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use tick_feed::TickFeed;
