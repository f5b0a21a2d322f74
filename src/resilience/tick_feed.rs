// =============================================================================
// Tick Feed — keeps one symbol's live subscription alive
// =============================================================================
//
// Connect through the circuit breaker, pump ticks into the aggregator, and on
// any disconnect sleep with exponential backoff before trying again. While
// the breaker is Open the loop parks until it turns HalfOpen and then makes
// exactly one trial connection. A connection only counts as healthy once it
// has delivered a tick; one that drops before that is a breaker failure and
// keeps the backoff growing.
// =============================================================================

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::exchange::ExchangeDataSource;
use crate::resilience::backoff::ReconnectBackoff;
use crate::resilience::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::runtime_config::ReconnectConfig;
use crate::tick_aggregator::TickAggregator;

#[derive(Clone)]
pub struct TickFeed {
    source: Arc<dyn ExchangeDataSource>,
    aggregator: Arc<TickAggregator>,
    breaker: Arc<CircuitBreaker>,
    reconnect: ReconnectConfig,
}

impl TickFeed {
    pub fn new(
        source: Arc<dyn ExchangeDataSource>,
        aggregator: Arc<TickAggregator>,
        breaker: Arc<CircuitBreaker>,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            source,
            aggregator,
            breaker,
            reconnect,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run until `cancel` fires.
    pub async fn run(self, symbol: String, cancel: CancellationToken) {
        let mut backoff = ReconnectBackoff::from_config(&self.reconnect);
        info!(symbol = %symbol, source = self.source.name(), "tick feed started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.breaker.state() == BreakerState::Open {
                info!(symbol = %symbol, "circuit open, waiting for half-open trial");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.breaker.wait_for_half_open() => {}
                }
                info!(symbol = %symbol, "circuit half-open, attempting reconnect");
            }

            let connect = self.breaker.attempt(self.source.subscribe_ticks(&symbol));
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect => result,
            };

            match connected {
                Ok(mut stream) => {
                    info!(symbol = %symbol, "tick stream connected");
                    let mut delivered = false;
                    loop {
                        let item = tokio::select! {
                            _ = cancel.cancelled() => {
                                info!(symbol = %symbol, "tick feed cancelled");
                                return;
                            }
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(tick)) => {
                                if !delivered {
                                    delivered = true;
                                    self.breaker.record_success();
                                    backoff.reset();
                                }
                                if let Err(e) = self.aggregator.on_tick(&symbol, tick).await {
                                    if e.is_store() {
                                        error!(symbol = %symbol, error = %e, "failed to persist live candle");
                                    } else {
                                        warn!(symbol = %symbol, error = %e, "tick rejected");
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(symbol = %symbol, error = %e, "tick stream error");
                                break;
                            }
                            None => {
                                warn!(symbol = %symbol, "tick stream ended");
                                break;
                            }
                        }
                    }
                    if !delivered {
                        self.breaker.record_failure();
                        warn!(
                            symbol = %symbol,
                            breaker = ?self.breaker.state(),
                            "tick stream dropped before its first tick"
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        symbol = %symbol,
                        error = %e,
                        breaker = ?self.breaker.state(),
                        "tick subscription failed"
                    );
                }
            }

            let delay = backoff.next_delay();
            info!(
                symbol = %symbol,
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempts(),
                "reconnecting tick stream after backoff"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(symbol = %symbol, "tick feed stopped");
    }
}

impl std::fmt::Debug for TickFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickFeed")
            .field("source", &self.source.name())
            .field("breaker", &self.breaker)
            .finish()
    }
}
