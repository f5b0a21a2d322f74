// =============================================================================
// Circuit Breaker — fail fast while the upstream is down
// =============================================================================
//
//   Closed ──failure_threshold consecutive failures──▶ Open
//   Open ──open_timeout elapsed──▶ HalfOpen
//   HalfOpen ──success_threshold consecutive successes──▶ Closed
//   HalfOpen ──any failure, or half_open_timeout undecided──▶ Open
//
// Timeouts are evaluated lazily on every state query. Every transition is
// published on a watch channel so the reconnect loop can react the moment
// the breaker turns HalfOpen.
// =============================================================================

use std::future::Future;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{FeedError, Result};
use crate::runtime_config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// When the current state was entered.
    since: Instant,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    transitions: watch::Sender<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let (transitions, _) = watch::channel(BreakerState::Closed);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                since: Instant::now(),
            }),
            transitions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, after applying any elapsed timeout.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.poll_timeouts(&mut inner);
        inner.state
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<BreakerState> {
        self.transitions.subscribe()
    }

    /// `Err(CircuitOpen)` while calls must not be attempted.
    pub fn check(&self) -> Result<()> {
        match self.state() {
            BreakerState::Open => Err(FeedError::CircuitOpen(self.name.clone())),
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.poll_timeouts(&mut inner);
        inner.consecutive_failures = 0;
        match inner.state {
            BreakerState::Closed => {}
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold.max(1) {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            // A straggler finishing after the breaker opened decides nothing.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        self.poll_timeouts(&mut inner);
        inner.consecutive_successes = 0;
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open),
            BreakerState::Open => {}
        }
    }

    /// Run `fut` through the breaker with the per-call timeout. Upstream
    /// errors and timeouts count as failures.
    pub async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let value = self.attempt(fut).await?;
        self.record_success();
        Ok(value)
    }

    /// Like `call`, except that an `Ok` is not counted. The caller records
    /// the success later, once the result has actually delivered.
    pub async fn attempt<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_upstream() {
                    self.record_failure();
                }
                Err(e)
            }
            Err(_) => {
                warn!(breaker = %self.name, timeout_ms = timeout.as_millis() as u64, "call timed out");
                self.record_failure();
                Err(FeedError::Timeout(timeout))
            }
        }
    }

    /// Resolve once the breaker is no longer Open.
    pub async fn wait_for_half_open(&self) {
        loop {
            let remaining = {
                let mut inner = self.inner.lock();
                self.poll_timeouts(&mut inner);
                if inner.state != BreakerState::Open {
                    return;
                }
                self.config
                    .open_timeout()
                    .saturating_sub(inner.since.elapsed())
            };
            tokio::time::sleep(remaining).await;
        }
    }

    fn poll_timeouts(&self, inner: &mut Inner) {
        let elapsed = inner.since.elapsed();
        match inner.state {
            BreakerState::Open if elapsed >= self.config.open_timeout() => {
                self.transition(inner, BreakerState::HalfOpen);
            }
            BreakerState::HalfOpen if elapsed >= self.config.half_open_timeout() => {
                warn!(breaker = %self.name, "half-open trial undecided, re-opening");
                self.transition(inner, BreakerState::Open);
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.since = Instant::now();
        inner.consecutive_successes = 0;
        if to == BreakerState::Closed {
            inner.consecutive_failures = 0;
        }
        info!(breaker = %self.name, from = ?from, to = ?to, "circuit breaker transition");
        self.transitions.send_replace(to);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}
