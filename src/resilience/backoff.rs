// =============================================================================
// Exponential backoff with a cap
// =============================================================================

use std::time::Duration;

use crate::runtime_config::ReconnectConfig;

/// Delay before retry number `attempt` (0-based): `base * factor^attempt`,
/// never above `max`.
pub fn delay_for_attempt(base: Duration, max: Duration, factor: f64, attempt: u32) -> Duration {
    let exp = attempt.min(32) as i32;
    let raw = base.as_millis() as f64 * factor.max(1.0).powi(exp);
    let capped = raw.min(max.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// Reconnect delay sequence. Grows on every `next_delay`, returns to the
/// base after `reset` (called once a connection delivers data).
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    factor: f64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            factor,
            attempt: 0,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.factor,
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = delay_for_attempt(self.base, self.max, self.factor, self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let mut backoff = ReconnectBackoff::new(
            Duration::from_millis(1_000),
            Duration::from_millis(5_000),
            2.0,
        );
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = ReconnectBackoff::from_config(&ReconnectConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let d = delay_for_attempt(Duration::from_millis(250), Duration::from_secs(4), 2.0, u32::MAX);
        assert_eq!(d, Duration::from_secs(4));
    }
}
