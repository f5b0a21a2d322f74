// =============================================================================
// Clock & Scheduler — injectable wall-clock time and boundary timers
// =============================================================================
//
// Components never read the system clock directly. They hold an
// `Arc<dyn Clock>` so tests can pin "now" to a fixed instant, and they arm
// timers through `Scheduler::schedule_at`, which converts a wall-clock target
// into a tokio sleep.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

/// Source of wall-clock time, UTC.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Seconds since the Unix epoch.
    fn now(&self) -> i64 {
        self.now_ms().div_euclid(1000)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Runs futures at wall-clock instants.
#[derive(Clone)]
pub struct Scheduler {
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Time left until `at_ms`, zero if it already passed.
    pub fn delay_until(&self, at_ms: i64) -> Duration {
        let delta = at_ms.saturating_sub(self.clock.now_ms()).max(0);
        Duration::from_millis(delta as u64)
    }

    /// Spawn `task` to run once the clock reaches `at_ms`. Aborting the
    /// returned handle cancels the timer.
    pub fn schedule_at<F>(&self, at_ms: i64, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = tokio::time::Instant::now() + self.delay_until(at_ms);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            task.await;
        })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("now_ms", &self.clock.now_ms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn manual_clock_moves_on_demand() {
        let clock = ManualClock::new(61_500);
        assert_eq!(clock.now(), 61);
        clock.advance_ms(500);
        assert_eq!(clock.now(), 62);
        clock.set_ms(-1);
        assert_eq!(clock.now(), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_at_waits_for_target() {
        let clock = Arc::new(ManualClock::new(10_000));
        let scheduler = Scheduler::new(clock.clone());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        assert_eq!(scheduler.delay_until(5_000), Duration::ZERO);
        let handle = scheduler.schedule_at(12_000, async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_millis(1_999)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::advance(Duration::from_millis(1)).await;
        handle.await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }
}
