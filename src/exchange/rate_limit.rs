// =============================================================================
// Rate-Limit Tracker — monitors Binance request weight to avoid 429s
// =============================================================================
//
// Binance allows 1200 request weight per minute per IP; we hard-cap ourselves
// at 1000. The tracker reads the `X-MBX-USED-WEIGHT-1M` response header after
// every request and keeps atomic counters that any task may query lock-free.
// The counter is only trusted for the minute it was reported in.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

const USED_WEIGHT_HEADER: &str = "x-mbx-used-weight-1m";

/// Thread-safe request-weight tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    /// Minute (epoch seconds / 60) the weight was reported in.
    reported_minute: AtomicI64,
}

/// Immutable snapshot of the current rate-limit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            reported_minute: AtomicI64::new(0),
        }
    }

    /// Update from the headers of a Binance response received at `now_secs`.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap, now_secs: i64) {
        let Some(weight) = headers
            .get(USED_WEIGHT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.record(weight, now_secs);
    }

    /// Record a reported weight directly.
    pub fn record(&self, weight: u32, now_secs: i64) {
        let prev = self.used_weight(now_secs);
        self.used_weight_1m.store(weight, Ordering::Relaxed);
        self.reported_minute
            .store(now_secs.div_euclid(60), Ordering::Relaxed);

        if weight >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = weight, "rate-limit weight updated");
    }

    /// Weight used in the current minute. A report from an earlier minute has
    /// expired and counts as zero.
    pub fn used_weight(&self, now_secs: i64) -> u32 {
        if self.reported_minute.load(Ordering::Relaxed) == now_secs.div_euclid(60) {
            self.used_weight_1m.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Return `true` if we can afford to spend `weight` more request weight
    /// without exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32, now_secs: i64) -> bool {
        let current = self.used_weight(now_secs);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked, would exceed rate limit"
            );
        }
        allowed
    }

    pub fn snapshot(&self, now_secs: i64) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight(now_secs),
            hard_limit: WEIGHT_HARD_LIMIT,
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("reported_minute", &self.reported_minute.load(Ordering::Relaxed))
            .finish()
    }
}
