// =============================================================================
// Gap Filler — backfills missing candle ranges from the exchange
// =============================================================================
//
// Given the gaps a range read reported, fetch them from the exchange and
// merge them into the chunk store:
//   1. Gaps entirely in the future are dropped, the rest clamped to "now".
//   2. Gaps older than a known history floor are skipped outright.
//   3. For daily-or-coarser series, near-adjacent gaps are fetched as one
//      request as long as the combined span fits in a single page.
//   4. Gaps run concurrently with bounded parallelism.
//   5. Each gap is paged newest-first; every page is merged immediately.
//   6. N consecutive empty pages end the walk and set the history floor.
//
// The consumer's cancellation token is checked before every request and
// every store write. Upstream failures are counted, never returned; store
// failures abort the fill.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{FeedError, Result};
use crate::exchange::ExchangeDataSource;
use crate::granularity::{Granularity, DAY};
use crate::resilience::backoff::delay_for_attempt;
use crate::runtime_config::BackfillConfig;
use crate::store::ChunkStore;
use crate::types::{normalize_symbol, Candle, GapRange};

/// What one `fill` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillReport {
    /// Pages requested (retries of one page count once).
    pub requests: usize,
    /// Candles accepted by the store.
    pub candles_written: usize,
    /// Pages that came back with no usable candle.
    pub empty_responses: usize,
    /// Pages that still failed after all retries.
    pub failed_requests: usize,
    /// Gaps dropped without a request (future or below the history floor).
    pub gaps_skipped: usize,
    /// The token fired before the fill finished.
    pub cancelled: bool,
}

impl FillReport {
    fn absorb(&mut self, other: FillReport) {
        self.requests += other.requests;
        self.candles_written += other.candles_written;
        self.empty_responses += other.empty_responses;
        self.failed_requests += other.failed_requests;
        self.gaps_skipped += other.gaps_skipped;
        self.cancelled |= other.cancelled;
    }
}

pub struct GapFiller {
    source: Arc<dyn ExchangeDataSource>,
    store: Arc<ChunkStore>,
    clock: Arc<dyn Clock>,
    config: BackfillConfig,
    /// Earliest open time known to exist, per series. Nothing older is
    /// requested again.
    history_floor: Mutex<HashMap<(String, Granularity), i64>>,
}

impl GapFiller {
    pub fn new(
        source: Arc<dyn ExchangeDataSource>,
        store: Arc<ChunkStore>,
        clock: Arc<dyn Clock>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            source,
            store,
            clock,
            config,
            history_floor: Mutex::new(HashMap::new()),
        }
    }

    pub fn history_floor(&self, symbol: &str, granularity: Granularity) -> Option<i64> {
        let symbol = normalize_symbol(symbol).ok()?;
        self.history_floor.lock().get(&(symbol, granularity)).copied()
    }

    fn page_size(&self) -> usize {
        self.config
            .max_candles_per_call
            .min(self.source.max_candles_per_call())
            .max(1)
    }

    /// Fetch `gaps` and merge the results into the store.
    pub async fn fill(
        &self,
        symbol: &str,
        granularity: Granularity,
        gaps: &[GapRange],
        cancel: &CancellationToken,
    ) -> Result<FillReport> {
        let symbol = normalize_symbol(symbol)?;
        let mut report = FillReport::default();

        let planned = self.plan(&symbol, granularity, gaps, &mut report);
        if planned.is_empty() {
            return Ok(report);
        }
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        info!(
            symbol = %symbol,
            granularity = %granularity,
            gaps = planned.len(),
            "backfill started"
        );

        let results: Vec<Result<FillReport>> = stream::iter(planned)
            .map(|gap| self.fill_gap(&symbol, granularity, gap, cancel))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            report.absorb(result?);
        }

        info!(
            symbol = %symbol,
            granularity = %granularity,
            requests = report.requests,
            written = report.candles_written,
            empty = report.empty_responses,
            failed = report.failed_requests,
            cancelled = report.cancelled,
            "backfill finished"
        );
        Ok(report)
    }

    /// Clamp, floor-filter and (for coarse series) coalesce the gaps.
    fn plan(
        &self,
        symbol: &str,
        granularity: Granularity,
        gaps: &[GapRange],
        report: &mut FillReport,
    ) -> Vec<GapRange> {
        let latest_slot = granularity.align(self.clock.now());
        let floor = self
            .history_floor
            .lock()
            .get(&(symbol.to_string(), granularity))
            .copied();

        let mut planned = Vec::with_capacity(gaps.len());
        for gap in gaps {
            if gap.end < gap.start || gap.start > latest_slot {
                report.gaps_skipped += 1;
                continue;
            }
            let mut gap = GapRange::new(gap.start, gap.end.min(latest_slot));
            if let Some(floor) = floor {
                if gap.end < floor {
                    debug!(symbol, granularity = %granularity, floor, "gap below history floor");
                    report.gaps_skipped += 1;
                    continue;
                }
                gap.start = gap.start.max(floor);
            }
            planned.push(gap);
        }

        if granularity.period_secs() >= DAY {
            planned = coalesce_gaps(
                planned,
                granularity,
                self.config.merge_gap_slack_periods,
                self.page_size(),
            );
        }
        planned
    }

    /// Walk one gap newest-first in page-sized requests.
    async fn fill_gap(
        &self,
        symbol: &str,
        granularity: Granularity,
        gap: GapRange,
        cancel: &CancellationToken,
    ) -> Result<FillReport> {
        let mut report = FillReport::default();
        let period = granularity.period_secs();
        let page_span = self.page_size() as i64 * period;

        let mut page_end = gap.end;
        let mut consecutive_empty = 0u32;
        // First slot above the current run of empty pages, and whether any
        // page in that run was a failure rather than a real empty answer.
        let mut run_top: Option<i64> = None;
        let mut run_had_failure = false;

        while page_end >= gap.start {
            let page_start = (page_end - page_span + period).max(gap.start);

            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.requests += 1;

            let mut candles = match self
                .fetch_page(symbol, granularity, page_start, page_end, cancel)
                .await
            {
                Ok(candles) => candles,
                Err(FeedError::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        symbol,
                        granularity = %granularity,
                        page_start,
                        page_end,
                        error = %e,
                        "backfill page failed after retries"
                    );
                    report.failed_requests += 1;
                    run_had_failure = true;
                    Vec::new()
                }
            };
            candles.retain(|c| c.open_time >= page_start && c.open_time <= page_end);
            candles.sort_by_key(|c| c.open_time);

            if candles.is_empty() {
                report.empty_responses += 1;
                consecutive_empty += 1;
                run_top.get_or_insert(page_end + period);
                if consecutive_empty >= self.config.max_consecutive_empty.max(1) {
                    if let Some(top) = run_top.filter(|_| !run_had_failure) {
                        self.record_floor(symbol, granularity, top);
                    }
                    info!(
                        symbol,
                        granularity = %granularity,
                        consecutive_empty,
                        "no more history upstream, stopping backfill walk"
                    );
                    break;
                }
            } else {
                consecutive_empty = 0;
                run_top = None;
                run_had_failure = false;

                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let outcome = self.store.merge_candles(symbol, granularity, &candles).await?;
                report.candles_written += outcome.accepted;
                debug!(
                    symbol,
                    granularity = %granularity,
                    page_start,
                    page_end,
                    written = outcome.accepted,
                    "backfill page merged"
                );
            }

            page_end = page_start - period;
        }
        Ok(report)
    }

    /// One page with timeout and bounded retries.
    async fn fetch_page(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: i64,
        end: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candle>> {
        let attempts = self.config.fetch_attempts.max(1);
        let timeout = self.config.request_timeout();
        let mut last_err = FeedError::UpstreamUnavailable("no fetch attempted".into());

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(FeedError::Cancelled);
            }
            let fetch = tokio::time::timeout(
                timeout,
                self.source.get_candles(symbol, granularity, start, end),
            );
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(FeedError::Cancelled),
                r = fetch => r.unwrap_or(Err(FeedError::Timeout(timeout))),
            };

            match result {
                Ok(candles) => return Ok(candles),
                Err(e) => {
                    if attempt + 1 < attempts && e.is_upstream() {
                        let delay = delay_for_attempt(
                            Duration::from_millis(self.config.retry_base_delay_ms),
                            Duration::from_millis(self.config.retry_max_delay_ms),
                            2.0,
                            attempt,
                        );
                        debug!(
                            symbol,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying candle fetch"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(FeedError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        last_err = e;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Err(last_err)
    }

    fn record_floor(&self, symbol: &str, granularity: Granularity, floor: i64) {
        let mut floors = self.history_floor.lock();
        let entry = floors.entry((symbol.to_string(), granularity)).or_insert(floor);
        *entry = (*entry).min(floor);
        info!(symbol, granularity = %granularity, floor = *entry, "history floor recorded");
    }
}

impl std::fmt::Debug for GapFiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapFiller")
            .field("source", &self.source.name())
            .field("config", &self.config)
            .field("floors", &self.history_floor.lock().len())
            .finish()
    }
}

/// Merge gaps separated by at most `slack_periods` cached periods, keeping
/// every merged request within `max_slots` candles.
fn coalesce_gaps(
    mut gaps: Vec<GapRange>,
    granularity: Granularity,
    slack_periods: i64,
    max_slots: usize,
) -> Vec<GapRange> {
    let period = granularity.period_secs();
    gaps.sort_by_key(|g| g.start);

    let mut out: Vec<GapRange> = Vec::with_capacity(gaps.len());
    for gap in gaps {
        if let Some(last) = out.last_mut() {
            let distance = gap.start - last.end;
            let merged = GapRange::new(last.start, last.end.max(gap.end));
            if distance <= (slack_periods.max(0) + 1) * period
                && merged.slots(granularity) <= max_slots as i64
            {
                *last = merged;
                continue;
            }
        }
        out.push(gap);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::testing::{candle_at, minute_candles, FailingStore, MockSource};

    const T0: i64 = 1_700_006_400; // 2023-11-15 00:00:00 UTC

    fn filler_with(
        source: Arc<MockSource>,
        now: i64,
        config: BackfillConfig,
    ) -> (GapFiller, Arc<ChunkStore>) {
        let clock = Arc::new(ManualClock::new(now * 1000));
        let store = Arc::new(ChunkStore::new(
            Arc::new(MemoryStore::new()),
            clock.clone(),
            BTreeMap::new(),
            100_000,
        ));
        (GapFiller::new(source, store.clone(), clock, config), store)
    }

    #[tokio::test]
    async fn gap_is_paged_newest_first_and_merged() {
        let source = MockSource::new(10);
        source.add_history(Granularity::Min1, &minute_candles(T0, 25, 100.0));
        let (filler, store) = filler_with(source.clone(), T0 + DAY, BackfillConfig::default());

        let gap = GapRange::new(T0, T0 + 24 * 60);
        let report = filler
            .fill("BTCUSDT", Granularity::Min1, &[gap], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.requests, 3);
        assert_eq!(report.candles_written, 25);
        let calls = source.calls();
        assert_eq!(calls[0].end, T0 + 24 * 60);
        assert_eq!(calls[0].start, T0 + 15 * 60);
        assert_eq!(calls[2].start, T0);

        let read = store.get_range("BTCUSDT", Granularity::Min1, T0, T0 + 24 * 60).await.unwrap();
        assert_eq!(read.candles.len(), 25);
        assert!(read.gaps.is_empty());
    }

    #[tokio::test]
    async fn future_gaps_are_dropped_and_straddling_ones_clamped() {
        let source = MockSource::new(300);
        let now = T0 + 600;
        let (filler, _) = filler_with(source.clone(), now, BackfillConfig::default());

        let gaps = [GapRange::new(now + 60, now + 600), GapRange::new(T0, now + 300)];
        let report = filler
            .fill("BTCUSDT", Granularity::Min1, &gaps, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.gaps_skipped, 1);
        let calls = source.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].end, now);
    }

    #[tokio::test]
    async fn consecutive_empty_pages_set_the_history_floor() {
        let source = MockSource::new(10);
        // Only the newest page has data.
        let listing = T0 + 90 * 60;
        source.add_history(Granularity::Min1, &minute_candles(listing, 10, 5.0));
        let (filler, _) = filler_with(source.clone(), T0 + DAY, BackfillConfig::default());

        let gap = GapRange::new(T0, listing + 9 * 60);
        let report = filler
            .fill("NEWCOIN", Granularity::Min1, &[gap], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.requests, 4);
        assert_eq!(report.empty_responses, 3);
        assert_eq!(filler.history_floor("newcoin", Granularity::Min1), Some(listing));

        // A later request entirely below the floor costs nothing.
        let older = GapRange::new(T0, T0 + 30 * 60);
        let report = filler
            .fill("NEWCOIN", Granularity::Min1, &[older], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.gaps_skipped, 1);
        assert_eq!(source.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let source = MockSource::new(300);
        source.add_history(Granularity::Min1, &minute_candles(T0, 5, 1.0));
        source.fail_next(FeedError::UpstreamUnavailable("502".into()));
        source.fail_next(FeedError::Timeout(Duration::from_secs(1)));
        let (filler, _) = filler_with(source.clone(), T0 + 3_600, BackfillConfig::default());

        let report = filler
            .fill(
                "BTCUSDT",
                Granularity::Min1,
                &[GapRange::new(T0, T0 + 240)],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(source.calls().len(), 3);
        assert_eq!(report.requests, 1);
        assert_eq!(report.failed_requests, 0);
        assert_eq!(report.candles_written, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_count_as_empty_but_set_no_floor() {
        let source = MockSource::new(10);
        for _ in 0..9 {
            source.fail_next(FeedError::UpstreamUnavailable("down".into()));
        }
        let (filler, _) = filler_with(source.clone(), T0 + DAY, BackfillConfig::default());

        let report = filler
            .fill(
                "BTCUSDT",
                Granularity::Min1,
                &[GapRange::new(T0, T0 + 99 * 60)],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.requests, 3);
        assert_eq!(report.failed_requests, 3);
        assert_eq!(source.calls().len(), 9);
        assert_eq!(filler.history_floor("BTCUSDT", Granularity::Min1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_request_times_out() {
        let source = MockSource::new(300);
        source.set_hang(true);
        let config = BackfillConfig {
            fetch_attempts: 1,
            request_timeout_ms: 1_000,
            ..BackfillConfig::default()
        };
        let (filler, _) = filler_with(source.clone(), T0 + 3_600, config);

        let report = filler
            .fill(
                "BTCUSDT",
                Granularity::Min1,
                &[GapRange::new(T0, T0 + 60)],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.failed_requests, 1);
        assert_eq!(report.candles_written, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gaps_run_with_bounded_concurrency() {
        let source = MockSource::new(300);
        source.add_history(Granularity::Min1, &minute_candles(T0, 60, 100.0));
        source.set_delay(Duration::from_millis(500));
        let config = BackfillConfig {
            concurrency: 3,
            ..BackfillConfig::default()
        };
        let (filler, store) = filler_with(source.clone(), T0 + DAY, config);

        // Eight separate two-minute holes, each fetched with one request.
        let gaps: Vec<GapRange> = (0..8)
            .map(|i| GapRange::new(T0 + i * 420, T0 + i * 420 + 60))
            .collect();
        let report = filler
            .fill("BTCUSDT", Granularity::Min1, &gaps, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.requests, 8);
        assert_eq!(report.candles_written, 16);
        assert_eq!(source.max_in_flight(), 3);
        assert_eq!(store.candle_count("BTCUSDT", Granularity::Min1).await.unwrap(), 16);
    }

    #[tokio::test]
    async fn daily_gaps_are_coalesced_into_one_request() {
        let source = MockSource::new(300);
        let days: Vec<Candle> = (0..6).map(|i| candle_at(T0 + i * DAY, 10.0)).collect();
        source.add_history(Granularity::Day1, &days);
        let (filler, store) = filler_with(source.clone(), T0 + 30 * DAY, BackfillConfig::default());

        let gaps = [
            GapRange::new(T0, T0),
            GapRange::new(T0 + 2 * DAY, T0 + 3 * DAY),
            GapRange::new(T0 + 5 * DAY, T0 + 5 * DAY),
        ];
        filler
            .fill("BTCUSDT", Granularity::Day1, &gaps, &CancellationToken::new())
            .await
            .unwrap();
        let calls = source.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].start, calls[0].end), (T0, T0 + 5 * DAY));
        assert_eq!(store.candle_count("BTCUSDT", Granularity::Day1).await.unwrap(), 6);
    }

    #[test]
    fn coalescing_respects_page_size_and_slack() {
        let d = DAY;
        let gaps = vec![
            GapRange::new(0, 0),
            GapRange::new(2 * d, 2 * d),
            GapRange::new(20 * d, 21 * d),
        ];
        let merged = coalesce_gaps(gaps.clone(), Granularity::Day1, 3, 300);
        assert_eq!(merged, vec![GapRange::new(0, 2 * d), GapRange::new(20 * d, 21 * d)]);

        let tight = coalesce_gaps(gaps, Granularity::Day1, 3, 2);
        assert_eq!(tight.len(), 3);
    }

    #[tokio::test]
    async fn cancelled_fill_stops_writing() {
        let source = MockSource::new(10);
        source.add_history(Granularity::Min1, &minute_candles(T0, 50, 1.0));
        let (filler, store) = filler_with(source.clone(), T0 + DAY, BackfillConfig::default());

        let token = CancellationToken::new();
        let trip = token.clone();
        source.on_fetch(move |_| trip.cancel());

        let report = filler
            .fill("BTCUSDT", Granularity::Min1, &[GapRange::new(T0, T0 + 49 * 60)], &token)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(source.calls().len(), 1);
        assert_eq!(report.candles_written, 0);
        assert_eq!(store.candle_count("BTCUSDT", Granularity::Min1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_failure_is_surfaced() {
        let source = MockSource::new(300);
        source.add_history(Granularity::Min1, &minute_candles(T0, 3, 1.0));
        let clock = Arc::new(ManualClock::new((T0 + 3_600) * 1000));
        let store = Arc::new(ChunkStore::new(
            Arc::new(FailingStore),
            clock.clone(),
            BTreeMap::new(),
            1_000,
        ));
        let filler = GapFiller::new(source, store, clock, BackfillConfig::default());

        let err = filler
            .fill(
                "BTCUSDT",
                Granularity::Min1,
                &[GapRange::new(T0, T0 + 120)],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_store());
    }
}
