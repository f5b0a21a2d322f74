// =============================================================================
// Data Feed Orchestrator
// =============================================================================
//
// Ties the cache, the gap filler, the tick aggregator and the resilient tick
// feed together behind the consumer API:
//
//   register_consumer / remove_consumer
//   get_range(symbol, granularity, start, end, consumer)
//   subscribe_live(symbol, consumer)          -> LiveSubscription
//   set_active_instance / clear_active_instance
//   set_granularity / set_visible_range        (hysteresis + debounce)
//
// Exactly one consumer may be active. Live updates reach only the active
// consumer, and taking the active slot away from a consumer cancels its
// in-flight backfills.
// =============================================================================

pub mod consumer;
pub mod hysteresis;
pub mod live;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, LiveRollup};
use crate::clock::{Clock, Scheduler};
use crate::error::{FeedError, Result};
use crate::exchange::ExchangeDataSource;
use crate::gap_filler::GapFiller;
use crate::granularity::{Granularity, EARLIEST_TIMESTAMP};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::tick_feed::TickFeed;
use crate::runtime_config::{FeedConfig, OrchestratorConfig};
use crate::store::{ChunkStore, PersistentStore};
use crate::tick_aggregator::TickAggregator;
use crate::types::{normalize_symbol, Candle, ConsumerId, GapRange};

pub use consumer::ConsumerSnapshot;
pub use hysteresis::GranularityBands;
pub use live::LiveSubscription;

use consumer::ConsumerInstance;

/// Fallback capacity for a granularity missing from the config.
const DEFAULT_CAPACITY: usize = 10_000;

struct LiveSymbol {
    feed_cancel: CancellationToken,
    subscribers: HashSet<u64>,
}

#[derive(Default)]
struct Registry {
    consumers: HashMap<ConsumerId, ConsumerInstance>,
    active: Option<ConsumerId>,
    live: HashMap<String, LiveSymbol>,
    next_subscription: u64,
}

pub struct DataFeed {
    store: Arc<ChunkStore>,
    filler: Arc<GapFiller>,
    aggregator: Arc<TickAggregator>,
    tick_feed: TickFeed,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    bands: GranularityBands,
    live_capacity: usize,
    registry: Mutex<Registry>,
}

impl DataFeed {
    /// Build the whole pipeline over one exchange and one persistent store.
    pub fn new(
        source: Arc<dyn ExchangeDataSource>,
        backend: Arc<dyn PersistentStore>,
        clock: Arc<dyn Clock>,
        config: &FeedConfig,
    ) -> Arc<Self> {
        let capacity: BTreeMap<Granularity, usize> = Granularity::all()
            .iter()
            .map(|g| (*g, config.capacity_for(*g)))
            .collect();
        let store = Arc::new(ChunkStore::new(
            backend,
            clock.clone(),
            capacity,
            DEFAULT_CAPACITY,
        ));
        let filler = Arc::new(GapFiller::new(
            source.clone(),
            store.clone(),
            clock.clone(),
            config.backfill.clone(),
        ));
        let aggregator = Arc::new(TickAggregator::new(
            store.clone(),
            source.clone(),
            Scheduler::new(clock.clone()),
            config.ticks.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            format!("{}-ticks", source.name()),
            config.breaker.clone(),
        ));
        let tick_feed = TickFeed::new(source, aggregator.clone(), breaker, config.reconnect.clone());

        Arc::new(Self {
            store,
            filler,
            aggregator,
            tick_feed,
            clock,
            bands: GranularityBands::new(config.orchestrator.bands.clone()),
            config: config.orchestrator.clone(),
            live_capacity: config.ticks.channel_capacity.max(1),
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn gap_filler(&self) -> &Arc<GapFiller> {
        &self.filler
    }

    pub fn tick_aggregator(&self) -> &Arc<TickAggregator> {
        &self.aggregator
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.tick_feed.breaker()
    }

    // -------------------------------------------------------------------------
    // Consumers
    // -------------------------------------------------------------------------

    pub fn register_consumer(&self) -> ConsumerId {
        let id = ConsumerId::new();
        self.registry
            .lock()
            .consumers
            .insert(id, ConsumerInstance::new(id, Granularity::BASE));
        debug!(consumer = %id, "consumer registered");
        id
    }

    /// Cancel the consumer's work, end its live subscriptions and forget it.
    pub fn remove_consumer(&self, id: ConsumerId) -> Result<()> {
        let mut registry = self.registry.lock();
        let mut consumer = registry
            .consumers
            .remove(&id)
            .ok_or(FeedError::UnknownConsumer(id))?;
        consumer.close();
        if registry.active == Some(id) {
            registry.active = None;
        }
        info!(consumer = %id, "consumer removed");
        Ok(())
    }

    pub fn consumer(&self, id: ConsumerId) -> Option<ConsumerSnapshot> {
        let registry = self.registry.lock();
        registry
            .consumers
            .get(&id)
            .map(|c| c.snapshot(registry.active == Some(id)))
    }

    /// Make `id` the one consumer receiving live updates. The previously
    /// active consumer's in-flight work is cancelled.
    pub fn set_active_instance(&self, id: ConsumerId) -> Result<()> {
        let mut registry = self.registry.lock();
        if !registry.consumers.contains_key(&id) {
            return Err(FeedError::UnknownConsumer(id));
        }
        let previous = registry.active.replace(id);
        if let Some(prev) = previous.filter(|p| *p != id) {
            if let Some(consumer) = registry.consumers.get_mut(&prev) {
                consumer.abort_work();
            }
            info!(consumer = %id, previous = %prev, "active consumer switched, previous work cancelled");
        } else if previous.is_none() {
            info!(consumer = %id, "consumer activated");
        }
        Ok(())
    }

    /// Leave no consumer active. The formerly active one has its work
    /// cancelled.
    pub fn clear_active_instance(&self) {
        let mut registry = self.registry.lock();
        if let Some(prev) = registry.active.take() {
            if let Some(consumer) = registry.consumers.get_mut(&prev) {
                consumer.abort_work();
            }
            info!(previous = %prev, "active consumer cleared");
        }
    }

    pub fn active_instance(&self) -> Option<ConsumerId> {
        self.registry.lock().active
    }

    fn work_token(&self, id: ConsumerId) -> Result<CancellationToken> {
        self.registry
            .lock()
            .consumers
            .get(&id)
            .map(|c| c.work.clone())
            .ok_or(FeedError::UnknownConsumer(id))
    }

    // -------------------------------------------------------------------------
    // Granularity
    // -------------------------------------------------------------------------

    pub fn granularity(&self, id: ConsumerId) -> Result<Granularity> {
        self.registry
            .lock()
            .consumers
            .get(&id)
            .map(|c| c.granularity)
            .ok_or(FeedError::UnknownConsumer(id))
    }

    /// Committed granularity changes for `id`.
    pub fn watch_granularity(&self, id: ConsumerId) -> Result<watch::Receiver<Granularity>> {
        self.registry
            .lock()
            .consumers
            .get(&id)
            .map(|c| c.watch_granularity())
            .ok_or(FeedError::UnknownConsumer(id))
    }

    /// Set the granularity immediately, dropping any pending debounced switch.
    pub fn set_granularity(&self, id: ConsumerId, granularity: Granularity) -> Result<()> {
        let mut registry = self.registry.lock();
        let consumer = registry
            .consumers
            .get_mut(&id)
            .ok_or(FeedError::UnknownConsumer(id))?;
        if consumer.commit_granularity(granularity) {
            info!(consumer = %id, granularity = %granularity, "granularity set");
        }
        Ok(())
    }

    /// Record the consumer's visible range and pick a granularity for it with
    /// hysteresis. A change is committed only after the debounce delay passes
    /// without another range update. Returns the granularity the consumer is
    /// heading to.
    pub fn set_visible_range(
        self: &Arc<Self>,
        id: ConsumerId,
        start: i64,
        end: i64,
    ) -> Result<Granularity> {
        if end < start {
            return Err(FeedError::InvalidRange { start, end });
        }
        let mut registry = self.registry.lock();
        let consumer = registry
            .consumers
            .get_mut(&id)
            .ok_or(FeedError::UnknownConsumer(id))?;
        consumer.visible_range = Some((start, end));

        let target = self.bands.select(Some(consumer.granularity), end - start);
        if target == consumer.granularity {
            consumer.cancel_debounce();
            return Ok(target);
        }

        debug!(
            consumer = %id,
            from = %consumer.granularity,
            to = %target,
            span_secs = end - start,
            "granularity switch pending"
        );
        let weak: Weak<Self> = Arc::downgrade(self);
        let delay = Duration::from_millis(self.config.debounce_ms);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(feed) = weak.upgrade() {
                feed.commit_debounced(id, target);
            }
        });
        consumer.set_debounce(task);
        Ok(target)
    }

    fn commit_debounced(&self, id: ConsumerId, target: Granularity) {
        let mut registry = self.registry.lock();
        if let Some(consumer) = registry.consumers.get_mut(&id) {
            consumer.finish_debounce();
            if consumer.commit_granularity(target) {
                info!(consumer = %id, granularity = %target, "granularity switched");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Range reads
    // -------------------------------------------------------------------------

    /// Best available candles for `[start, end]`. Material gaps are backfilled
    /// under the consumer's work token first; whatever could not be filled is
    /// simply absent. Only store failures are returned as errors.
    pub async fn get_range(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: i64,
        end: i64,
        id: ConsumerId,
    ) -> Result<Vec<Candle>> {
        let symbol = normalize_symbol(symbol)?;
        let token = self.work_token(id)?;

        let mut read = self.store.get_range(&symbol, granularity, start, end).await?;
        if !read.gaps.is_empty()
            && !token.is_cancelled()
            && is_material(
                &read.gaps,
                granularity,
                start.max(EARLIEST_TIMESTAMP),
                end.min(granularity.align(self.clock.now())),
                self.config.gap_materiality,
            )
        {
            match self.filler.fill(&symbol, granularity, &read.gaps, &token).await {
                Ok(report) => {
                    debug!(
                        consumer = %id,
                        symbol = %symbol,
                        written = report.candles_written,
                        cancelled = report.cancelled,
                        "range backfill done"
                    );
                    if report.candles_written > 0 {
                        read = self.store.get_range(&symbol, granularity, start, end).await?;
                    }
                }
                Err(e) if e.is_store() => return Err(e),
                Err(e) => warn!(symbol = %symbol, error = %e, "range backfill failed"),
            }
        }

        self.overlay_current_bucket(&symbol, granularity, start, end, read.candles)
            .await
    }

    /// For a coarse series, replace the period covering "now" with the rollup
    /// of cached base candles (plus the live one), provided the base data
    /// covers that period without holes from its start.
    async fn overlay_current_bucket(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: i64,
        end: i64,
        mut candles: Vec<Candle>,
    ) -> Result<Vec<Candle>> {
        let base = Granularity::BASE;
        if granularity == base {
            return Ok(candles);
        }
        let now = self.clock.now();
        let bucket = granularity.align(now);
        if bucket < start || bucket > end {
            return Ok(candles);
        }

        let mut minutes: BTreeMap<i64, Candle> = self
            .store
            .get_range(symbol, base, bucket, base.align(now))
            .await?
            .candles
            .into_iter()
            .map(|c| (c.open_time, c))
            .collect();
        if let Some(live) = self.aggregator.current_candle(symbol) {
            if live.open_time >= bucket {
                minutes.insert(live.open_time, live);
            }
        }
        let (Some(first), Some(last)) = (minutes.keys().next(), minutes.keys().next_back()) else {
            return Ok(candles);
        };
        let contiguous = (last - first) / base.period_secs() + 1 == minutes.len() as i64;
        if *first != bucket || !contiguous {
            return Ok(candles);
        }

        let minutes: Vec<Candle> = minutes.into_values().collect();
        let Some(rolled) = aggregate(&minutes, base, granularity)?.pop() else {
            return Ok(candles);
        };
        match candles.last_mut() {
            Some(newest) if newest.open_time == bucket => *newest = rolled,
            Some(newest) if newest.open_time > bucket => {}
            _ => candles.push(rolled),
        }
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Live updates
    // -------------------------------------------------------------------------

    /// Receive live candles for `symbol`, rolled up to the consumer's
    /// granularity. Updates are delivered only while the consumer is active.
    /// The symbol's tick feed starts with its first subscription and stops
    /// when the last one goes away.
    pub fn subscribe_live(self: &Arc<Self>, symbol: &str, id: ConsumerId) -> Result<LiveSubscription> {
        let symbol = normalize_symbol(symbol)?;
        let (subscription, lifetime, start_feed) = {
            let mut registry = self.registry.lock();
            let lifetime = registry
                .consumers
                .get(&id)
                .map(|c| c.lifetime.clone())
                .ok_or(FeedError::UnknownConsumer(id))?;
            registry.next_subscription += 1;
            let subscription = registry.next_subscription;

            let mut start_feed = None;
            let live = registry.live.entry(symbol.clone()).or_insert_with(|| {
                let cancel = CancellationToken::new();
                start_feed = Some(cancel.clone());
                LiveSymbol {
                    feed_cancel: cancel,
                    subscribers: HashSet::new(),
                }
            });
            live.subscribers.insert(subscription);
            (subscription, lifetime, start_feed)
        };

        if let Some(cancel) = start_feed {
            self.aggregator.start(&symbol)?;
            tokio::spawn(self.tick_feed.clone().run(symbol.clone(), cancel));
            info!(symbol = %symbol, "live feed started");
        }

        let (tx, rx) = mpsc::channel(self.live_capacity);
        let stop = lifetime.child_token();
        tokio::spawn(live::forward(
            Arc::downgrade(self),
            id,
            symbol.clone(),
            self.aggregator.subscribe(),
            tx,
            stop.clone(),
        ));
        debug!(consumer = %id, symbol = %symbol, subscription, "live subscription opened");
        Ok(LiveSubscription::new(
            symbol,
            subscription,
            rx,
            stop,
            Arc::downgrade(self),
        ))
    }

    /// `(is_active, granularity)` for a consumer, `None` once it is gone.
    fn delivery_target(&self, id: ConsumerId) -> Option<(bool, Granularity)> {
        let registry = self.registry.lock();
        registry
            .consumers
            .get(&id)
            .map(|c| (registry.active == Some(id), c.granularity))
    }

    /// A rollup for `target` primed with the cached base candles of the
    /// period containing `at`, up to and including `at`.
    async fn seeded_rollup(&self, symbol: &str, target: Granularity, at: i64) -> Result<LiveRollup> {
        let mut rollup = LiveRollup::new(Granularity::BASE, target)?;
        let cached = self
            .store
            .get_range(symbol, Granularity::BASE, target.align(at), at)
            .await?;
        rollup.seed(&cached.candles);
        Ok(rollup)
    }

    /// The `target` candle opening at `bucket`, rolled up again from the
    /// cached base candles.
    async fn rebuilt_bucket(
        &self,
        symbol: &str,
        target: Granularity,
        bucket: i64,
    ) -> Result<Option<Candle>> {
        let base = Granularity::BASE;
        let last_minute = bucket + target.period_secs() - base.period_secs();
        let cached = self
            .store
            .get_range(symbol, base, bucket, last_minute)
            .await?;
        Ok(aggregate(&cached.candles, base, target)?
            .into_iter()
            .find(|c| c.open_time == bucket))
    }

    fn release_live(&self, symbol: &str, subscription: u64) {
        let stopped = {
            let mut registry = self.registry.lock();
            let Some(live) = registry.live.get_mut(symbol) else {
                return;
            };
            live.subscribers.remove(&subscription);
            if live.subscribers.is_empty() {
                registry.live.remove(symbol).map(|l| l.feed_cancel)
            } else {
                None
            }
        };
        debug!(symbol, subscription, "live subscription closed");
        if let Some(cancel) = stopped {
            cancel.cancel();
            self.aggregator.stop(symbol);
            info!(symbol, "live feed stopped, no subscribers left");
        }
    }

    pub fn live_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.registry.lock().live.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

impl std::fmt::Debug for DataFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("DataFeed")
            .field("consumers", &registry.consumers.len())
            .field("active", &registry.active)
            .field("live_symbols", &registry.live.len())
            .finish()
    }
}

/// Whether the missing slots exceed `threshold` of the slots in `[start, end]`.
/// Slots after `end` are ignored.
fn is_material(
    gaps: &[GapRange],
    granularity: Granularity,
    start: i64,
    end: i64,
    threshold: f64,
) -> bool {
    let first = granularity.align_up(start);
    if first > end {
        return false;
    }
    let total = (end - first) / granularity.period_secs() + 1;
    let missing: i64 = gaps
        .iter()
        .filter(|g| g.start <= end)
        .map(|g| GapRange::new(g.start, g.end.min(end)).slots(granularity))
        .sum();
    missing as f64 > threshold * total as f64
}
