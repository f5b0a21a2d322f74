// =============================================================================
// Tick Aggregator — live prints into one-minute candles
// =============================================================================
//
// Per-symbol state machine:
//
//   NoCandle ──first tick──▶ Open(m) ──tick in m+k / timer at m+1──▶ Open(m')
//
// Crossing a minute boundary finalizes the open candle (persisted to the
// chunk store) and opens the next one with `open = last price`, so
// consecutive candles never show an artificial gap. A per-symbol timer fires
// on every boundary so candles finalize even when no tick arrives; in that
// case the new candle is flat at the last price with zero volume.
//
// Shortly after each finalization the last couple of minutes are fetched
// from the exchange and any finalized candle that differs is overwritten.
// Live ticks are an approximation; the exchange's own candle wins.
//
// Updates are published on a broadcast channel. A closed candle is
// published only after it has been written to the store.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Scheduler;
use crate::error::{FeedError, Result};
use crate::exchange::ExchangeDataSource;
use crate::granularity::{Granularity, MINUTE};
use crate::runtime_config::TickConfig;
use crate::store::ChunkStore;
use crate::types::{normalize_symbol, Candle, CandleUpdate, Tick};

/// In-memory live candle of one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LiveCandle {
    NoCandle,
    Open(Candle),
}

struct SymbolState {
    live: LiveCandle,
    last_price: Option<f64>,
    /// Distinguishes this run of the symbol from an earlier stopped one, so a
    /// timer that was mid-flight during `stop` cannot re-arm itself.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    reconcilers: Vec<JoinHandle<()>>,
}

enum Step {
    Updated(Candle),
    Finalized { closed: Candle, opened: Candle },
}

pub struct TickAggregator {
    store: Arc<ChunkStore>,
    source: Arc<dyn ExchangeDataSource>,
    scheduler: Scheduler,
    config: TickConfig,
    states: Mutex<HashMap<String, SymbolState>>,
    generations: AtomicU64,
    updates: broadcast::Sender<CandleUpdate>,
}

impl TickAggregator {
    pub fn new(
        store: Arc<ChunkStore>,
        source: Arc<dyn ExchangeDataSource>,
        scheduler: Scheduler,
        config: TickConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            store,
            source,
            scheduler,
            config,
            states: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            updates,
        }
    }

    /// Live candle updates for every running symbol.
    pub fn subscribe(&self) -> broadcast::Receiver<CandleUpdate> {
        self.updates.subscribe()
    }

    /// Begin aggregating `symbol`. Idempotent.
    pub fn start(self: &Arc<Self>, symbol: &str) -> Result<()> {
        let symbol = normalize_symbol(symbol)?;
        let generation = {
            let mut states = self.states.lock();
            if states.contains_key(&symbol) {
                return Ok(());
            }
            let generation = self.generations.fetch_add(1, Ordering::Relaxed);
            states.insert(
                symbol.clone(),
                SymbolState {
                    live: LiveCandle::NoCandle,
                    last_price: None,
                    generation,
                    timer: None,
                    reconcilers: Vec::new(),
                },
            );
            generation
        };
        info!(symbol = %symbol, "tick aggregation started");
        self.arm_timer(&symbol, generation);
        Ok(())
    }

    /// Stop aggregating `symbol`: cancels its timers and forgets the live
    /// candle. Persisted candles stay. Returns `false` if it was not running.
    pub fn stop(&self, symbol: &str) -> bool {
        let Ok(symbol) = normalize_symbol(symbol) else {
            return false;
        };
        let Some(state) = self.states.lock().remove(&symbol) else {
            return false;
        };
        if let Some(timer) = state.timer {
            timer.abort();
        }
        for task in state.reconcilers {
            task.abort();
        }
        info!(symbol = %symbol, "tick aggregation stopped");
        true
    }

    pub fn is_running(&self, symbol: &str) -> bool {
        normalize_symbol(symbol)
            .map(|s| self.states.lock().contains_key(&s))
            .unwrap_or(false)
    }

    pub fn live_candle(&self, symbol: &str) -> Option<LiveCandle> {
        let symbol = normalize_symbol(symbol).ok()?;
        self.states.lock().get(&symbol).map(|s| s.live)
    }

    /// The candle currently accumulating, if any.
    pub fn current_candle(&self, symbol: &str) -> Option<Candle> {
        match self.live_candle(symbol)? {
            LiveCandle::Open(candle) => Some(candle),
            LiveCandle::NoCandle => None,
        }
    }

    // -------------------------------------------------------------------------
    // Ticks
    // -------------------------------------------------------------------------

    /// Fold one tick into the symbol's live candle. Ticks for symbols that are
    /// not running, and ticks older than the open minute, are dropped.
    pub async fn on_tick(self: &Arc<Self>, symbol: &str, tick: Tick) -> Result<()> {
        if !(tick.price.is_finite() && tick.price > 0.0) || tick.volume < 0.0 {
            warn!(symbol, price = tick.price, volume = tick.volume, "dropping invalid tick");
            return Ok(());
        }
        let symbol = normalize_symbol(symbol)?;
        let bucket = Granularity::BASE.align(tick.timestamp_ms.div_euclid(1000));
        let price = tick.price;

        let step = {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(&symbol) else {
                debug!(symbol = %symbol, "tick for a symbol that is not running");
                return Ok(());
            };
            let step = match state.live {
                LiveCandle::NoCandle => {
                    let candle = Candle::new(bucket, price, price, price, price, tick.volume);
                    Step::Updated(candle)
                }
                LiveCandle::Open(mut candle) if bucket == candle.open_time => {
                    candle.high = candle.high.max(price);
                    candle.low = candle.low.min(price);
                    candle.close = price;
                    candle.volume += tick.volume;
                    Step::Updated(candle)
                }
                LiveCandle::Open(candle) if bucket > candle.open_time => {
                    let open = state.last_price.unwrap_or(candle.close);
                    let opened = Candle::new(
                        bucket,
                        open,
                        open.max(price),
                        open.min(price),
                        price,
                        tick.volume,
                    );
                    Step::Finalized {
                        closed: candle,
                        opened,
                    }
                }
                LiveCandle::Open(candle) => {
                    debug!(
                        symbol = %symbol,
                        tick_ms = tick.timestamp_ms,
                        open_time = candle.open_time,
                        "late tick ignored"
                    );
                    return Ok(());
                }
            };
            state.live = LiveCandle::Open(match step {
                Step::Updated(c) => c,
                Step::Finalized { opened, .. } => opened,
            });
            state.last_price = Some(price);
            step
        };

        self.publish(&symbol, step).await
    }

    // -------------------------------------------------------------------------
    // Minute timer
    // -------------------------------------------------------------------------

    fn arm_timer(self: &Arc<Self>, symbol: &str, generation: u64) {
        let now = self.scheduler.clock().now();
        let boundary = Granularity::BASE.align(now) + MINUTE;

        let mut states = self.states.lock();
        let Some(state) = states.get_mut(symbol) else {
            return;
        };
        if state.generation != generation {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let sym = symbol.to_string();
        let handle = self.scheduler.schedule_at(boundary * 1000, async move {
            if let Some(this) = weak.upgrade() {
                this.on_boundary(&sym, boundary, generation).await;
                this.arm_timer(&sym, generation);
            }
        });
        state.timer = Some(handle);
    }

    async fn on_boundary(self: &Arc<Self>, symbol: &str, boundary: i64, generation: u64) {
        let step = {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(symbol) else {
                return;
            };
            if state.generation != generation {
                return;
            }
            match state.live {
                LiveCandle::Open(closed) if closed.open_time < boundary => {
                    let price = state.last_price.unwrap_or(closed.close);
                    let opened = Candle::flat(boundary, price);
                    state.live = LiveCandle::Open(opened);
                    Step::Finalized { closed, opened }
                }
                _ => return,
            }
        };
        debug!(symbol, boundary, "minute closed by timer");
        if let Err(e) = self.publish(symbol, step).await {
            error!(symbol, error = %e, "failed to persist timer-finalized candle");
        }
    }

    // -------------------------------------------------------------------------
    // Publishing and reconciliation
    // -------------------------------------------------------------------------

    async fn publish(self: &Arc<Self>, symbol: &str, step: Step) -> Result<()> {
        match step {
            Step::Updated(candle) => {
                self.emit(symbol, candle, false);
                Ok(())
            }
            Step::Finalized { closed, opened } => {
                let persisted = self
                    .store
                    .merge_candles(symbol, Granularity::BASE, &[closed])
                    .await;
                // Nothing downstream hears about a close the store never saw.
                if let Err(e) = persisted {
                    self.emit(symbol, opened, false);
                    return Err(e);
                }
                self.emit(symbol, closed, true);
                self.emit(symbol, opened, false);
                self.schedule_reconcile(symbol, closed.open_time);
                debug!(
                    symbol,
                    open_time = closed.open_time,
                    close = closed.close,
                    volume = closed.volume,
                    "minute candle finalized"
                );
                Ok(())
            }
        }
    }

    fn emit(&self, symbol: &str, candle: Candle, closed: bool) {
        // No receivers is fine.
        let _ = self.updates.send(CandleUpdate {
            symbol: symbol.to_string(),
            granularity: Granularity::BASE,
            candle,
            closed,
        });
    }

    fn schedule_reconcile(self: &Arc<Self>, symbol: &str, open_time: i64) {
        let at = self.scheduler.clock().now_ms() + self.config.reconcile_delay_ms as i64;
        let weak: Weak<Self> = Arc::downgrade(self);
        let sym = symbol.to_string();
        let handle = self.scheduler.schedule_at(at, async move {
            if let Some(this) = weak.upgrade() {
                if let Err(e) = this.reconcile(&sym, open_time).await {
                    warn!(symbol = %sym, open_time, error = %e, "candle reconciliation failed");
                }
            }
        });

        let mut states = self.states.lock();
        match states.get_mut(symbol) {
            Some(state) => {
                state.reconcilers.retain(|task| !task.is_finished());
                state.reconcilers.push(handle);
            }
            None => handle.abort(),
        }
    }

    /// Overwrite finalized candles up to `open_time` with the exchange's
    /// version where it differs. Returns how many candles were corrected.
    pub async fn reconcile(&self, symbol: &str, open_time: i64) -> Result<usize> {
        let symbol = normalize_symbol(symbol)?;
        let base = Granularity::BASE;
        let start = open_time + MINUTE - self.config.reconcile_lookback_secs.max(MINUTE);

        let timeout = self.config.reconcile_timeout();
        let fetched = tokio::time::timeout(
            timeout,
            self.source.get_candles(&symbol, base, start, open_time),
        )
        .await
        .map_err(|_| FeedError::Timeout(timeout))??;
        let cached: HashMap<i64, Candle> = self
            .store
            .get_range(&symbol, base, start, open_time)
            .await?
            .candles
            .into_iter()
            .map(|c| (c.open_time, c))
            .collect();

        let mut corrections: Vec<Candle> = fetched
            .into_iter()
            .filter(|c| c.open_time >= start && c.open_time <= open_time)
            .filter(|c| c.validate_for(base).is_ok())
            .filter(|c| cached.get(&c.open_time).map_or(true, |old| !old.same_values(c)))
            .collect();
        corrections.sort_by_key(|c| c.open_time);
        corrections.dedup_by_key(|c| c.open_time);

        if corrections.is_empty() {
            debug!(symbol = %symbol, open_time, "live candles match exchange");
            return Ok(0);
        }

        self.store.merge_candles(&symbol, base, &corrections).await?;
        for candle in &corrections {
            info!(
                symbol = %symbol,
                open_time = candle.open_time,
                close = candle.close,
                volume = candle.volume,
                "live candle corrected from exchange"
            );
            self.emit(&symbol, *candle, true);
        }
        Ok(corrections.len())
    }
}

impl std::fmt::Debug for TickAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickAggregator")
            .field("symbols", &self.states.lock().len())
            .field("config", &self.config)
            .finish()
    }
}
