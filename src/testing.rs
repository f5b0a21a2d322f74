// =============================================================================
// Test doubles
// =============================================================================
//
// Candle builders, a scripted exchange, a store that always fails and a clock
// that follows tokio's (possibly paused) time. Shared by the unit tests.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::error::{FeedError, Result};
use crate::exchange::{ExchangeDataSource, TickStream};
use crate::granularity::Granularity;
use crate::store::persistent::PersistentStore;
use crate::types::{Candle, Tick};

/// A valid candle at `t` centred on `price`.
pub fn candle_at(t: i64, price: f64) -> Candle {
    Candle::new(t, price, price + 1.0, price - 1.0, price, 1.0)
}

/// `n` consecutive one-minute candles starting at `start`.
pub fn minute_candles(start: i64, n: usize, price: f64) -> Vec<Candle> {
    (0..n as i64)
        .map(|i| candle_at(start + i * 60, price + i as f64))
        .collect()
}

// ---------------------------------------------------------------------------
// FailingStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FailingStore;

#[async_trait]
impl PersistentStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Err(FeedError::Store("injected read failure".into()))
    }

    async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
        Err(FeedError::Store("injected write failure".into()))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(FeedError::Store("injected delete failure".into()))
    }

    async fn scan_by_prefix(&self, _prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Err(FeedError::Store("injected scan failure".into()))
    }
}

// ---------------------------------------------------------------------------
// TokioClock
// ---------------------------------------------------------------------------

/// Wall clock that starts at `base_ms` and advances with tokio time, so
/// `tokio::time::advance` moves both timers and "now" together.
pub struct TokioClock {
    origin: tokio::time::Instant,
    base_ms: i64,
}

impl TokioClock {
    pub fn new(base_ms: i64) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            base_ms,
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.base_ms + self.origin.elapsed().as_millis() as i64
    }
}

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

/// One recorded `get_candles` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCall {
    pub granularity: Granularity,
    pub start: i64,
    pub end: i64,
}

type FetchHook = Box<dyn Fn(&FetchCall) + Send + Sync>;

/// Counts a fetch as in flight until dropped, including when the caller
/// gives up on it.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(current)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted exchange. Serves candles from an in-memory history (newest first,
/// to exercise caller-side sorting), pops scripted failures before serving,
/// and hands out tick streams fed through `push_tick`.
pub struct MockSource {
    max_per_call: usize,
    history: Mutex<BTreeMap<Granularity, BTreeMap<i64, Candle>>>,
    failures: Mutex<VecDeque<FeedError>>,
    calls: Mutex<Vec<FetchCall>>,
    hook: Mutex<Option<FetchHook>>,
    hang: Mutex<bool>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    tick_senders: Mutex<Vec<mpsc::UnboundedSender<Result<Tick>>>>,
    subscribe_failures: AtomicU32,
    subscribe_calls: AtomicU32,
}

impl MockSource {
    pub fn new(max_per_call: usize) -> Arc<Self> {
        Arc::new(Self {
            max_per_call,
            history: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
            hang: Mutex::new(false),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            tick_senders: Mutex::new(Vec::new()),
            subscribe_failures: AtomicU32::new(0),
            subscribe_calls: AtomicU32::new(0),
        })
    }

    pub fn add_history(&self, granularity: Granularity, candles: &[Candle]) {
        let mut history = self.history.lock();
        let series = history.entry(granularity).or_default();
        for c in candles {
            series.insert(c.open_time, *c);
        }
    }

    pub fn fail_next(&self, err: FeedError) {
        self.failures.lock().push_back(err);
    }

    /// Every fetch never completes until cleared.
    pub fn set_hang(&self, hang: bool) {
        *self.hang.lock() = hang;
    }

    /// Every fetch takes `delay` of (tokio) time before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Most fetches that were ever running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn on_fetch(&self, hook: impl Fn(&FetchCall) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    pub fn fail_subscribes(&self, n: u32) {
        self.subscribe_failures.store(n, Ordering::SeqCst);
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Deliver a tick to every open stream.
    pub fn push_tick(&self, price: f64, volume: f64, timestamp_ms: i64) {
        self.tick_senders.lock().retain(|tx| {
            tx.send(Ok(Tick {
                price,
                volume,
                timestamp_ms,
            }))
            .is_ok()
        });
    }

    /// Terminate every open stream with an error.
    pub fn disconnect(&self) {
        for tx in self.tick_senders.lock().drain(..) {
            let _ = tx.send(Err(FeedError::UpstreamUnavailable("disconnected".into())));
        }
    }
}

#[async_trait]
impl ExchangeDataSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    fn max_candles_per_call(&self) -> usize {
        self.max_per_call
    }

    async fn get_candles(
        &self,
        _symbol: &str,
        granularity: Granularity,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>> {
        let call = FetchCall {
            granularity,
            start,
            end,
        };
        self.calls.lock().push(call);
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(&call);
        }
        let _in_flight = InFlight::enter(&self.in_flight, &self.max_in_flight);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let hang = *self.hang.lock();
        if hang {
            std::future::pending::<()>().await;
        }
        let scripted = self.failures.lock().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        if end < start {
            return Ok(Vec::new());
        }
        let history = self.history.lock();
        let mut out: Vec<Candle> = history
            .get(&granularity)
            .map(|series| {
                series
                    .range(start..=end)
                    .map(|(_, c)| *c)
                    .take(self.max_per_call)
                    .collect()
            })
            .unwrap_or_default();
        out.reverse();
        Ok(out)
    }

    async fn subscribe_ticks(&self, symbol: &str) -> Result<TickStream> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.subscribe_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.subscribe_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(FeedError::UpstreamUnavailable(format!(
                "refusing {symbol} subscription"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.tick_senders.lock().push(tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}
