// =============================================================================
// Live subscriptions
// =============================================================================
//
// Each subscription gets its own forwarding task that reads the aggregator's
// broadcast, keeps only its symbol, and passes updates on while its consumer
// holds the active slot. Coarse granularities are rolled up from the base
// candles as they arrive. A closed base candle that lands in a period the
// rollup has already left (an exchange correction) re-announces that period,
// rebuilt from the store.
// =============================================================================

use std::sync::Weak;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::aggregate::LiveRollup;
use crate::granularity::Granularity;
use crate::types::{CandleUpdate, ConsumerId};

use super::DataFeed;

/// Handle to a stream of live candles. Dropping it unsubscribes.
pub struct LiveSubscription {
    symbol: String,
    subscription: u64,
    receiver: mpsc::Receiver<CandleUpdate>,
    stop: CancellationToken,
    feed: Weak<DataFeed>,
    released: bool,
}

impl LiveSubscription {
    pub(super) fn new(
        symbol: String,
        subscription: u64,
        receiver: mpsc::Receiver<CandleUpdate>,
        stop: CancellationToken,
        feed: Weak<DataFeed>,
    ) -> Self {
        Self {
            symbol,
            subscription,
            receiver,
            stop,
            feed,
            released: false,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Next update. `None` once the subscription has ended, either through
    /// `unsubscribe` or because the consumer was removed.
    pub async fn recv(&mut self) -> Option<CandleUpdate> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CandleUpdate> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.stop.cancel();
        self.receiver.close();
        if let Some(feed) = self.feed.upgrade() {
            feed.release_live(&self.symbol, self.subscription);
        }
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LiveSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSubscription")
            .field("symbol", &self.symbol)
            .field("subscription", &self.subscription)
            .finish()
    }
}

pub(super) async fn forward(
    feed: Weak<DataFeed>,
    id: ConsumerId,
    symbol: String,
    mut updates: broadcast::Receiver<CandleUpdate>,
    tx: mpsc::Sender<CandleUpdate>,
    stop: CancellationToken,
) {
    let base = Granularity::BASE;
    let mut rollup: Option<LiveRollup> = None;

    loop {
        let update = tokio::select! {
            _ = stop.cancelled() => break,
            _ = tx.closed() => break,
            received = updates.recv() => match received {
                Ok(update) => update,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(consumer = %id, symbol = %symbol, skipped, "live forwarder lagged");
                    rollup = None;
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        if update.symbol != symbol {
            continue;
        }

        let Some(owner) = feed.upgrade() else {
            break;
        };
        let Some((active, granularity)) = owner.delivery_target(id) else {
            break;
        };
        if !active {
            rollup = None;
            continue;
        }

        let outgoing = if granularity == base {
            update
        } else {
            if rollup.as_ref().map(LiveRollup::target) != Some(granularity) {
                match owner
                    .seeded_rollup(&symbol, granularity, update.candle.open_time)
                    .await
                {
                    Ok(seeded) => rollup = Some(seeded),
                    Err(e) => {
                        warn!(symbol = %symbol, granularity = %granularity, error = %e, "live rollup seed failed");
                        continue;
                    }
                }
            }
            let t = update.candle.open_time;
            let bucket = granularity.align(t);
            let (candle, closed) = match rollup.as_mut().and_then(|r| r.update(&update.candle)) {
                Some(candle) => {
                    let last_in_period = granularity.align(t + base.period_secs()) != bucket;
                    (candle, update.closed && last_in_period)
                }
                // A correction for a period the rollup has already left.
                None if update.closed => {
                    match owner.rebuilt_bucket(&symbol, granularity, bucket).await {
                        Ok(Some(candle)) => (candle, true),
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(symbol = %symbol, granularity = %granularity, bucket, error = %e, "closed period rebuild failed");
                            continue;
                        }
                    }
                }
                None => continue,
            };
            CandleUpdate {
                symbol: symbol.clone(),
                granularity,
                candle,
                closed,
            }
        };
        drop(owner);

        if tx.send(outgoing).await.is_err() {
            break;
        }
    }
    debug!(consumer = %id, symbol = %symbol, "live forwarder finished");
}
