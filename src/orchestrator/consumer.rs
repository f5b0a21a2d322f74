// =============================================================================
// Consumer instances
// =============================================================================
//
// A consumer is one logical reader of the feed (a chart pane, a simulation
// run). It owns two tokens:
//   - `work`: covers its in-flight fetches. Cancelled and replaced whenever
//     the consumer loses the active slot, so stale backfills stop writing.
//   - `lifetime`: cancelled once, on removal; ends its live subscriptions.
// =============================================================================

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::granularity::Granularity;
use crate::types::ConsumerId;

/// Read-only view of a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSnapshot {
    pub id: ConsumerId,
    pub active: bool,
    pub granularity: Granularity,
    pub visible_range: Option<(i64, i64)>,
}

pub(crate) struct ConsumerInstance {
    pub id: ConsumerId,
    pub granularity: Granularity,
    pub visible_range: Option<(i64, i64)>,
    pub work: CancellationToken,
    pub lifetime: CancellationToken,
    granularity_tx: watch::Sender<Granularity>,
    debounce: Option<JoinHandle<()>>,
}

impl ConsumerInstance {
    pub fn new(id: ConsumerId, granularity: Granularity) -> Self {
        let (granularity_tx, _) = watch::channel(granularity);
        Self {
            id,
            granularity,
            visible_range: None,
            work: CancellationToken::new(),
            lifetime: CancellationToken::new(),
            granularity_tx,
            debounce: None,
        }
    }

    pub fn watch_granularity(&self) -> watch::Receiver<Granularity> {
        self.granularity_tx.subscribe()
    }

    /// Cancel everything in flight for this consumer and hand out a fresh
    /// token for future work.
    pub fn abort_work(&mut self) {
        self.work.cancel();
        self.work = CancellationToken::new();
    }

    /// Switch the shown granularity. Returns `false` if nothing changed.
    pub fn commit_granularity(&mut self, granularity: Granularity) -> bool {
        self.cancel_debounce();
        if self.granularity == granularity {
            return false;
        }
        self.granularity = granularity;
        self.granularity_tx.send_replace(granularity);
        true
    }

    pub fn set_debounce(&mut self, task: JoinHandle<()>) {
        self.cancel_debounce();
        self.debounce = Some(task);
    }

    pub fn cancel_debounce(&mut self) {
        if let Some(task) = self.debounce.take() {
            task.abort();
        }
    }

    /// Drop the debounce handle without aborting it (the task is the caller).
    pub fn finish_debounce(&mut self) {
        self.debounce = None;
    }

    pub fn close(&mut self) {
        self.cancel_debounce();
        self.work.cancel();
        self.lifetime.cancel();
    }

    pub fn snapshot(&self, active: bool) -> ConsumerSnapshot {
        ConsumerSnapshot {
            id: self.id,
            active,
            granularity: self.granularity,
            visible_range: self.visible_range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_work_cancels_old_token_only() {
        let mut consumer = ConsumerInstance::new(ConsumerId::new(), Granularity::Min1);
        let old = consumer.work.clone();
        consumer.abort_work();
        assert!(old.is_cancelled());
        assert!(!consumer.work.is_cancelled());
        assert!(!consumer.lifetime.is_cancelled());
    }

    #[test]
    fn granularity_commits_are_published() {
        let mut consumer = ConsumerInstance::new(ConsumerId::new(), Granularity::Min1);
        let mut rx = consumer.watch_granularity();
        assert!(!consumer.commit_granularity(Granularity::Min1));
        assert!(!rx.has_changed().unwrap());
        assert!(consumer.commit_granularity(Granularity::Hour1));
        assert_eq!(*rx.borrow_and_update(), Granularity::Hour1);
    }

    #[test]
    fn close_cancels_everything() {
        let mut consumer = ConsumerInstance::new(ConsumerId::new(), Granularity::Min1);
        consumer.close();
        assert!(consumer.work.is_cancelled());
        assert!(consumer.lifetime.is_cancelled());
        assert!(!consumer.snapshot(false).active);
    }
}
