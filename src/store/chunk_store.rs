// =============================================================================
// Chunk Store — durable, gap-aware candle cache
// =============================================================================
//
// Candles are persisted in chunks addressed by (symbol, granularity, boundary
// start). The store offers:
//   - `get_range`: ordered, deduplicated candles plus the missing slots.
//   - `merge_candles`: last-write-wins merge, then prune, then metadata.
//   - `prune`: capacity enforcement with a 20 % hysteresis margin.
//
// Concurrency: every read-modify-write of a chunk holds that chunk's async
// mutex, so concurrent merges into the same chunk never lose updates while
// merges into different chunks run in parallel. Pruning a series and
// rebuilding a symbol's metadata are serialized per series / per symbol.
//
// Metadata is never maintained incrementally. After every mutating batch it
// is recomputed from a full scan of the symbol's chunks, so a batch that
// fails half-way cannot leave counts that disagree with the data.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{FeedError, Result};
use crate::granularity::{Granularity, EARLIEST_TIMESTAMP, LATEST_TIMESTAMP};
use crate::store::chunk::{chunk_key, series_prefix, symbol_prefix, Chunk, MergeStats};
use crate::store::persistent::PersistentStore;
use crate::types::{normalize_symbol, Candle, GapRange};

/// Fraction of capacity kept after a prune.
const PRUNE_TARGET_RATIO: f64 = 0.8;
/// Above this many boundary windows a range read scans the series instead of
/// probing every key.
const MAX_POINT_READS: usize = 512;
/// Idle lock entries are swept once the table grows past this size.
const LOCK_TABLE_SWEEP_AT: usize = 1_024;

// ---------------------------------------------------------------------------
// Public result types
// ---------------------------------------------------------------------------

/// Result of a range read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeRead {
    /// Strictly ascending by `open_time`.
    pub candles: Vec<Candle>,
    /// Ascending, non-overlapping runs of missing period starts.
    pub gaps: Vec<GapRange>,
}

/// Result of a merge batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub accepted: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub pruned: usize,
}

/// Coverage of one (symbol, granularity) series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub start: i64,
    pub end: i64,
    pub count: usize,
}

/// Derived per-symbol summary, rebuilt from a full chunk scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMetadata {
    pub symbol: String,
    pub earliest: Option<i64>,
    pub latest: Option<i64>,
    pub per_granularity: BTreeMap<Granularity, SeriesStats>,
    /// Wall-clock ms of the rebuild.
    pub rebuilt_at: i64,
}

fn metadata_key(symbol: &str) -> String {
    format!("meta/{symbol}")
}

// ---------------------------------------------------------------------------
// Keyed async locks
// ---------------------------------------------------------------------------

/// One async mutex per key, created on demand.
#[derive(Default)]
struct KeyedLocks {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock();
            if table.len() > LOCK_TABLE_SWEEP_AT {
                table.retain(|_, l| Arc::strong_count(l) > 1);
            }
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// ChunkStore
// ---------------------------------------------------------------------------

pub struct ChunkStore {
    backend: Arc<dyn PersistentStore>,
    clock: Arc<dyn Clock>,
    capacity: BTreeMap<Granularity, usize>,
    default_capacity: usize,
    chunk_locks: KeyedLocks,
    series_locks: KeyedLocks,
    meta_locks: KeyedLocks,
}

impl ChunkStore {
    /// `capacity` maps each granularity to its maximum candle count; missing
    /// entries use `default_capacity`.
    pub fn new(
        backend: Arc<dyn PersistentStore>,
        clock: Arc<dyn Clock>,
        capacity: BTreeMap<Granularity, usize>,
        default_capacity: usize,
    ) -> Self {
        Self {
            backend,
            clock,
            capacity,
            default_capacity,
            chunk_locks: KeyedLocks::default(),
            series_locks: KeyedLocks::default(),
            meta_locks: KeyedLocks::default(),
        }
    }

    pub fn capacity_for(&self, granularity: Granularity) -> usize {
        self.capacity
            .get(&granularity)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Cached candles with `open_time` in `[start, end]` and the slots with no
    /// candle.
    pub async fn get_range(
        &self,
        symbol: &str,
        granularity: Granularity,
        start: i64,
        end: i64,
    ) -> Result<RangeRead> {
        let symbol = normalize_symbol(symbol)?;
        if end < start {
            return Err(FeedError::InvalidRange { start, end });
        }
        let start = start.max(EARLIEST_TIMESTAMP);
        let end = end.min(LATEST_TIMESTAMP);
        if end < start {
            return Ok(RangeRead::default());
        }

        let boundaries = chunk_boundaries(granularity, start, end, MAX_POINT_READS + 1);
        let chunks = if boundaries.len() > MAX_POINT_READS {
            self.load_series(&symbol, granularity)
                .await?
                .into_iter()
                .filter(|c| c.start_time <= end && c.end_time >= start)
                .collect()
        } else {
            let mut chunks = Vec::with_capacity(boundaries.len());
            for boundary in boundaries {
                if let Some(chunk) = self
                    .load_chunk(&chunk_key(&symbol, granularity, boundary))
                    .await?
                {
                    chunks.push(chunk);
                }
            }
            chunks
        };

        let mut by_time: BTreeMap<i64, Candle> = BTreeMap::new();
        for chunk in &chunks {
            for candle in chunk.candles_in(start, end) {
                by_time.insert(candle.open_time, *candle);
            }
        }
        let candles: Vec<Candle> = by_time.into_values().collect();
        let gaps = compute_gaps(&candles, granularity, start, end);

        debug!(
            symbol = %symbol,
            granularity = %granularity,
            start,
            end,
            chunks = chunks.len(),
            candles = candles.len(),
            gaps = gaps.len(),
            "range read"
        );
        Ok(RangeRead { candles, gaps })
    }

    /// Total candles cached for one series.
    pub async fn candle_count(&self, symbol: &str, granularity: Granularity) -> Result<usize> {
        let symbol = normalize_symbol(symbol)?;
        Ok(self
            .load_series(&symbol, granularity)
            .await?
            .iter()
            .map(Chunk::len)
            .sum())
    }

    /// Last persisted metadata for `symbol`, if any batch was ever written.
    pub async fn metadata(&self, symbol: &str) -> Result<Option<SymbolMetadata>> {
        let symbol = normalize_symbol(symbol)?;
        match self.backend.get(&metadata_key(&symbol)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Merge a batch into the cache. Invalid candles are skipped and logged;
    /// the rest of the batch still lands. Store failures abort and propagate.
    pub async fn merge_candles(
        &self,
        symbol: &str,
        granularity: Granularity,
        candles: &[Candle],
    ) -> Result<MergeOutcome> {
        let symbol = normalize_symbol(symbol)?;
        let mut outcome = MergeOutcome::default();

        let mut groups: BTreeMap<i64, Vec<Candle>> = BTreeMap::new();
        for candle in candles {
            if let Err(reason) = candle.validate_for(granularity) {
                warn!(
                    symbol = %symbol,
                    granularity = %granularity,
                    open_time = candle.open_time,
                    reason = %reason,
                    "rejecting malformed candle"
                );
                outcome.rejected += 1;
                continue;
            }
            outcome.accepted += 1;
            groups
                .entry(granularity.chunk_start(candle.open_time))
                .or_default()
                .push(*candle);
        }

        if groups.is_empty() {
            return Ok(outcome);
        }

        let writes = groups
            .into_iter()
            .map(|(boundary, batch)| self.merge_into_chunk(&symbol, granularity, boundary, batch));
        for stats in try_join_all(writes).await? {
            outcome.inserted += stats.inserted;
            outcome.replaced += stats.replaced;
        }

        outcome.pruned = self.prune_series(&symbol, granularity).await?;
        self.rebuild_metadata(&symbol).await?;

        debug!(
            symbol = %symbol,
            granularity = %granularity,
            accepted = outcome.accepted,
            rejected = outcome.rejected,
            inserted = outcome.inserted,
            replaced = outcome.replaced,
            pruned = outcome.pruned,
            "candles merged"
        );
        Ok(outcome)
    }

    async fn merge_into_chunk(
        &self,
        symbol: &str,
        granularity: Granularity,
        boundary: i64,
        batch: Vec<Candle>,
    ) -> Result<MergeStats> {
        let key = chunk_key(symbol, granularity, boundary);
        let _guard = self.chunk_locks.lock(&key).await;

        let mut chunk = self
            .load_chunk(&key)
            .await?
            .unwrap_or_else(|| Chunk::new(symbol, granularity, boundary));
        let stats = chunk.merge(&batch, self.clock.now_ms());
        self.save_chunk(&chunk).await?;
        Ok(stats)
    }

    /// Enforce the capacity of one series and refresh the symbol's metadata.
    /// Returns the number of candles removed.
    pub async fn prune(&self, symbol: &str, granularity: Granularity) -> Result<usize> {
        let symbol = normalize_symbol(symbol)?;
        let removed = self.prune_series(&symbol, granularity).await?;
        self.rebuild_metadata(&symbol).await?;
        Ok(removed)
    }

    async fn prune_series(&self, symbol: &str, granularity: Granularity) -> Result<usize> {
        let _series = self
            .series_locks
            .lock(&series_prefix(symbol, granularity))
            .await;

        let mut chunks = self.load_series(symbol, granularity).await?;
        let total: usize = chunks.iter().map(Chunk::len).sum();
        let capacity = self.capacity_for(granularity);
        if total <= capacity {
            return Ok(0);
        }

        let target = (capacity as f64 * PRUNE_TARGET_RATIO).floor() as usize;
        let mut budget = total - target;
        chunks.sort_by_key(Chunk::boundary);

        let mut removed = 0;
        let mut deleted_chunks = 0;
        for stale in chunks {
            if budget == 0 {
                break;
            }
            let _guard = self.chunk_locks.lock(&stale.chunk_id).await;
            // Re-read under the lock; a merge may have landed since the scan.
            let Some(mut chunk) = self.load_chunk(&stale.chunk_id).await? else {
                continue;
            };
            let n = budget.min(chunk.len());
            if n == chunk.len() {
                self.backend.delete(&chunk.chunk_id).await?;
                deleted_chunks += 1;
            } else {
                chunk.trim_oldest(n, self.clock.now_ms());
                self.save_chunk(&chunk).await?;
            }
            budget -= n;
            removed += n;
        }

        info!(
            symbol = %symbol,
            granularity = %granularity,
            total,
            capacity,
            removed,
            deleted_chunks,
            "series pruned"
        );
        Ok(removed)
    }

    /// Delete every chunk of one series.
    pub async fn clear_series(&self, symbol: &str, granularity: Granularity) -> Result<usize> {
        let symbol = normalize_symbol(symbol)?;
        let _series = self
            .series_locks
            .lock(&series_prefix(&symbol, granularity))
            .await;
        let chunks = self.load_series(&symbol, granularity).await?;
        let mut removed = 0;
        for chunk in &chunks {
            let _guard = self.chunk_locks.lock(&chunk.chunk_id).await;
            self.backend.delete(&chunk.chunk_id).await?;
            removed += chunk.len();
        }
        drop(_series);
        self.rebuild_metadata(&symbol).await?;
        info!(symbol = %symbol, granularity = %granularity, removed, "series cleared");
        Ok(removed)
    }

    /// Recompute `symbol`'s metadata from a full scan and persist it.
    pub async fn rebuild_metadata(&self, symbol: &str) -> Result<SymbolMetadata> {
        let _guard = self.meta_locks.lock(symbol).await;

        let mut per_granularity: BTreeMap<Granularity, SeriesStats> = BTreeMap::new();
        for (_, bytes) in self.backend.scan_by_prefix(&symbol_prefix(symbol)).await? {
            let chunk: Chunk = serde_json::from_slice(&bytes)?;
            let (Some(first), Some(last)) = (chunk.candles.first(), chunk.candles.last()) else {
                continue;
            };
            let stats = per_granularity
                .entry(chunk.granularity)
                .or_insert(SeriesStats {
                    start: first.open_time,
                    end: last.open_time,
                    count: 0,
                });
            stats.start = stats.start.min(first.open_time);
            stats.end = stats.end.max(last.open_time);
            stats.count += chunk.len();
        }

        let meta = SymbolMetadata {
            symbol: symbol.to_string(),
            earliest: per_granularity.values().map(|s| s.start).min(),
            latest: per_granularity.values().map(|s| s.end).max(),
            per_granularity,
            rebuilt_at: self.clock.now_ms(),
        };
        self.backend
            .put(&metadata_key(symbol), serde_json::to_vec(&meta)?)
            .await?;
        Ok(meta)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn load_chunk(&self, key: &str) -> Result<Option<Chunk>> {
        match self.backend.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_chunk(&self, chunk: &Chunk) -> Result<()> {
        self.backend
            .put(&chunk.chunk_id, serde_json::to_vec(chunk)?)
            .await
    }

    async fn load_series(&self, symbol: &str, granularity: Granularity) -> Result<Vec<Chunk>> {
        self.backend
            .scan_by_prefix(&series_prefix(symbol, granularity))
            .await?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(FeedError::from))
            .collect()
    }
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("capacity", &self.capacity)
            .field("default_capacity", &self.default_capacity)
            .finish()
    }
}

/// Boundary starts of the chunks overlapping `[start, end]`, stopping early
/// once `limit` is exceeded.
fn chunk_boundaries(granularity: Granularity, start: i64, end: i64, limit: usize) -> Vec<i64> {
    let mut out = Vec::new();
    let mut boundary = granularity.chunk_start(start);
    while boundary <= end && out.len() < limit {
        out.push(boundary);
        let next = granularity.next_chunk_start(boundary);
        if next <= boundary {
            break;
        }
        boundary = next;
    }
    out
}

/// Missing period starts in `[start, end]`, merged into inclusive runs.
/// `candles` must be ascending by `open_time`.
///
/// Walks the cached candles once and emits the holes between them, so the
/// cost does not depend on how many slots the range spans.
pub fn compute_gaps(
    candles: &[Candle],
    granularity: Granularity,
    start: i64,
    end: i64,
) -> Vec<GapRange> {
    let period = granularity.period_secs();
    let first = granularity.align_up(start);
    if first > end {
        return Vec::new();
    }
    let last = granularity.align(end);

    let mut gaps = Vec::new();
    // First slot not yet known to be cached or missing.
    let mut next = first;
    for t in candles.iter().map(|c| c.open_time) {
        if t > last {
            break;
        }
        if t < next || !granularity.is_aligned(t) {
            continue;
        }
        if t > next {
            gaps.push(GapRange::new(next, t - period));
        }
        next = t.saturating_add(period);
    }
    if next <= last {
        gaps.push(GapRange::new(next, last));
    }
    gaps
}
