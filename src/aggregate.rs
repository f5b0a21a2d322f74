// =============================================================================
// Timeframe Aggregation — rolls fine candles up into coarser periods
// =============================================================================
//
// Bucketing always goes through `Granularity::align`, so daily buckets start
// at UTC midnight and weekly ones on Monday 00:00 UTC. Rollups follow the
// fixed DAG in `granularity.rs`; a request with no direct rule is composed
// hop by hop along the shortest path.
// =============================================================================

use std::collections::BTreeMap;

use crate::error::{FeedError, Result};
use crate::granularity::Granularity;
use crate::types::Candle;

/// Roll `candles` (at `source` granularity, any order) up to `target`.
/// Duplicate open times keep the last occurrence.
pub fn aggregate(
    candles: &[Candle],
    source: Granularity,
    target: Granularity,
) -> Result<Vec<Candle>> {
    let path = source
        .rollup_path(target)
        .ok_or(FeedError::UnsupportedRollup {
            from: source,
            to: target,
        })?;

    let mut current: Vec<Candle> = candles
        .iter()
        .map(|c| (c.open_time, *c))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .collect();

    for hop in path.windows(2) {
        current = rollup_step(&current, hop[1]);
    }
    Ok(current)
}

/// One direct rollup. `candles` must be ascending by `open_time`.
pub fn rollup_step(candles: &[Candle], target: Granularity) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::new();
    let mut bucket: Option<Candle> = None;

    for candle in candles {
        let start = target.align(candle.open_time);
        match bucket.as_mut() {
            Some(agg) if agg.open_time == start => extend(agg, candle),
            _ => {
                if let Some(done) = bucket.take() {
                    out.push(done);
                }
                bucket = Some(Candle { open_time: start, ..*candle });
            }
        }
    }
    out.extend(bucket);
    out
}

/// Fold one newer base candle into `buckets`, opening the target bucket if
/// needed. Returns the updated aggregate.
pub fn apply_incremental(
    buckets: &mut BTreeMap<i64, Candle>,
    base: &Candle,
    target: Granularity,
) -> Candle {
    let start = target.align(base.open_time);
    let agg = buckets
        .entry(start)
        .and_modify(|agg| extend(agg, base))
        .or_insert(Candle {
            open_time: start,
            ..*base
        });
    *agg
}

fn extend(agg: &mut Candle, next: &Candle) {
    agg.high = agg.high.max(next.high);
    agg.low = agg.low.min(next.low);
    agg.close = next.close;
    agg.volume += next.volume;
}

// ---------------------------------------------------------------------------
// LiveRollup
// ---------------------------------------------------------------------------

/// Rolls a live base-candle feed into one coarser granularity.
///
/// The in-progress base candle is re-sent on every tick, so members are kept
/// by open time and a repeat replaces its earlier version instead of adding
/// its volume twice.
#[derive(Debug, Clone)]
pub struct LiveRollup {
    source: Granularity,
    target: Granularity,
    bucket_start: Option<i64>,
    members: BTreeMap<i64, Candle>,
    current: Option<Candle>,
}

impl LiveRollup {
    pub fn new(source: Granularity, target: Granularity) -> Result<Self> {
        if source.rollup_path(target).is_none() {
            return Err(FeedError::UnsupportedRollup {
                from: source,
                to: target,
            });
        }
        Ok(Self {
            source,
            target,
            bucket_start: None,
            members: BTreeMap::new(),
            current: None,
        })
    }

    pub fn target(&self) -> Granularity {
        self.target
    }

    /// Prime the rollup with already-cached base candles.
    pub fn seed(&mut self, candles: &[Candle]) {
        for candle in candles {
            self.update(candle);
        }
    }

    /// Apply a base candle. Returns the current aggregate, or `None` when the
    /// candle belongs to a bucket that is already behind us.
    pub fn update(&mut self, base: &Candle) -> Option<Candle> {
        let start = self.target.align(base.open_time);
        match self.bucket_start {
            Some(current) if start < current => return None,
            Some(current) if start == current => {}
            _ => {
                self.bucket_start = Some(start);
                self.members.clear();
                self.current = None;
            }
        }

        let newest = self.members.keys().next_back().copied();
        let replaced = self.members.insert(base.open_time, *base).is_some();

        let appended = !replaced && newest.is_some_and(|last| base.open_time > last);
        self.current = match self.current {
            Some(mut agg) if appended => {
                extend(&mut agg, base);
                Some(agg)
            }
            _ => self.recompute(),
        };
        self.current
    }

    pub fn current(&self) -> Option<Candle> {
        self.current
    }

    fn recompute(&self) -> Option<Candle> {
        let mut candles: Vec<Candle> = self.members.values().copied().collect();
        let path = self.source.rollup_path(self.target)?;
        for hop in path.windows(2) {
            candles = rollup_step(&candles, hop[1]);
        }
        candles.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{candle_at, minute_candles};

    const T0: i64 = 1_700_006_400; // Wednesday 2023-11-15 00:00 UTC
    const MONDAY: i64 = 1_699_833_600; // 2023-11-13

    #[test]
    fn five_minutes_roll_into_one() {
        let base = vec![
            Candle::new(T0, 10.0, 12.0, 9.0, 11.0, 1.0),
            Candle::new(T0 + 60, 11.0, 15.0, 10.5, 14.0, 2.0),
            Candle::new(T0 + 120, 14.0, 14.5, 8.0, 9.0, 3.0),
            Candle::new(T0 + 180, 9.0, 10.0, 8.5, 9.5, 4.0),
            Candle::new(T0 + 240, 9.5, 11.0, 9.0, 10.5, 5.0),
        ];
        let out = aggregate(&base, Granularity::Min1, Granularity::Min5).unwrap();
        assert_eq!(out, vec![Candle::new(T0, 10.0, 15.0, 8.0, 10.5, 15.0)]);
    }

    #[test]
    fn unordered_input_and_duplicates() {
        let mut base = minute_candles(T0, 10, 100.0);
        base.reverse();
        base.push(Candle::new(T0, 50.0, 51.0, 49.0, 50.0, 7.0));
        let out = aggregate(&base, Granularity::Min1, Granularity::Min5).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].open, 50.0);
        assert_eq!(out[0].volume, 7.0 + 4.0);
        assert_eq!(out[1].open_time, T0 + 300);
        assert_eq!(out[1].close, 109.0);
    }

    #[test]
    fn weekly_buckets_start_on_monday() {
        let sunday = Candle::new(MONDAY - 86_400, 1.0, 2.0, 0.5, 1.5, 1.0);
        let monday = Candle::new(MONDAY, 1.5, 3.0, 1.0, 2.5, 2.0);
        let out = aggregate(&[sunday, monday], Granularity::Day1, Granularity::Week1).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].open_time, MONDAY - 7 * 86_400);
        assert_eq!(out[1].open_time, MONDAY);
        assert_eq!(out[1].open, 1.5);
    }

    #[test]
    fn multi_hop_matches_direct_fold() {
        let base = minute_candles(T0, 120, 10.0);
        let hourly = aggregate(&base, Granularity::Min1, Granularity::Hour1).unwrap();
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].open_time, T0);
        assert_eq!(hourly[0].open, 10.0);
        assert_eq!(hourly[0].close, 69.0);
        assert_eq!(hourly[0].high, 70.0);
        assert_eq!(hourly[0].low, 9.0);
        assert_eq!(hourly[0].volume, 60.0);
        assert_eq!(hourly[1].open_time, T0 + 3_600);

        let daily = aggregate(&base, Granularity::Min1, Granularity::Day1).unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].volume, 120.0);
    }

    #[test]
    fn missing_rule_is_an_error() {
        assert!(matches!(
            aggregate(&[], Granularity::Min5, Granularity::Min1),
            Err(FeedError::UnsupportedRollup { .. })
        ));
        assert!(aggregate(&[], Granularity::Hour4, Granularity::Hour6).is_err());
        assert!(aggregate(&[], Granularity::Hour1, Granularity::Hour1).unwrap().is_empty());
    }

    #[test]
    fn incremental_extends_then_opens_new_bucket() {
        let mut buckets = BTreeMap::new();
        let first = apply_incremental(&mut buckets, &candle_at(T0 + 60, 10.0), Granularity::Min5);
        assert_eq!(first.open_time, T0);
        assert_eq!(first.open, 10.0);

        let second = apply_incremental(
            &mut buckets,
            &Candle::new(T0 + 120, 10.0, 20.0, 10.0, 19.0, 2.0),
            Granularity::Min5,
        );
        assert_eq!(second.open, 10.0);
        assert_eq!(second.high, 20.0);
        assert_eq!(second.close, 19.0);
        assert_eq!(second.volume, 3.0);

        apply_incremental(&mut buckets, &candle_at(T0 + 300, 5.0), Granularity::Min5);
        assert_eq!(buckets.len(), 2);
    }

    #[test]
    fn live_rollup_does_not_double_count_repeats() {
        let mut live = LiveRollup::new(Granularity::Min1, Granularity::Min15).unwrap();
        live.seed(&minute_candles(T0, 3, 100.0));

        let in_progress = Candle::new(T0 + 180, 102.0, 103.0, 101.0, 102.5, 1.0);
        live.update(&in_progress);
        let again = Candle { close: 103.0, volume: 2.5, ..in_progress };
        let agg = live.update(&again).unwrap();

        assert_eq!(agg.open_time, T0);
        assert_eq!(agg.open, 100.0);
        assert_eq!(agg.close, 103.0);
        assert_eq!(agg.volume, 3.0 + 2.5);

        // Stale minute from an earlier bucket is ignored.
        assert!(live.update(&candle_at(T0 - 60, 1.0)).is_none());

        let next = live.update(&candle_at(T0 + 900, 110.0)).unwrap();
        assert_eq!(next.open_time, T0 + 900);
        assert_eq!(next.volume, 1.0);
        assert_eq!(live.current(), Some(next));
    }

    #[test]
    fn live_rollup_rejects_impossible_target() {
        assert!(LiveRollup::new(Granularity::Hour4, Granularity::Hour12).is_err());
    }
}
