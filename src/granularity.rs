// =============================================================================
// Granularity — the fixed set of candle periods and their calendar rules
// =============================================================================
//
// Sub-day periods all divide 24h, so a plain modulo from the epoch lands them
// on UTC midnight. Daily candles start at 00:00 UTC and weekly candles start on
// Monday 00:00 UTC (the epoch itself was a Thursday, so weeks are offset).
//
// Chunk boundaries widen with the period so a symbol never accumulates more
// than a few hundred chunks per granularity:
//   1m / 5m / 15m / 30m  -> one UTC day
//   1h                   -> one week (Monday)
//   4h / 6h / 12h        -> one calendar month
//   1d / 1w              -> one calendar year
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

pub const MINUTE: i64 = 60;
pub const HOUR: i64 = 60 * MINUTE;
pub const DAY: i64 = 24 * HOUR;
pub const WEEK: i64 = 7 * DAY;

/// 0001-01-01T00:00:00Z. Range reads clamp their start here.
pub const EARLIEST_TIMESTAMP: i64 = -62_135_596_800;
/// 9999-12-31T23:59:59Z. Range reads clamp their end here.
pub const LATEST_TIMESTAMP: i64 = 253_402_300_799;

/// 1970-01-05, the first Monday after the epoch.
const FIRST_MONDAY: i64 = 4 * DAY;
/// `NaiveDate::num_days_from_ce` of 1970-01-01.
const EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// Candle period. Ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "6h")]
    Hour6,
    #[serde(rename = "12h")]
    Hour12,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1w")]
    Week1,
}

/// Width of the storage bucket a chunk covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSpan {
    Day,
    Week,
    Month,
    Year,
}

/// Rollup rules that exist directly. Every edge divides evenly.
const ROLLUP_EDGES: &[(Granularity, Granularity)] = &[
    (Granularity::Min1, Granularity::Min5),
    (Granularity::Min5, Granularity::Min15),
    (Granularity::Min15, Granularity::Min30),
    (Granularity::Min30, Granularity::Hour1),
    (Granularity::Hour1, Granularity::Hour4),
    (Granularity::Hour1, Granularity::Hour6),
    (Granularity::Hour6, Granularity::Hour12),
    (Granularity::Hour4, Granularity::Day1),
    (Granularity::Hour12, Granularity::Day1),
    (Granularity::Day1, Granularity::Week1),
];

impl Granularity {
    /// The granularity live ticks are aggregated into.
    pub const BASE: Granularity = Granularity::Min1;

    pub fn all() -> &'static [Granularity] {
        &[
            Granularity::Min1,
            Granularity::Min5,
            Granularity::Min15,
            Granularity::Min30,
            Granularity::Hour1,
            Granularity::Hour4,
            Granularity::Hour6,
            Granularity::Hour12,
            Granularity::Day1,
            Granularity::Week1,
        ]
    }

    pub fn period_secs(self) -> i64 {
        match self {
            Granularity::Min1 => MINUTE,
            Granularity::Min5 => 5 * MINUTE,
            Granularity::Min15 => 15 * MINUTE,
            Granularity::Min30 => 30 * MINUTE,
            Granularity::Hour1 => HOUR,
            Granularity::Hour4 => 4 * HOUR,
            Granularity::Hour6 => 6 * HOUR,
            Granularity::Hour12 => 12 * HOUR,
            Granularity::Day1 => DAY,
            Granularity::Week1 => WEEK,
        }
    }

    /// Short label, also used as the exchange interval and in store keys.
    pub fn label(self) -> &'static str {
        match self {
            Granularity::Min1 => "1m",
            Granularity::Min5 => "5m",
            Granularity::Min15 => "15m",
            Granularity::Min30 => "30m",
            Granularity::Hour1 => "1h",
            Granularity::Hour4 => "4h",
            Granularity::Hour6 => "6h",
            Granularity::Hour12 => "12h",
            Granularity::Day1 => "1d",
            Granularity::Week1 => "1w",
        }
    }

    /// Start of the period containing `ts` (seconds).
    pub fn align(self, ts: i64) -> i64 {
        match self {
            Granularity::Week1 => align_week(ts),
            _ => {
                let p = self.period_secs();
                ts.div_euclid(p) * p
            }
        }
    }

    /// First period start that is `>= ts`.
    pub fn align_up(self, ts: i64) -> i64 {
        let aligned = self.align(ts);
        if aligned < ts {
            aligned.saturating_add(self.period_secs())
        } else {
            aligned
        }
    }

    pub fn is_aligned(self, ts: i64) -> bool {
        self.align(ts) == ts
    }

    pub fn chunk_span(self) -> ChunkSpan {
        match self {
            Granularity::Min1 | Granularity::Min5 | Granularity::Min15 | Granularity::Min30 => {
                ChunkSpan::Day
            }
            Granularity::Hour1 => ChunkSpan::Week,
            Granularity::Hour4 | Granularity::Hour6 | Granularity::Hour12 => ChunkSpan::Month,
            Granularity::Day1 | Granularity::Week1 => ChunkSpan::Year,
        }
    }

    /// Boundary start of the chunk that stores a candle opening at `ts`.
    pub fn chunk_start(self, ts: i64) -> i64 {
        match self.chunk_span() {
            ChunkSpan::Day => ts.div_euclid(DAY) * DAY,
            ChunkSpan::Week => align_week(ts),
            ChunkSpan::Month => month_start(ts),
            ChunkSpan::Year => year_start(ts),
        }
    }

    /// Boundary start of the chunk following the one starting at `chunk_start`.
    pub fn next_chunk_start(self, chunk_start: i64) -> i64 {
        match self.chunk_span() {
            ChunkSpan::Day => chunk_start.saturating_add(DAY),
            ChunkSpan::Week => chunk_start.saturating_add(WEEK),
            ChunkSpan::Month => next_month_start(chunk_start),
            ChunkSpan::Year => next_year_start(chunk_start),
        }
    }

    /// Inclusive last second covered by the chunk starting at `chunk_start`.
    pub fn chunk_end(self, chunk_start: i64) -> i64 {
        self.next_chunk_start(chunk_start) - 1
    }

    /// Shortest chain of direct rollups from `self` to `target`, both ends
    /// included. `None` when `target` cannot be built from `self`.
    pub fn rollup_path(self, target: Granularity) -> Option<Vec<Granularity>> {
        if self == target {
            return Some(vec![self]);
        }
        let mut prev: HashMap<Granularity, Granularity> = HashMap::new();
        let mut queue = VecDeque::from([self]);
        while let Some(node) = queue.pop_front() {
            for &(from, to) in ROLLUP_EDGES {
                if from != node || to == self || prev.contains_key(&to) {
                    continue;
                }
                prev.insert(to, from);
                if to == target {
                    let mut path = vec![target];
                    let mut cur = target;
                    while let Some(&p) = prev.get(&cur) {
                        path.push(p);
                        if p == self {
                            break;
                        }
                        cur = p;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(to);
            }
        }
        None
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Granularity {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Granularity::all()
            .iter()
            .copied()
            .find(|g| g.label() == s)
            .ok_or_else(|| FeedError::MalformedResponse(format!("unknown granularity '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Calendar helpers (UTC)
// ---------------------------------------------------------------------------

fn align_week(ts: i64) -> i64 {
    (ts - FIRST_MONDAY).div_euclid(WEEK) * WEEK + FIRST_MONDAY
}

fn civil_date(ts: i64) -> Option<NaiveDate> {
    let days = ts.div_euclid(DAY) + EPOCH_DAYS_FROM_CE;
    i32::try_from(days)
        .ok()
        .and_then(NaiveDate::from_num_days_from_ce_opt)
}

fn date_to_ts(d: NaiveDate) -> i64 {
    (i64::from(d.num_days_from_ce()) - EPOCH_DAYS_FROM_CE) * DAY
}

// Dates outside chrono's range degrade to day buckets rather than panicking.
fn month_start(ts: i64) -> i64 {
    civil_date(ts)
        .and_then(|d| NaiveDate::from_ymd_opt(d.year(), d.month(), 1))
        .map(date_to_ts)
        .unwrap_or_else(|| ts.div_euclid(DAY) * DAY)
}

fn next_month_start(ts: i64) -> i64 {
    civil_date(ts)
        .and_then(|d| {
            if d.month() == 12 {
                NaiveDate::from_ymd_opt(d.year() + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(d.year(), d.month() + 1, 1)
            }
        })
        .map(date_to_ts)
        .unwrap_or(ts + DAY)
}

fn year_start(ts: i64) -> i64 {
    civil_date(ts)
        .and_then(|d| NaiveDate::from_ymd_opt(d.year(), 1, 1))
        .map(date_to_ts)
        .unwrap_or_else(|| ts.div_euclid(DAY) * DAY)
}

fn next_year_start(ts: i64) -> i64 {
    civil_date(ts)
        .and_then(|d| NaiveDate::from_ymd_opt(d.year() + 1, 1, 1))
        .map(date_to_ts)
        .unwrap_or(ts + DAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-03 (Wednesday) 13:37:00 UTC
    const WED: i64 = 1_704_289_020;
    // 2024-01-01 (Monday) 00:00:00 UTC
    const MON: i64 = 1_704_067_200;

    #[test]
    fn weekly_alignment_starts_on_monday() {
        assert_eq!(Granularity::Week1.align(WED), MON);
        assert_eq!(Granularity::Week1.align(MON), MON);
        assert_eq!(Granularity::Week1.align(MON - 1), MON - WEEK);
        // Plain modulo would land on a Thursday.
        assert_ne!(WED.div_euclid(WEEK) * WEEK, MON);
    }

    #[test]
    fn daily_alignment_is_utc_midnight() {
        assert_eq!(Granularity::Day1.align(WED), 1_704_240_000);
        assert_eq!(Granularity::Hour4.align(WED), 1_704_240_000 + 12 * HOUR);
        assert_eq!(Granularity::Min5.align(WED), WED - 2 * MINUTE);
    }

    #[test]
    fn align_up_moves_to_next_boundary() {
        assert_eq!(Granularity::Min1.align_up(61), 120);
        assert_eq!(Granularity::Min1.align_up(120), 120);
        assert_eq!(Granularity::Min1.align(-1), -60);
    }

    #[test]
    fn chunk_boundaries_follow_calendar() {
        // 2024-02-15 12:00 UTC
        let ts = 1_707_998_400;
        let feb = Granularity::Hour4.chunk_start(ts);
        assert_eq!(feb, 1_706_745_600); // 2024-02-01
        assert_eq!(Granularity::Hour4.next_chunk_start(feb), 1_709_251_200); // 2024-03-01 (leap year)
        assert_eq!(Granularity::Day1.chunk_start(ts), 1_704_067_200); // 2024-01-01
        assert_eq!(Granularity::Day1.chunk_end(1_704_067_200), 1_735_689_600 - 1);
        assert_eq!(Granularity::Hour1.chunk_start(WED), MON);
        assert_eq!(Granularity::Min1.chunk_start(WED), 1_704_240_000);
        assert_eq!(Granularity::Min1.chunk_end(0), DAY - 1);
    }

    #[test]
    fn december_rolls_into_next_year() {
        // 2023-12-10 00:00 UTC
        let dec = Granularity::Hour12.chunk_start(1_702_166_400);
        assert_eq!(dec, 1_701_388_800); // 2023-12-01
        assert_eq!(Granularity::Hour12.next_chunk_start(dec), MON);
    }

    #[test]
    fn rollup_path_uses_shortest_chain() {
        assert_eq!(
            Granularity::Min1.rollup_path(Granularity::Min15),
            Some(vec![Granularity::Min1, Granularity::Min5, Granularity::Min15])
        );
        let to_day = Granularity::Hour1.rollup_path(Granularity::Day1).unwrap();
        assert_eq!(to_day.len(), 3);
        assert_eq!(to_day.first(), Some(&Granularity::Hour1));
        assert_eq!(to_day.last(), Some(&Granularity::Day1));
        assert_eq!(
            Granularity::Min1.rollup_path(Granularity::Min1),
            Some(vec![Granularity::Min1])
        );
        assert_eq!(Granularity::Hour4.rollup_path(Granularity::Hour6), None);
        assert_eq!(Granularity::Day1.rollup_path(Granularity::Hour1), None);
    }

    #[test]
    fn labels_roundtrip_through_serde_and_fromstr() {
        for g in Granularity::all() {
            assert_eq!(g.label().parse::<Granularity>().unwrap(), *g);
            let json = serde_json::to_string(g).unwrap();
            assert_eq!(json, format!("\"{}\"", g.label()));
        }
        assert!("3m".parse::<Granularity>().is_err());
    }
}
