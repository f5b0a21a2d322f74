// =============================================================================
// Runtime Configuration — tunables for the cache, backfill and live feed
// =============================================================================
//
// Every limit that encodes a specific exchange's behaviour (candles per call,
// how many empty pages mean "no more history", breaker windows) lives here
// rather than in the code that uses it.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::granularity::Granularity;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_capacity() -> BTreeMap<Granularity, usize> {
    use Granularity::*;
    BTreeMap::from([
        (Min1, 200_000),
        (Min5, 100_000),
        (Min15, 50_000),
        (Min30, 50_000),
        (Hour1, 20_000),
        (Hour4, 20_000),
        (Hour6, 20_000),
        (Hour12, 20_000),
        (Day1, 10_000),
        (Week1, 10_000),
    ])
}

/// Visible-span bands in hours. Neighbours overlap on purpose.
fn default_bands() -> BTreeMap<Granularity, [f64; 2]> {
    use Granularity::*;
    BTreeMap::from([
        (Min1, [0.0, 6.0]),
        (Min5, [4.0, 36.0]),
        (Min15, [24.0, 120.0]),
        (Min30, [96.0, 240.0]),
        (Hour1, [192.0, 720.0]),
        (Hour4, [600.0, 2_880.0]),
        (Hour6, [2_160.0, 4_320.0]),
        (Hour12, [3_600.0, 8_760.0]),
        (Day1, [7_200.0, 43_800.0]),
        (Week1, [35_040.0, 1.0e9]),
    ])
}

// =============================================================================
// BackfillConfig
// =============================================================================

/// Limits applied by the gap filler when talking to the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Most candles the exchange returns for one request.
    pub max_candles_per_call: usize,
    /// Gaps fetched in parallel.
    pub concurrency: usize,
    /// Consecutive empty/failed pages after which history is assumed to end.
    pub max_consecutive_empty: u32,
    /// Daily-or-coarser gaps closer than this many periods are fetched as one.
    pub merge_gap_slack_periods: i64,
    /// Attempts per page before the page counts as failed.
    pub fetch_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_candles_per_call: 300,
            concurrency: 3,
            max_consecutive_empty: 3,
            merge_gap_slack_periods: 3,
            fetch_attempts: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 4_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl BackfillConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// =============================================================================
// BreakerConfig / ReconnectConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Time spent Open before a trial is allowed.
    pub open_timeout_ms: u64,
    /// Time a HalfOpen trial may stay undecided before re-opening.
    pub half_open_timeout_ms: u64,
    /// Deadline for a single call made through the breaker.
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_timeout_ms: 30_000,
            half_open_timeout_ms: 10_000,
            call_timeout_ms: 5_000,
        }
    }
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn half_open_timeout(&self) -> Duration {
        Duration::from_millis(self.half_open_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
        }
    }
}

// =============================================================================
// TickConfig / OrchestratorConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Delay after a minute closes before asking the exchange for the
    /// authoritative candle.
    pub reconcile_delay_ms: u64,
    /// How far back the reconciliation fetch reaches.
    pub reconcile_lookback_secs: i64,
    /// Bound on the reconciliation fetch.
    pub reconcile_timeout_ms: u64,
    /// Capacity of the live update broadcast channel.
    pub channel_capacity: usize,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            reconcile_delay_ms: 5_000,
            reconcile_lookback_secs: 120,
            reconcile_timeout_ms: 10_000,
            channel_capacity: 1_024,
        }
    }
}

impl TickConfig {
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Fraction of the requested span that must be missing before a range
    /// read triggers a backfill.
    pub gap_materiality: f64,
    /// Settle time before a granularity change is committed.
    pub debounce_ms: u64,
    /// `[min_hours, max_hours]` of visible span per granularity.
    pub bands: BTreeMap<Granularity, [f64; 2]>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gap_materiality: 0.10,
            debounce_ms: 300,
            bands: default_bands(),
        }
    }
}

// =============================================================================
// FeedConfig
// =============================================================================

/// Top-level configuration for the candle feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Symbols the daemon keeps warm.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Directory used by the file-backed store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Maximum cached candles per (symbol, granularity).
    #[serde(default = "default_capacity")]
    pub capacity: BTreeMap<Granularity, usize>,

    #[serde(default)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub ticks: TickConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            data_dir: default_data_dir(),
            capacity: default_capacity(),
            backfill: BackfillConfig::default(),
            breaker: BreakerConfig::default(),
            reconnect: ReconnectConfig::default(),
            ticks: TickConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Capacity for `granularity`, falling back to the built-in default when
    /// the config file omits it.
    pub fn capacity_for(&self, granularity: Granularity) -> usize {
        self.capacity
            .get(&granularity)
            .copied()
            .or_else(|| default_capacity().get(&granularity).copied())
            .unwrap_or(10_000)
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            data_dir = %config.data_dir.display(),
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise feed config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = FeedConfig::default();
        assert_eq!(cfg.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(cfg.backfill.max_candles_per_call, 300);
        assert_eq!(cfg.backfill.max_consecutive_empty, 3);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.open_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.breaker.half_open_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.breaker.call_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.capacity_for(Granularity::Min1), 200_000);
        assert!((cfg.orchestrator.gap_materiality - 0.10).abs() < f64::EPSILON);
    }

    #[test]
    fn default_bands_overlap_their_neighbours() {
        let bands = default_bands();
        let all = Granularity::all();
        for pair in all.windows(2) {
            let finer = bands[&pair[0]];
            let coarser = bands[&pair[1]];
            assert!(
                coarser[0] < finer[1],
                "{} and {} bands do not overlap",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: FeedConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols.len(), 2);
        assert_eq!(cfg.backfill.concurrency, 3);
        assert_eq!(cfg.ticks.reconcile_lookback_secs, 120);
        assert_eq!(cfg.ticks.reconcile_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.orchestrator.debounce_ms, 300);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "symbols": ["SOLUSDT"],
            "capacity": { "1m": 500 },
            "backfill": { "max_candles_per_call": 1000 }
        }"#;
        let cfg: FeedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["SOLUSDT"]);
        assert_eq!(cfg.capacity_for(Granularity::Min1), 500);
        // Missing entries fall back to the built-in table.
        assert_eq!(cfg.capacity_for(Granularity::Day1), 10_000);
        assert_eq!(cfg.backfill.max_candles_per_call, 1000);
        assert_eq!(cfg.backfill.fetch_attempts, 3);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("candle_feed.json");
        let mut cfg = FeedConfig::default();
        cfg.symbols = vec!["XRPUSDT".into()];
        cfg.save(&path).unwrap();
        let loaded = FeedConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, cfg.symbols);
        assert_eq!(loaded.orchestrator.bands.len(), Granularity::all().len());
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(FeedConfig::load("/definitely/not/here.json").is_err());
    }
}
