// =============================================================================
// Candle Feed — Main Entry Point
// =============================================================================
//
// Keeps the configured symbols warm: backfills the last day of one-minute
// candles into the local cache, then follows the live trade stream and logs
// every closed candle until Ctrl+C.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use candle_feed::clock::{Clock, SystemClock};
use candle_feed::exchange::BinanceSource;
use candle_feed::granularity::DAY;
use candle_feed::store::FileStore;
use candle_feed::{DataFeed, FeedConfig, Granularity};

const DEFAULT_CONFIG_PATH: &str = "candle_feed.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Feed starting up");

    let config_path =
        std::env::var("CANDLE_FEED_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = FeedConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });

    // Override symbols and data dir from env if available.
    if let Ok(syms) = std::env::var("CANDLE_FEED_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(dir) = std::env::var("CANDLE_FEED_DATA_DIR") {
        config.data_dir = dir.into();
    }
    if config.symbols.is_empty() {
        anyhow::bail!("no symbols configured");
    }

    info!(
        symbols = ?config.symbols,
        data_dir = %config.data_dir.display(),
        "Configured symbols"
    );

    // ── 2. Build the pipeline ────────────────────────────────────────────
    let backend = Arc::new(FileStore::open(&config.data_dir).await?);
    let source = Arc::new(
        BinanceSource::new()?.with_max_candles_per_call(config.backfill.max_candles_per_call),
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let feed = DataFeed::new(source, backend, clock.clone(), &config);

    let consumer = feed.register_consumer();
    feed.set_active_instance(consumer)?;

    // ── 3. Warm the cache ────────────────────────────────────────────────
    let base = Granularity::BASE;
    let end = base.align(clock.now());
    for symbol in &config.symbols {
        match feed.get_range(symbol, base, end - DAY, end, consumer).await {
            Ok(candles) => info!(symbol = %symbol, candles = candles.len(), "Cache warmed"),
            Err(e) => error!(symbol = %symbol, error = %e, "Cache warm-up failed"),
        }
    }

    // ── 4. Follow live candles ───────────────────────────────────────────
    let mut subscriptions = Vec::with_capacity(config.symbols.len());
    for symbol in &config.symbols {
        let mut subscription = feed.subscribe_live(symbol, consumer)?;
        let handle = tokio::spawn(async move {
            while let Some(update) = subscription.recv().await {
                if update.closed {
                    let c = update.candle;
                    info!(
                        symbol = %update.symbol,
                        granularity = %update.granularity,
                        open_time = c.open_time,
                        open = c.open,
                        high = c.high,
                        low = c.low,
                        close = c.close,
                        volume = c.volume,
                        "Candle closed"
                    );
                }
            }
        });
        subscriptions.push(handle);
    }

    info!(count = config.symbols.len(), "Live feeds running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    for handle in subscriptions {
        handle.abort();
    }
    feed.remove_consumer(consumer)?;

    if let Err(e) = config.save(&config_path) {
        error!(error = %e, "Failed to save feed config on shutdown");
    }

    info!("Candle Feed shut down complete.");
    Ok(())
}
