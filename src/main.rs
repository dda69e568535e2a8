use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use rand::Rng;
use tokio::time::{interval, Duration};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use tidebot::trader::{Broker, Candle, Config, LogNotifier, MomentumOracle, PaperBroker, Trader};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Log to stdout; TIDEBOT_LOG_DIR adds a daily rolling file.
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _guard = match std::env::var("TIDEBOT_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "tidebot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_max_level(Level::DEBUG)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(env_filter()).init();
            None
        }
    };

    let cfg = Config::from_env();
    info!(
        "🌊 tidebot starting | product={} granularity={}s order_type={} dry_run={}",
        cfg.product_id, cfg.granularity_secs, cfg.order_type, cfg.dry_run,
    );

    // Live venue adapters plug in from outside the core; this binary
    // drives the paper venue and refuses to pretend otherwise.
    if !cfg.dry_run {
        bail!("no live venue adapter wired into this binary; set TIDEBOT_DRY_RUN=1");
    }

    let start_price: f64 = std::env::var("TIDEBOT_PAPER_PRICE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(100.0);
    let broker = Arc::new(PaperBroker::new(start_price, 1.0, cfg.usd_equity, cfg.fee_rate_pct));
    broker.seed_candles(cfg.max_history_candles, cfg.granularity_secs);

    let trader = Trader::new(cfg.clone(), broker.clone(), Arc::new(MomentumOracle), Arc::new(LogNotifier))?;
    trader.rehydrate().await?;

    // Candle history lives with the feed, not the core; the paper feed is
    // a gaussian-ish random walk over the configured cadence.
    let mut candles: Vec<Candle> = broker
        .get_recent_candles(&cfg.product_id, cfg.granularity_secs, cfg.max_history_candles)
        .await?;
    let mut price = start_price;
    let mut ticker = interval(Duration::from_secs(cfg.granularity_secs.max(1)));
    let mut rng = rand::thread_rng();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 shutdown requested");
                trader.shutdown().await;
                return Ok(());
            }
        }

        let open = price;
        let drift: f64 = rng.gen_range(-0.004..0.004);
        price = (price * (1.0 + drift)).max(0.01);
        broker.set_price(price);
        candles.push(Candle {
            time: Utc::now(),
            open,
            high: open.max(price),
            low: open.min(price),
            close: price,
            volume: rng.gen_range(0.1..10.0),
        });
        if candles.len() > cfg.max_history_candles {
            let excess = candles.len() - cfg.max_history_candles;
            candles.drain(..excess);
        }

        match trader.step(&candles).await {
            Ok(status) => info!("tick @ {:.2} → {}", price, status),
            Err(e) => warn!("tick failed: {e:#}"),
        }
    }
}
