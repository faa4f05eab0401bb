use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};

use quotebot::api::{BinanceReferenceClient, VenueClient};
use quotebot::config::BotConfig;
use quotebot::execution::Orchestrator;
use quotebot::gateway::ExchangeGateway;
use quotebot::models::MarketEvent;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const FEED_DOWN_AFTER_FAILURES: u32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    tracing::info!("🚀 QuoteBot starting");

    let cfg = BotConfig::load()?;

    let venue_url =
        std::env::var("VENUE_API_URL").expect("VENUE_API_URL not found in environment");
    let venue_key =
        std::env::var("VENUE_API_KEY").expect("VENUE_API_KEY not found in environment");

    let gateway = Arc::new(VenueClient::new(venue_url, venue_key)?);
    let reference = Arc::new(BinanceReferenceClient::new()?);

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Symbol: {}", cfg.quote.symbol);
    tracing::info!("  Quote size: {}", cfg.quote.order_qty);
    tracing::info!(
        "  Distance band: [{}, {}]bp, target {}bp, dead zone {}bp",
        cfg.quote.min_distance_bp,
        cfg.quote.max_distance_bp,
        cfg.quote.target_distance_bp,
        cfg.quote.dead_zone_bp
    );
    tracing::info!("  Close mode: {:?}", cfg.close.mode);
    tracing::info!(
        "  Spread guard: jump {}bp / max {}bp, cooldown {}ms (reference {})",
        cfg.spread_guard.jump_threshold_bp,
        cfg.spread_guard.max_spread_bp,
        cfg.spread_guard.cooldown_ms,
        cfg.reference_symbol
    );

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let feed_task = {
        let gateway = gateway.clone();
        let symbol = cfg.quote.symbol.clone();
        let interval_ms = cfg.poll_interval_ms;
        let tx = tx.clone();
        tokio::spawn(async move {
            mark_price_feed_loop(gateway, symbol, interval_ms, tx).await;
        })
    };

    let mut orchestrator = Orchestrator::new(cfg, gateway, reference, rx);
    let mut bot_task = tokio::spawn(async move { orchestrator.run().await });

    tracing::info!("Press Ctrl+C to stop...\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
            // Closing the event channel lets the orchestrator drain and
            // cancel its orders before exiting
            feed_task.abort();
            drop(tx);
            bot_task.await??;
        }
        result = &mut bot_task => {
            feed_task.abort();
            result??;
        }
    }

    tracing::info!("👋 QuoteBot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "quotebot=info".to_string()),
        )
        .init();
}

/// Polls the venue mark price and feeds it to the orchestrator. Flags the
/// gap to the orchestrator once connectivity comes back after repeated
/// failures so it can resync with the venue.
async fn mark_price_feed_loop(
    gateway: Arc<VenueClient>,
    symbol: String,
    interval_ms: u64,
    tx: mpsc::Sender<MarketEvent>,
) {
    tracing::info!("📡 Mark price feed starting for {}", symbol);

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut consecutive_failures = 0u32;
    let mut feed_down = false;

    loop {
        ticker.tick().await;

        match gateway.mark_price(&symbol).await {
            Ok(price) => {
                if feed_down {
                    tracing::info!(
                        "✓ Mark price feed recovered after {} failures",
                        consecutive_failures
                    );
                    if tx.send(MarketEvent::ConnectivityRestored).await.is_err() {
                        return;
                    }
                }
                feed_down = false;
                consecutive_failures = 0;

                let event = MarketEvent::ReferencePrice {
                    symbol: symbol.clone(),
                    price,
                    timestamp: Utc::now(),
                };
                if tx.send(event).await.is_err() {
                    tracing::info!("Event channel closed, feed stopping");
                    return;
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                tracing::warn!(
                    "Mark price poll failed ({} in a row): {}",
                    consecutive_failures,
                    e
                );
                if consecutive_failures >= FEED_DOWN_AFTER_FAILURES {
                    feed_down = true;
                }
            }
        }
    }
}
