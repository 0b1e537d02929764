//! Market-making service
//!
//! Wires the full pipeline: WebSocket transport -> synchronizer ->
//! book views -> volatility estimator -> quoting engine, with a
//! logging subscriber on the event bus. Runs until Ctrl-C or a fatal
//! feed error, then drains in order: quoting stops, resting quotes are
//! cancelled, the feed is closed.

use anyhow::Result;
use clap::Parser;
use common::{EventBus, Qty, Symbol};
use feeds::{FeedConfig, FeedTransport, RestSnapshots, Synchronizer};
use maker::{
    run_estimator, ExecutionClient, FixedSize, MakerConfig, QuoteConfig, QuotingEngine,
    SimExecutionClient, VolatilityConfig, VolatilityEstimator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "maker-service", about = "Order-book-driven market-making service")]
struct Cli {
    /// Trading symbol
    #[arg(long, default_value = "BTCUSDT")]
    symbol: String,

    /// WebSocket endpoint for the depth stream
    #[arg(long, default_value = "wss://stream.binance.com:9443")]
    ws_url: String,

    /// REST endpoint for depth snapshots
    #[arg(long, default_value = "https://api.binance.com")]
    api_url: String,

    /// Price levels requested per snapshot
    #[arg(long, default_value_t = 1000)]
    snapshot_depth: u32,

    /// Base spread as a fraction of mid
    #[arg(long, default_value_t = 0.002)]
    base_spread: f64,

    /// Lower clamp on the spread fraction
    #[arg(long, default_value_t = 0.001)]
    min_spread: f64,

    /// Upper clamp on the spread fraction
    #[arg(long, default_value_t = 0.01)]
    max_spread: f64,

    /// Quote size in base units, both sides
    #[arg(long, default_value_t = 0.001)]
    quote_size: f64,

    /// Quoting timer period in milliseconds
    #[arg(long, default_value_t = 500)]
    quote_period_ms: u64,

    /// Volatility window in seconds
    #[arg(long, default_value_t = 60)]
    vol_window_secs: u64,
}

impl Cli {
    fn into_config(self) -> MakerConfig {
        let defaults = MakerConfig::default();
        MakerConfig {
            symbol: self.symbol,
            ws_url: self.ws_url,
            api_url: self.api_url,
            snapshot_depth: self.snapshot_depth,
            volatility: VolatilityConfig {
                window: Duration::from_secs(self.vol_window_secs),
                ..defaults.volatility
            },
            quoting: QuoteConfig {
                base_spread: self.base_spread,
                min_spread: self.min_spread,
                max_spread: self.max_spread,
                tick_period: Duration::from_millis(self.quote_period_ms),
                ..defaults.quoting
            },
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let quote_size = Qty::new(cli.quote_size);
    let config = cli.into_config();
    info!(symbol = %config.symbol, "starting maker service");

    let events = EventBus::default();
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => info!(?event, "maker event"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event logger lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let symbol = Symbol::new(1);
    let snapshots = Arc::new(RestSnapshots::new(
        config.api_url.clone(),
        &config.symbol,
        config.snapshot_depth,
    ));
    let (synchronizer, views, synced) =
        Synchronizer::new(symbol, snapshots, config.sync.clone(), events.clone());
    let transport = FeedTransport::new(
        FeedConfig::depth_stream(config.ws_url.clone(), &config.symbol),
        events.clone(),
        synced,
    );

    let (feed_tx, feed_rx) = mpsc::channel(1024);
    let mut transport_task = tokio::spawn(transport.run(feed_tx));
    let mut sync_task = tokio::spawn(synchronizer.run(feed_rx));

    let (vol_tx, vol_rx) = watch::channel(None);
    let estimator = VolatilityEstimator::new(config.volatility.clone());
    let vol_task = tokio::spawn(run_estimator(estimator, views.clone(), vol_tx));

    let execution: Arc<dyn ExecutionClient> = Arc::new(SimExecutionClient::new());
    let engine = QuotingEngine::new(
        config.quoting.clone(),
        execution,
        Box::new(FixedSize(quote_size)),
        events.clone(),
    );
    let (quote_stop_tx, quote_stop_rx) = watch::channel(false);
    let quote_task = tokio::spawn(engine.run(views, vol_rx, quote_stop_rx));

    // Run until an operator stop or a fatal feed error
    let fatal: Option<anyhow::Error> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            None
        }
        result = &mut transport_task => task_error("feed transport", result),
        result = &mut sync_task => task_error("synchronizer", result),
    };

    // Drain in order: stop quoting, cancel resting quotes, then close
    // the feed
    let _ = quote_stop_tx.send(true);
    if let Err(err) = quote_task.await {
        warn!(error = %err, "quoting engine did not stop cleanly");
    }
    transport_task.abort();
    sync_task.abort();
    vol_task.abort();

    match fatal {
        Some(err) => {
            error!(error = %err, "maker service stopping on fatal error");
            Err(err)
        }
        None => {
            info!("maker service stopped");
            Ok(())
        }
    }
}

fn task_error(
    name: &str,
    result: Result<Result<(), feeds::FeedError>, tokio::task::JoinError>,
) -> Option<anyhow::Error> {
    match result {
        Ok(Ok(())) => {
            info!(task = name, "task finished");
            None
        }
        Ok(Err(err)) => Some(anyhow::Error::new(err).context(format!("{name} failed"))),
        Err(err) => Some(anyhow::anyhow!("{name} panicked: {err}")),
    }
}
