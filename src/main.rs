use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use insidebar_engine::config::AppConfig;
use insidebar_engine::execution::{build_executor, ExecutionMode};
use insidebar_engine::runner::LiveRunner;
use insidebar_engine::sync::{EventBus, StatePersistence, StateStore};
use insidebar_engine::trading_core::TradingCalendar;
use insidebar_engine::types::Timeframe;
use insidebar_engine::ws::WsServer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inside-bar breakout engine with WebSocket state bridge")]
struct Args {
    /// JSON config file; CLI flags override its values
    #[arg(short, long, env = "INSIDEBAR_CONFIG")]
    config: Option<PathBuf>,

    /// Symbol to trade
    #[arg(short, long)]
    symbol: Option<String>,

    /// Candle timeframe (1m, 3m, 5m, 15m, 30m, 1h)
    #[arg(short, long)]
    timeframe: Option<Timeframe>,

    /// Seconds between polling cycles
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Candle feed REST endpoint
    #[arg(long, env = "CANDLE_FEED_URL")]
    feed_url: Option<String>,

    /// Replay candles from a JSON / JSON.zst file instead of polling
    #[arg(long)]
    replay_file: Option<PathBuf>,

    /// Execution mode (simulation, webhook)
    #[arg(long)]
    execution: Option<ExecutionMode>,

    /// Order webhook for webhook mode
    #[arg(long, env = "ORDER_WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// Directory for snapshots and the event log
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Host for the WebSocket bridge
    #[arg(long)]
    host: Option<String>,

    /// Port for the WebSocket bridge
    #[arg(short, long)]
    port: Option<u16>,

    /// Print verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(symbol) = &self.symbol {
            config.runner.symbol = symbol.clone();
        }
        if let Some(timeframe) = self.timeframe {
            config.runner.timeframe = timeframe;
        }
        if let Some(secs) = self.poll_interval {
            config.runner.poll_interval_secs = secs;
        }
        if let Some(url) = &self.feed_url {
            config.feed.base_url = Some(url.clone());
        }
        if let Some(path) = &self.replay_file {
            config.feed.replay_file = Some(path.clone());
        }
        if let Some(mode) = self.execution {
            config.execution.mode = mode;
        }
        if let Some(url) = &self.webhook_url {
            config.execution.webhook_url = Some(url.clone());
        }
        if let Some(dir) = &self.state_dir {
            config.persistence.state_dir = dir.clone();
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("insidebar_engine={}", level).parse()?),
        )
        .init();

    let mut config = AppConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    info!("Starting inside-bar engine");
    info!("Symbol: {} ({})", config.runner.symbol, config.runner.timeframe);
    info!("Execution: {}", config.execution.mode);
    info!("State dir: {}", config.persistence.state_dir.display());

    let bus = Arc::new(EventBus::new());
    let store = Arc::new(StateStore::with_bus(bus.clone()));

    // Restore before anything can write
    let persistence = Arc::new(StatePersistence::open(config.persistence.clone(), store.clone())?);
    let report = persistence.restore()?;
    if report.corrupt_snapshots > 0 || report.corrupt_records > 0 {
        warn!(
            snapshots = report.corrupt_snapshots,
            records = report.corrupt_records,
            "Skipped unreadable persistence data"
        );
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    // Persistence stops last so it records the runner's final updates
    let (persist_stop_tx, persist_stop_rx) = watch::channel(false);
    let persistence_handle = persistence.clone().spawn(bus.clone(), persist_stop_rx);

    let server = WsServer::new(config.server.clone(), store.clone(), bus.clone());
    let listener = server.bind().await?;
    let server_handle = tokio::spawn(server.serve(listener, stop_rx.clone()));

    let calendar = TradingCalendar::from_config(&config.session)?;
    let feed = config.feed.build()?;
    let executor = build_executor(&config.execution)?;
    let mut runner = LiveRunner::new(
        config.runner.clone(),
        config.execution.clone(),
        calendar,
        feed,
        executor,
        store.clone(),
        bus.clone(),
    );
    let runner_handle = tokio::spawn(async move { runner.run(stop_rx).await });

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("Shutdown requested, finishing current cycle");
    let _ = stop_tx.send(true);

    match runner_handle.await? {
        Ok(stats) => info!(
            "Runner stats: cycles={} skipped={} signals={} confirmed={} missed={} orders={} failed={}",
            stats.cycles,
            stats.skipped_cycles,
            stats.signals_created,
            stats.signals_confirmed,
            stats.signals_missed,
            stats.orders_placed,
            stats.orders_failed
        ),
        Err(e) => warn!("Runner exited with error: {:#}", e),
    }
    if let Err(e) = server_handle.await? {
        warn!("WebSocket bridge exited with error: {:#}", e);
    }

    let _ = persist_stop_tx.send(true);
    persistence_handle.await?;

    let bus_stats = bus.stats();
    info!(
        published = bus_stats.published,
        handler_errors = bus_stats.handler_errors,
        "Shutdown complete"
    );
    Ok(())
}
