//! Watch the engine's WebSocket bridge
//!
//! Connects with the reconnecting client, logs every snapshot and event it
//! receives, and prints the mirrored state on exit.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use insidebar_engine::config::AppConfig;
use insidebar_engine::ws::WsClient;

#[derive(Parser, Debug)]
#[command(author, version, about = "Follow state and events from an inside-bar engine")]
struct Args {
    /// JSON config file; only the `client` section is used
    #[arg(short, long, env = "INSIDEBAR_CONFIG")]
    config: Option<PathBuf>,

    /// Bridge URL
    #[arg(short, long, env = "INSIDEBAR_WS_URL")]
    url: Option<String>,

    /// Topic patterns to follow (repeatable)
    #[arg(short, long)]
    topic: Vec<String>,

    /// Print full event payloads
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("insidebar_engine=info".parse()?)
                .add_directive("ws_watch=info".parse()?),
        )
        .init();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(url) = args.url {
        config.client.url = url;
    }
    if !args.topic.is_empty() {
        config.client.topics = args.topic;
    }
    config.validate()?;

    info!("Watching {} topics={:?}", config.client.url, config.client.topics);

    let client = Arc::new(WsClient::new(config.client.clone()));
    client.on_snapshot(|snapshot| {
        info!(entries = snapshot.entries.len(), taken_at = %snapshot.taken_at, "Snapshot");
    });

    let verbose = args.verbose;
    client.subscribe("*", move |event| {
        if verbose {
            info!("{} {} {}", event.timestamp.format("%H:%M:%S%.3f"), event.topic, event.payload);
        } else {
            info!("{} {}", event.timestamp.format("%H:%M:%S%.3f"), event.topic);
        }
        Ok(())
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = client.clone().spawn(stop_rx);

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    let _ = stop_tx.send(true);
    handle.await?;

    let mut entries = client.mirror().snapshot().entries;
    entries.sort_by(|a, b| a.path.as_str().cmp(b.path.as_str()));
    println!("\n=== Mirrored state ({} entries) ===", entries.len());
    for entry in &entries {
        println!("{:<28} v{:<5} {}", entry.path, entry.version, serde_json::to_string(&entry.value)?);
    }

    let counters = client.counters();
    println!(
        "\nconnections={} snapshots={} events={} dropped_unsynced={} errors={}",
        counters.connections, counters.snapshots, counters.events, counters.dropped_unsynced, counters.errors
    );
    Ok(())
}
