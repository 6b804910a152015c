//! relay: polls the upstream round feed and relays new rounds to subscribers.
//!
//! Serves `GET /history`, a WebSocket stream on `/ws`, and the internal
//! credential-update endpoint. State lives in a SQLite file and survives
//! restarts.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use round_relay::api::HttpFeed;
use round_relay::config::{AppConfig, CONFIG_PATH};
use round_relay::relay::{RelayActor, RelayOptions};
use round_relay::server::{self, ServerState};
use round_relay::store::SqliteStore;

#[derive(Parser)]
#[command(name = "relay", about = "Round feed relay")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, env = "RELAY_CONFIG", default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Override the listen address from the config
    #[arg(long, env = "RELAY_BIND")]
    bind: Option<std::net::SocketAddr>,

    /// Override the SQLite database path from the config
    #[arg(long, env = "RELAY_DB")]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = AppConfig::load_or_default(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(db) = args.db {
        config.relay.db_path = db;
    }
    config.validate()?;

    info!(
        "Starting relay: upstream={} poll={}s history={} db={}",
        config.upstream.url,
        config.relay.poll_interval_secs,
        config.relay.history_limit,
        config.relay.db_path.display(),
    );
    if config.server.internal_token.is_none() {
        info!("No internal token configured; internal endpoints are unauthenticated");
    }

    let store = SqliteStore::open(&config.relay.db_path)?;
    let feed = HttpFeed::new(&config.upstream).context("failed to build upstream client")?;
    let actor = RelayActor::restore(RelayOptions::from(&config), Arc::new(feed), Box::new(store))?;
    let (relay, actor_task) = actor.spawn();

    let app = server::router(ServerState {
        relay: relay.clone(),
        internal_token: config.server.internal_token.clone(),
        enable_reset: config.server.enable_reset,
    });
    let listener = TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    server::serve(listener, app, async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
    })
    .await?;

    relay.shutdown().await;
    actor_task.await.context("relay actor panicked")?;
    info!("Shutdown complete");
    Ok(())
}
