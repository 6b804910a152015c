//! credential-updater: refreshes the relay's upstream credential on a schedule.
//!
//! Reads `[updater]` and `server.internal_token` from the relay config, so a
//! single `relay.toml` can drive both processes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use round_relay::config::{AppConfig, CONFIG_PATH};
use round_relay::updater::{self, CredentialSource, UpdaterClient};

#[derive(Parser)]
#[command(name = "credential-updater", about = "Push fresh upstream credentials to the relay")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, env = "RELAY_CONFIG", default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
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
    let config = AppConfig::load_or_default(&args.config)?;
    let settings = &config.updater;
    if settings.interval_secs == 0 {
        anyhow::bail!("updater.interval_secs must be positive");
    }

    let source = CredentialSource::from_config(settings)?;
    let client = UpdaterClient::new(
        &settings.relay_url,
        config.server.internal_token.clone(),
        Duration::from_secs(settings.timeout_secs),
    )?;

    if args.once {
        return updater::run_cycle(&source, &client).await;
    }

    info!(
        "Starting credential updater: relay={} interval={}s",
        client.endpoint(),
        settings.interval_secs
    );
    updater::run(
        source,
        client,
        Duration::from_secs(settings.interval_secs),
        async {
            tokio::signal::ctrl_c().await.ok();
        },
    )
    .await;
    Ok(())
}
