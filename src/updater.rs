//! Credential updater: acquires a fresh upstream credential on its own
//! schedule and pushes it to the relay's internal endpoint.
//!
//! Acquisition itself is delegated to an external program or a file that
//! some other process keeps fresh. A failed cycle is logged and abandoned
//! until the next tick; the relay keeps using its last credential.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use tokio::process::Command;
use tracing::{info, warn};
use url::Url;

use crate::config::UpdaterConfig;
use crate::types::AuthUpdateRequest;
use crate::{INTERNAL_TOKEN_HEADER, mask_credential};

/// Path of the relay's credential-update endpoint.
pub const UPDATE_AUTH_PATH: &str = "internal/update-auth";

/// Where a fresh credential comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Run a program; its trimmed stdout is the credential.
    Command { program: String, args: Vec<String> },
    /// Read a file; its trimmed contents are the credential.
    File(PathBuf),
}

impl CredentialSource {
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        match (&config.command, &config.file) {
            (Some(cmd), None) => {
                let (program, args) = cmd
                    .split_first()
                    .context("updater.command needs at least a program name")?;
                Ok(Self::Command {
                    program: program.clone(),
                    args: args.to_vec(),
                })
            }
            (None, Some(path)) => Ok(Self::File(path.clone())),
            (Some(_), Some(_)) => bail!("updater.command and updater.file are mutually exclusive"),
            (None, None) => bail!("updater needs either updater.command or updater.file"),
        }
    }

    /// Produce a credential, failing on empty output.
    pub async fn acquire(&self) -> Result<String> {
        let raw = match self {
            Self::Command { program, args } => {
                let output = Command::new(program)
                    .args(args)
                    .kill_on_drop(true)
                    .output()
                    .await
                    .with_context(|| format!("failed to run {program}"))?;
                if !output.status.success() {
                    bail!(
                        "{program} exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                String::from_utf8(output.stdout)
                    .with_context(|| format!("{program} printed non-UTF-8 output"))?
            }
            Self::File(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?,
        };
        let token = raw.trim().to_string();
        if token.is_empty() {
            bail!("credential source produced an empty credential");
        }
        Ok(token)
    }
}

/// HTTP client for the relay's internal update endpoint.
pub struct UpdaterClient {
    http: reqwest::Client,
    endpoint: Url,
    internal_token: Option<String>,
}

impl UpdaterClient {
    pub fn new(relay_url: &Url, internal_token: Option<String>, timeout: Duration) -> Result<Self> {
        let endpoint = relay_url
            .join(UPDATE_AUTH_PATH)
            .with_context(|| format!("invalid relay url {relay_url}"))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint,
            internal_token,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Push one credential. No retries.
    pub async fn push(&self, token: &str) -> Result<()> {
        let mut req = self.http.post(self.endpoint.clone()).json(&AuthUpdateRequest {
            cookie: token.to_string(),
        });
        if let Some(secret) = &self.internal_token {
            req = req.header(INTERNAL_TOKEN_HEADER, secret);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.endpoint))?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            bail!("relay answered {status}: {}", body.trim());
        }
        Ok(())
    }
}

/// One acquire-and-push cycle.
pub async fn run_cycle(source: &CredentialSource, client: &UpdaterClient) -> Result<()> {
    let token = source.acquire().await.context("credential acquisition failed")?;
    client.push(&token).await?;
    info!("Pushed credential {} to {}", mask_credential(&token), client.endpoint());
    Ok(())
}

/// Run a cycle every `interval` until `shutdown` resolves. The first cycle runs immediately.
pub async fn run(
    source: CredentialSource,
    client: UpdaterClient,
    interval: Duration,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = run_cycle(&source, &client).await {
                    warn!("Credential update cycle failed: {e:#}");
                }
            }
        }
    }
}
