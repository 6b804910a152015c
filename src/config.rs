use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::types::PageParams;

/// Default config file path.
pub const CONFIG_PATH: &str = "relay.toml";

/// Top-level application config deserialized from `relay.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub updater: UpdaterConfig,
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Shared secret required in `x-internal-token` on internal endpoints when set.
    pub internal_token: Option<String>,
    /// Expose `POST /reset`.
    pub enable_reset: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8787)),
            internal_token: None,
            enable_reset: true,
        }
    }
}

/// Upstream feed endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub url: Url,
    pub page: u32,
    pub page_size: u32,
    pub timeout_secs: u64,
    /// Request header that carries the credential.
    pub auth_header: String,
    /// Credential used until one is pushed through the update endpoint.
    pub fallback_credential: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: Url::parse("https://feed.invalid/api/rounds/history")
                .expect("static URL is valid"),
            page: crate::UPSTREAM_PAGE,
            page_size: crate::UPSTREAM_PAGE_SIZE,
            timeout_secs: 10,
            auth_header: "cookie".to_string(),
            fallback_credential: crate::FALLBACK_CREDENTIAL.to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn page_params(&self) -> PageParams {
        PageParams {
            page: self.page,
            page_size: self.page_size,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Relay actor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub poll_interval_secs: u64,
    pub history_limit: usize,
    pub db_path: PathBuf,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: crate::POLL_INTERVAL.as_secs(),
            history_limit: crate::HISTORY_LIMIT,
            db_path: PathBuf::from("relay.db"),
        }
    }
}

impl RelaySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Credential updater settings. Exactly one of `command` or `file` names the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Base URL of the relay, e.g. `http://127.0.0.1:8787`.
    pub relay_url: Url,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Program plus arguments; its trimmed stdout is the credential.
    pub command: Option<Vec<String>>,
    /// File whose trimmed contents are the credential.
    pub file: Option<PathBuf>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            relay_url: Url::parse("http://127.0.0.1:8787").expect("static URL is valid"),
            interval_secs: 3600,
            timeout_secs: 15,
            command: None,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config if the file exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("{} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.relay.poll_interval_secs == 0 {
            bail!("relay.poll_interval_secs must be positive");
        }
        if self.relay.history_limit == 0 {
            bail!("relay.history_limit must be positive");
        }
        if self.upstream.page_size == 0 {
            bail!("upstream.page_size must be positive");
        }
        if self.upstream.auth_header.trim().is_empty() {
            bail!("upstream.auth_header cannot be empty");
        }
        if self.upstream.fallback_credential.trim().is_empty() {
            bail!("upstream.fallback_credential cannot be empty");
        }
        if self.updater.command.is_some() && self.updater.file.is_some() {
            bail!("updater.command and updater.file are mutually exclusive");
        }
        if let Some(cmd) = &self.updater.command {
            if cmd.is_empty() {
                bail!("updater.command needs at least a program name");
            }
        }
        Ok(())
    }
}
