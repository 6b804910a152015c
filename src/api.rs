use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::UpstreamConfig;
use crate::types::{PageParams, RawRound, UpstreamEnvelope};

/// Maximum length of the response excerpt carried by `BadFormat`.
const SNIPPET_LEN: usize = 200;

/// Why one upstream fetch failed. None of these stop the poll schedule.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream refused the credential; only a credential refresh fixes this.
    #[error("upstream rejected credential (HTTP {status})")]
    AuthRejected { status: u16 },
    /// The response was not the expected JSON shape.
    #[error("unexpected upstream payload: {snippet}")]
    BadFormat { snippet: String },
    /// The upstream answered, but with a non-success status.
    #[error("upstream returned HTTP {status}: {snippet}")]
    UnexpectedStatus { status: u16, snippet: String },
    /// Network-level failure: connect error, reset, timeout.
    #[error("upstream transport error: {0}")]
    Transport(String),
}

/// Source of raw round batches. One call, no retries.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, credential: &str, page: PageParams)
    -> Result<Vec<RawRound>, FetchError>;
}

/// HTTP client for the upstream round-history endpoint.
pub struct HttpFeed {
    client: reqwest::Client,
    url: Url,
    auth_header: String,
}

impl HttpFeed {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            auth_header: config.auth_header.clone(),
        })
    }
}

#[async_trait]
impl FeedSource for HttpFeed {
    async fn fetch(
        &self,
        credential: &str,
        page: PageParams,
    ) -> Result<Vec<RawRound>, FetchError> {
        let resp = self
            .client
            .post(self.url.clone())
            .header(self.auth_header.as_str(), credential)
            .json(&page)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let batch = classify_response(status, content_type.as_deref(), &body)?;
        debug!("Fetched {} upstream rounds", batch.len());
        Ok(batch)
    }
}

/// Turn a raw HTTP answer into a batch or a typed failure.
pub fn classify_response(
    status: StatusCode,
    content_type: Option<&str>,
    body: &str,
) -> Result<Vec<RawRound>, FetchError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FetchError::AuthRejected {
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        return Err(FetchError::UnexpectedStatus {
            status: status.as_u16(),
            snippet: snippet(body),
        });
    }
    let is_json = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    if !is_json {
        return Err(FetchError::BadFormat {
            snippet: format!(
                "content-type {}: {}",
                content_type.unwrap_or("<none>"),
                snippet(body)
            ),
        });
    }
    let envelope: UpstreamEnvelope =
        serde_json::from_str(body).map_err(|e| FetchError::BadFormat {
            snippet: format!("{e}: {}", snippet(body)),
        })?;
    Ok(envelope.data.list.into_iter().map(RawRound::from).collect())
}

/// First `SNIPPET_LEN` characters of a body, for diagnostics.
fn snippet(body: &str) -> String {
    let mut out: String = body.chars().take(SNIPPET_LEN).collect();
    if body.chars().count() > SNIPPET_LEN {
        out.push('…');
    }
    out
}
