use crate::source::SnapshotSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qw_config::ProviderConfig;
use qw_quota::{QuotaObservation, Snapshot};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct QuotaDocument {
    #[serde(default)]
    quotas: BTreeMap<String, QuotaObservation>,
}

/// Polls an endpoint that already speaks the generic quota document:
///
/// ```json
/// { "quotas": { "five_hour": { "usage": 42.0, "reset_marker": { "token": "p-17" } } } }
/// ```
pub struct HttpSnapshotSource {
    provider: String,
    url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpSnapshotSource {
    pub fn new(
        provider: impl Into<String>,
        url: impl Into<String>,
        token: Option<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            provider: provider.into(),
            url: url.into(),
            token,
            http,
        })
    }

    pub fn from_config(config: &ProviderConfig) -> anyhow::Result<Self> {
        if config.token_env.is_some() && config.token().is_none() {
            tracing::warn!(
                provider = %config.name,
                "token_env is set but the variable is empty or missing"
            );
        }
        Self::new(config.name.clone(), config.url.clone(), config.token())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Decodes a quota document body into a snapshot stamped `captured_at`.
pub fn decode_snapshot(
    provider: &str,
    body: &str,
    captured_at: DateTime<Utc>,
) -> anyhow::Result<Snapshot> {
    let document: QuotaDocument = serde_json::from_str(body)?;
    Ok(Snapshot {
        provider: provider.to_string(),
        captured_at,
        quotas: document.quotas,
    })
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn fetch(&self) -> anyhow::Result<Snapshot> {
        let mut request = self.http.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("{} quota endpoint returned {}", self.provider, resp.status());
        }
        let body = resp.text().await?;
        decode_snapshot(&self.provider, &body, Utc::now())
    }
}
