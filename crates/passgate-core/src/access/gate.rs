//! ============================================================================
//! External Gate - Ad-view redirect service
//! ============================================================================
//! The gate turns a long deep link into a short URL that routes the user
//! through an ad before landing on the link. Any failure is retryable.
//! ============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::GateError;

#[async_trait]
pub trait ExternalGate: Send + Sync {
    async fn request_redirect(&self, long_url: &str) -> Result<String, GateError>;
}

/// Link-shortener ad gate (`/api?api=..&url=..`)
pub struct ShortenerGate {
    client: reqwest::Client,
    host: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShortenResponse {
    status: Option<String>,
    shortened_url: Option<String>,
    message: Option<String>,
}

impl ShortenerGate {
    pub fn new(host: &str, api_token: String, timeout: Duration) -> Result<Self, GateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GateError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn request_url(&self, long_url: &str) -> String {
        format!(
            "https://{}/api?api={}&url={}",
            self.host,
            self.api_token,
            urlencoding::encode(long_url)
        )
    }
}

#[async_trait]
impl ExternalGate for ShortenerGate {
    async fn request_redirect(&self, long_url: &str) -> Result<String, GateError> {
        debug!("Requesting redirect from {}", self.host);

        let response = self
            .client
            .get(self.request_url(long_url))
            .send()
            .await
            .map_err(|e| {
                // The request URL carries the API key
                let e = e.without_url();
                if e.is_timeout() {
                    GateError::GateFailed(format!("request to {} timed out", self.host))
                } else {
                    GateError::GateFailed(format!("request to {} failed: {}", self.host, e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            warn!("Shortener returned HTTP {}", status);
            return Err(GateError::GateFailed(format!("HTTP {}", status)));
        }

        let body: ShortenResponse = response
            .json()
            .await
            .map_err(|e| {
                GateError::GateFailed(format!(
                    "Failed to parse shortener response: {}",
                    e.without_url()
                ))
            })?;
        parse_shorten_response(body)
    }
}

fn parse_shorten_response(body: ShortenResponse) -> Result<String, GateError> {
    match (body.status.as_deref(), body.shortened_url) {
        (Some("success"), Some(url)) if !url.is_empty() => Ok(url),
        (status, _) => Err(GateError::GateFailed(format!(
            "shortener status {:?}: {}",
            status,
            body.message.unwrap_or_default()
        ))),
    }
}
