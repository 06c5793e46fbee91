//! HTTP plumbing shared by the built-in connectors.
//!
//! [`HttpSource`] bundles a connector's resolved config, its `reqwest`
//! client and its [`RateLimiter`]. Every request goes through
//! [`HttpSource::send`], which takes a limiter token first and maps the
//! outcome onto [`ConnectorError`]:
//!
//! | Outcome | Error |
//! |---------|-------|
//! | HTTP 401 / 403 | `AuthFailed` |
//! | HTTP 429 | `RateLimited` |
//! | other non-2xx, transport error | `Unreachable` |
//! | body does not decode | `SchemaMismatch` |
//!
//! Requests are not retried; a failed source is picked up again on the next
//! refresh cycle.

use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::config::ConnectorConfig;
use crate::error::ConnectorError;
use crate::rate_limit::RateLimiter;
use crate::traits::FetchContext;

pub struct HttpSource {
    label: String,
    config: ConnectorConfig,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl HttpSource {
    pub fn new(label: impl Into<String>, config: ConnectorConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("data-discovery/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let limiter = RateLimiter::new(config.requests_per_window, config.window);
        Ok(Self {
            label: label.into(),
            config,
            client,
            limiter,
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// `{base_url}/{path}`; absolute URLs are returned as-is.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.config.base_url, path.trim_start_matches('/'))
    }

    /// The configured API key, or `AuthFailed` when none is set.
    pub fn require_api_key(&self) -> Result<&str, ConnectorError> {
        self.config
            .api_key
            .as_deref()
            .ok_or_else(|| ConnectorError::AuthFailed(format!("{}: no API key configured", self.label)))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &FetchContext,
        url: &str,
        headers: HeaderMap,
    ) -> Result<T, ConnectorError> {
        let response = self.send(ctx, self.client.get(url).headers(headers)).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ConnectorError::Unreachable(format!("{}: {}", url, e)))?;
        serde_json::from_slice(&body)
            .map_err(|e| ConnectorError::SchemaMismatch(format!("{}: {}", url, e)))
    }

    pub async fn get_text(
        &self,
        ctx: &FetchContext,
        url: &str,
        headers: HeaderMap,
    ) -> Result<String, ConnectorError> {
        let response = self.send(ctx, self.client.get(url).headers(headers)).await?;
        response
            .text()
            .await
            .map_err(|e| ConnectorError::SchemaMismatch(format!("{}: {}", url, e)))
    }

    /// GET a binary body, reading at most `max_len` bytes. The rest of a
    /// response from a server that ignores `Range` is never downloaded.
    pub async fn get_bytes(
        &self,
        ctx: &FetchContext,
        url: &str,
        headers: HeaderMap,
        max_len: usize,
    ) -> Result<Vec<u8>, ConnectorError> {
        let mut response = self.send(ctx, self.client.get(url).headers(headers)).await?;
        let mut body = Vec::new();
        while body.len() < max_len {
            let chunk = response
                .chunk()
                .await
                .map_err(|e| ConnectorError::Unreachable(format!("{}: {}", url, e)))?;
            match chunk {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => break,
            }
        }
        body.truncate(max_len);
        Ok(body)
    }

    /// Take a limiter token, send, and map non-success statuses.
    pub async fn send(
        &self,
        ctx: &FetchContext,
        request: RequestBuilder,
    ) -> Result<Response, ConnectorError> {
        self.limiter.acquire(ctx.rate_limit_wait).await?;

        let response = request.send().await.map_err(|e| {
            tracing::debug!(source = %self.label, error = %e, "request failed");
            ConnectorError::Unreachable(e.to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(source = %self.label, %url, %status, "upstream error");
        Err(status_error(status, &url, &body))
    }
}

/// Map a non-success HTTP status onto a connector error.
pub fn status_error(status: StatusCode, url: &str, body: &str) -> ConnectorError {
    let detail = if body.trim().is_empty() {
        format!("{} returned {}", url, status)
    } else {
        format!("{} returned {}: {}", url, status, truncate(body.trim(), 200))
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConnectorError::AuthFailed(detail),
        StatusCode::TOO_MANY_REQUESTS => ConnectorError::RateLimited(detail),
        _ => ConnectorError::Unreachable(detail),
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
