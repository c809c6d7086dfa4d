//! Bounded HTTP fetching shared by every source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

pub const DEFAULT_USER_AGENT: &str = "TrendingHubBot/1.0";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            global_concurrency: 32,
            per_source_concurrency: 10,
        }
    }
}

/// Per-request bounds: wall-clock timeout and body byte ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub timeout: Duration,
    pub max_bytes: usize,
}

impl FetchLimits {
    pub const fn new(timeout: Duration, max_bytes: usize) -> Self {
        Self { timeout, max_bytes }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    /// The body hit the byte ceiling and was cut short.
    pub truncated: bool,
}

impl FetchedResponse {
    /// Body decoded as UTF-8, invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request { source, .. } if source.is_timeout())
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GETs `url` once. Non-success statuses are errors; bodies beyond
    /// `limits.max_bytes` are cut at the ceiling and flagged.
    pub async fn fetch(
        &self,
        source: &str,
        url: &str,
        limits: FetchLimits,
    ) -> Result<FetchedResponse, FetchError> {
        // Semaphores live as long as the fetcher and are never closed.
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", source, url);
        self.fetch_inner(source, url, limits).instrument(span).await
    }

    async fn fetch_inner(
        &self,
        source: &str,
        url: &str,
        limits: FetchLimits,
    ) -> Result<FetchedResponse, FetchError> {
        let request_err = |source: reqwest::Error| FetchError::Request {
            url: url.to_string(),
            source,
        };

        let mut resp = self
            .client
            .get(url)
            .timeout(limits.timeout)
            .send()
            .await
            .map_err(request_err)?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = resp.chunk().await.map_err(request_err)? {
            let room = limits.max_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        if truncated {
            warn!(source, max_bytes = limits.max_bytes, "response body truncated at ceiling");
        }
        debug!(source, bytes = body.len(), "fetched");

        Ok(FetchedResponse {
            status,
            final_url,
            body,
            truncated,
        })
    }
}
