//! Source contract, bounded HTTP fetcher and the concrete feeds TrendingHub
//! ingests.

use std::sync::Arc;

use async_trait::async_trait;
use scraper::Selector;
use thiserror::Error;
use thub_core::{Channel, RawItem};

pub mod fetch;
pub mod sources;

pub use fetch::{
    FetchError, FetchLimits, FetchedResponse, HttpClientConfig, HttpFetcher, DEFAULT_USER_AGENT,
};
pub use sources::ashare::{code_to_secid, normalize_stock_code, AshareSource};
pub use sources::baidu::BaiduHotSource;
pub use sources::github::GithubTrendingSource;
pub use sources::gold::GoldPriceSource;
pub use sources::hackernews::HackerNewsSource;

pub const CRATE_NAME: &str = "thub-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{source_name}: unexpected payload: {message}")]
    Parse {
        source_name: &'static str,
        message: String,
    },
}

impl SourceError {
    pub fn parse(source_name: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name,
            message: message.into(),
        }
    }
}

/// An external feed. `fetch` performs one bounded round of outbound calls and
/// returns whatever it could parse; an empty list is a normal outcome.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;
    fn channel(&self) -> Channel;
    async fn fetch(&self) -> Result<Vec<RawItem>, SourceError>;
}

/// Knobs for the built-in sources that come from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceSettings {
    pub ashare_stock_codes: Vec<String>,
    pub gold_api_url: Option<String>,
}

impl SourceSettings {
    pub fn from_env() -> Self {
        Self {
            ashare_stock_codes: parse_stock_code_list(
                &std::env::var("ASHARE_STOCK_CODES").unwrap_or_default(),
            ),
            gold_api_url: std::env::var("GOLD_API_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }
}

/// Comma-separated codes, trimmed, empties dropped, order kept.
pub fn parse_stock_code_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Every built-in source, sharing one fetcher.
pub fn build_default_sources(
    http: Arc<HttpFetcher>,
    settings: &SourceSettings,
) -> Vec<Arc<dyn Source>> {
    vec![
        Arc::new(GithubTrendingSource::new(http.clone())),
        Arc::new(BaiduHotSource::new(http.clone())),
        Arc::new(HackerNewsSource::new(http.clone())),
        Arc::new(GoldPriceSource::new(http.clone(), settings.gold_api_url.as_deref())),
        Arc::new(AshareSource::new(http, &settings.ashare_stock_codes)),
    ]
}

pub(crate) fn selector(source_name: &'static str, css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::parse(source_name, e.to_string()))
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
