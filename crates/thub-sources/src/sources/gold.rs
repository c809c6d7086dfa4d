//! Spot gold quote in CNY.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use thub_core::{Channel, RawItem};
use tracing::{info, warn};

use crate::fetch::{FetchLimits, HttpFetcher};
use crate::{Source, SourceError};

const NAME: &str = "gold_price";
pub const DEFAULT_GOLD_API_URL: &str = "https://data-asg.goldprice.org/dbXRates/CNY";
const ALLOWED_HOSTS: [&str; 2] = ["data-asg.goldprice.org", "data-goldprice.org"];
const LIMITS: FetchLimits = FetchLimits::new(Duration::from_secs(5), 64 * 1024);

#[derive(Debug, Deserialize)]
struct GoldQuote {
    #[serde(default)]
    tsj: i64,
    #[serde(default)]
    items: Vec<GoldQuoteItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoldQuoteItem {
    #[serde(default)]
    curr: String,
    xau_price: f64,
}

pub struct GoldPriceSource {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl GoldPriceSource {
    /// An override is honored only for https URLs on the quote provider's hosts.
    pub fn new(http: Arc<HttpFetcher>, override_url: Option<&str>) -> Self {
        let endpoint = match override_url {
            Some(url) if is_allowed_gold_url(url) => url.to_string(),
            Some(_) => {
                warn!(source = NAME, "GOLD_API_URL host not allowed; using default");
                DEFAULT_GOLD_API_URL.to_string()
            }
            None => DEFAULT_GOLD_API_URL.to_string(),
        };
        Self { http, endpoint }
    }

    /// Bypasses the host check; for pointing at local test servers.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

pub fn is_allowed_gold_url(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw.trim()) else {
        return false;
    };
    if url.scheme() != "https" {
        return false;
    }
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    ALLOWED_HOSTS.contains(&host)
}

#[async_trait]
impl Source for GoldPriceSource {
    fn name(&self) -> &str {
        NAME
    }

    fn channel(&self) -> Channel {
        Channel::Gold
    }

    async fn fetch(&self) -> Result<Vec<RawItem>, SourceError> {
        let resp = self.http.fetch(NAME, &self.endpoint, LIMITS).await?;
        let items = parse_quote(&resp.body, &self.endpoint, Utc::now())?;
        info!(source = NAME, items = items.len(), "parsed quote");
        Ok(items)
    }
}

/// First XAU quote of the payload, stamped with the upstream millisecond
/// timestamp when present.
pub fn parse_quote(body: &[u8], link: &str, now: DateTime<Utc>) -> Result<Vec<RawItem>, SourceError> {
    let quote: GoldQuote = serde_json::from_slice(body)
        .map_err(|e| SourceError::parse(NAME, format!("quote JSON: {e}")))?;
    let Some(first) = quote.items.first() else {
        return Ok(Vec::new());
    };
    let published_at = match quote.tsj {
        0 => now,
        ms => DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(now),
    };
    let currency = if first.curr.is_empty() { "CNY" } else { first.curr.as_str() };
    let item = RawItem::new(Channel::Gold, format!("Spot gold (XAU/{currency})"), link)
        .with_description(format!(
            "Spot gold XAU/{currency} at {:.2} per troy ounce",
            first.xau_price
        ))
        .published_at(published_at)
        .hot_score(first.xau_price)
        .extra("price", first.xau_price)
        .extra("currency", currency)
        .extra("ts", quote.tsj);
    Ok(vec![item])
}
