//! Hacker News top stories through the public Firebase API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Deserialize;
use thub_core::{Channel, RawItem};
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use crate::fetch::{FetchLimits, HttpFetcher};
use crate::{Source, SourceError};

const NAME: &str = "hackernews_top";
const API_BASE: &str = "https://hacker-news.firebaseio.com/v0";
const MAX_ITEMS: usize = 30;
const ITEM_CONCURRENCY: usize = 10;
const MAX_BODY: usize = 1024 * 1024;
const LIST_LIMITS: FetchLimits = FetchLimits::new(Duration::from_secs(10), MAX_BODY);
const ITEM_LIMITS: FetchLimits = FetchLimits::new(Duration::from_secs(5), MAX_BODY);

#[derive(Debug, Clone, Deserialize)]
pub struct HnItem {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub descendants: i64,
    #[serde(default)]
    pub by: String,
    #[serde(default)]
    pub time: i64,
    #[serde(default, rename = "type")]
    pub kind: String,
}

pub struct HackerNewsSource {
    http: Arc<HttpFetcher>,
    base: String,
}

impl HackerNewsSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            base: API_BASE.to_string(),
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into().trim_end_matches('/').to_string();
        self
    }

    async fn fetch_item(&self, id: u64) -> Result<HnItem, SourceError> {
        let url = format!("{}/item/{id}.json", self.base);
        let resp = self.http.fetch(NAME, &url, ITEM_LIMITS).await?;
        resp.json()
            .map_err(|e| SourceError::parse(NAME, format!("item {id}: {e}")))
    }
}

#[async_trait]
impl Source for HackerNewsSource {
    fn name(&self) -> &str {
        NAME
    }

    fn channel(&self) -> Channel {
        Channel::HackerNews
    }

    async fn fetch(&self) -> Result<Vec<RawItem>, SourceError> {
        let url = format!("{}/topstories.json", self.base);
        let resp = self.http.fetch(NAME, &url, LIST_LIMITS).await?;
        let mut ids: Vec<u64> = resp
            .json()
            .map_err(|e| SourceError::parse(NAME, format!("top stories: {e}")))?;
        ids.truncate(MAX_ITEMS);

        let permits = Semaphore::new(ITEM_CONCURRENCY);
        let collected: Mutex<Vec<(usize, HnItem)>> = Mutex::new(Vec::with_capacity(ids.len()));
        join_all(ids.iter().enumerate().map(|(rank, &id)| {
            let permits = &permits;
            let collected = &collected;
            async move {
                // Closed only when dropped, which happens after join_all.
                let _permit = permits.acquire().await.expect("semaphore not closed");
                match self.fetch_item(id).await {
                    Ok(item) => collected.lock().await.push((rank, item)),
                    Err(err) => warn!(source = NAME, id, error = %err, "item fetch failed"),
                }
            }
        }))
        .await;

        let mut collected = collected.into_inner();
        collected.sort_by_key(|(rank, _)| *rank);
        let items: Vec<RawItem> = collected
            .into_iter()
            .filter_map(|(rank, item)| story_to_item(rank, item))
            .collect();
        info!(source = NAME, ids = ids.len(), items = items.len(), "collected stories");
        Ok(items)
    }
}

/// Only titled `story` items survive; a story without a url links to its
/// discussion page.
pub fn story_to_item(rank: usize, item: HnItem) -> Option<RawItem> {
    let title = item.title.trim();
    if title.is_empty() || item.kind != "story" {
        return None;
    }
    let link = match item.url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => format!("https://news.ycombinator.com/item?id={}", item.id),
    };
    let published_at = DateTime::<Utc>::from_timestamp(item.time, 0).unwrap_or_else(Utc::now);
    Some(
        RawItem::new(Channel::HackerNews, title, link)
            .published_at(published_at)
            .hot_score(item.score as f64)
            .extra("hn_id", item.id)
            .extra("author", item.by)
            .extra("comments", item.descendants)
            .extra("score", item.score)
            .extra("rank", rank + 1),
    )
}
