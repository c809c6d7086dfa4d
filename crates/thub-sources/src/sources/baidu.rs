//! Baidu realtime hot-search board. The page embeds its state as JSON inside
//! an `<!--s-data:...-->` comment.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use thub_core::{Channel, RawItem};
use tracing::{info, warn};

use crate::fetch::{FetchLimits, HttpFetcher};
use crate::{Source, SourceError};

const NAME: &str = "baidu_hot";
const BOARD_URL: &str = "https://top.baidu.com/board?tab=realtime";
const LIMITS: FetchLimits = FetchLimits::new(Duration::from_secs(10), 2 * 1024 * 1024);

#[derive(Debug, Deserialize, Default)]
struct BoardState {
    #[serde(default)]
    data: BoardData,
}

#[derive(Debug, Deserialize, Default)]
struct BoardData {
    #[serde(default)]
    cards: Vec<BoardCard>,
}

#[derive(Debug, Deserialize)]
struct BoardCard {
    #[serde(default)]
    content: Vec<BoardEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoardEntry {
    #[serde(default)]
    is_top: bool,
    #[serde(default)]
    word: String,
    #[serde(default)]
    raw_url: String,
    #[serde(default)]
    desc: String,
}

pub struct BaiduHotSource {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl BaiduHotSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            endpoint: BOARD_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Source for BaiduHotSource {
    fn name(&self) -> &str {
        NAME
    }

    fn channel(&self) -> Channel {
        Channel::Baidu
    }

    async fn fetch(&self) -> Result<Vec<RawItem>, SourceError> {
        let resp = self.http.fetch(NAME, &self.endpoint, LIMITS).await?;
        let items = parse_board(&resp.text(), Utc::now())?;
        if items.is_empty() {
            warn!(source = NAME, "no entries parsed from board state");
        } else {
            info!(source = NAME, items = items.len(), "parsed board");
        }
        Ok(items)
    }
}

fn state_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)<!--s-data:(.*?)-->").expect("static regex"))
}

/// Extracts entries from the embedded board state. A page without the state
/// comment yields nothing; a state comment that is not JSON is an error.
pub fn parse_board(html: &str, now: DateTime<Utc>) -> Result<Vec<RawItem>, SourceError> {
    let Some(raw) = state_pattern().captures(html).and_then(|c| c.get(1)) else {
        return Ok(Vec::new());
    };
    let state: BoardState = serde_json::from_str(raw.as_str())
        .map_err(|e| SourceError::parse(NAME, format!("s-data JSON: {e}")))?;

    let Some(card) = state.data.cards.into_iter().next() else {
        return Ok(Vec::new());
    };
    let total = card.content.len();
    let mut items = Vec::with_capacity(total);
    for (idx, entry) in card.content.into_iter().enumerate() {
        if entry.is_top {
            continue;
        }
        let title = entry.word.trim();
        if title.is_empty() {
            continue;
        }
        let link = match entry.raw_url.trim() {
            "" => BOARD_URL,
            url => url,
        };
        let mut item = RawItem::new(Channel::Baidu, title, link)
            .published_at(now)
            .hot_score((total - idx) as f64)
            .extra("rank", idx + 1);
        let desc = entry.desc.trim();
        if !desc.is_empty() {
            item = item.with_description(desc);
        }
        items.push(item);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(state: &str) -> String {
        format!("<html><head></head><body><div id=\"sanRoot\"></div><!--s-data:{state}--></body></html>")
    }

    #[test]
    fn skips_pinned_and_blank_entries_and_ranks_by_position() {
        let html = page(
            r#"{"data":{"cards":[{"content":[
                {"isTop":true,"word":"pinned","rawUrl":"https://www.baidu.com/s?wd=pinned"},
                {"word":" first ","rawUrl":"https://www.baidu.com/s?wd=first","desc":"first desc"},
                {"word":"","rawUrl":"https://www.baidu.com/s?wd=blank"},
                {"word":"no url","rawUrl":""}
            ]}]}}"#,
        );
        let items = parse_board(&html, Utc::now()).unwrap();
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].title, "first");
        assert_eq!(items[0].hot_score, 3.0);
        assert_eq!(items[0].description.as_deref(), Some("first desc"));
        assert_eq!(items[0].extra["rank"], 2);

        assert_eq!(items[1].title, "no url");
        assert_eq!(items[1].link, BOARD_URL);
        assert_eq!(items[1].hot_score, 1.0);
        assert!(items[1].description.is_none());
    }

    #[test]
    fn missing_state_is_empty_and_bad_state_is_an_error() {
        assert!(parse_board("<html></html>", Utc::now()).unwrap().is_empty());
        assert!(parse_board(&page(r#"{"data":{"cards":[]}}"#), Utc::now())
            .unwrap()
            .is_empty());
        assert!(matches!(
            parse_board(&page("{not json"), Utc::now()),
            Err(SourceError::Parse { .. })
        ));
    }
}
