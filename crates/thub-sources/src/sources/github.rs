//! GitHub trending repositories, scraped from the public trending page.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html};
use thub_core::{Channel, RawItem};
use tracing::info;

use crate::fetch::{FetchLimits, HttpFetcher};
use crate::{selector, text_or_none, Source, SourceError};

const NAME: &str = "github_trending";
const TRENDING_URL: &str = "https://github.com/trending";
const LIMITS: FetchLimits = FetchLimits::new(Duration::from_secs(10), 2 * 1024 * 1024);

pub struct GithubTrendingSource {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl GithubTrendingSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            endpoint: TRENDING_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl Source for GithubTrendingSource {
    fn name(&self) -> &str {
        NAME
    }

    fn channel(&self) -> Channel {
        Channel::Github
    }

    async fn fetch(&self) -> Result<Vec<RawItem>, SourceError> {
        let resp = self.http.fetch(NAME, &self.endpoint, LIMITS).await?;
        let items = parse_trending(&resp.text(), Utc::now())?;
        info!(source = NAME, items = items.len(), "parsed trending page");
        Ok(items)
    }
}

/// Parses "1,234" or "12.3k" star counts; anything else is zero.
pub fn parse_stars(text: &str) -> u64 {
    let text = text.replace(',', "");
    let text = text.trim();
    let (digits, multiplier) = match text.strip_suffix(['k', 'K']) {
        Some(rest) => (rest.trim(), 1000.0),
        None => (text, 1.0),
    };
    digits
        .parse::<f64>()
        .map(|v| (v * multiplier).max(0.0) as u64)
        .unwrap_or(0)
}

fn first_text(row: &ElementRef<'_>, css: &scraper::Selector) -> Option<String> {
    row.select(css)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>()))
}

pub fn parse_trending(html: &str, now: DateTime<Utc>) -> Result<Vec<RawItem>, SourceError> {
    let document = Html::parse_document(html);
    let row_sel = selector(NAME, "article.Box-row")?;
    let title_sel = selector(NAME, "h2 a")?;
    let stars_sel = selector(NAME, r#"a[href$="/stargazers"]"#)?;
    let desc_sel = selector(NAME, "p")?;
    let lang_sel = selector(NAME, r#"span[itemprop="programmingLanguage"]"#)?;

    let mut items = Vec::new();
    for (idx, row) in document.select(&row_sel).enumerate() {
        let Some(anchor) = row.select(&title_sel).next() else {
            continue;
        };
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() {
            continue;
        }
        let Some(repo) = text_or_none(&anchor.text().collect::<String>()) else {
            continue;
        };
        let repo = repo.replace(" / ", "/");

        let stars_text = first_text(&row, &stars_sel).unwrap_or_default();
        let stars = parse_stars(&stars_text);

        let mut item = RawItem::new(Channel::Github, repo, format!("https://github.com{href}"))
            .published_at(now)
            .hot_score(stars as f64)
            .extra("stars", stars)
            .extra("rank", idx + 1);
        if let Some(desc) = first_text(&row, &desc_sel) {
            item = item.with_description(desc);
        }
        if let Some(lang) = first_text(&row, &lang_sel) {
            item = item.extra("language", lang);
        }
        items.push(item);
    }
    Ok(items)
}
