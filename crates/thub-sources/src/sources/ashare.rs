//! A-share main indices plus an optional watch list, from the Eastmoney
//! batch quote endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thub_core::{Channel, RawItem};
use tracing::{info, warn};

use crate::fetch::{FetchLimits, HttpFetcher};
use crate::{Source, SourceError};

const NAME: &str = "ashare_index";
const QUOTE_BASE: &str = "https://push2.eastmoney.com/api/qt/ulist.np/get";
const QUOTE_FIELDS: &str = "f2,f3,f4,f12,f13,f14";
/// Shanghai Composite, Shenzhen Component, ChiNext.
const INDEX_SECIDS: [&str; 3] = ["1.000001", "0.399001", "0.399006"];
const LIMITS: FetchLimits = FetchLimits::new(Duration::from_secs(10), 1024 * 1024);

/// Normalizes to six digits, left-padding short codes with zeros. Anything
/// non-numeric or longer than six digits is rejected as empty.
pub fn normalize_stock_code(code: &str) -> String {
    let code = code.trim();
    if code.is_empty() || code.len() > 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return String::new();
    }
    format!("{code:0>6}")
}

/// Eastmoney security id: Shanghai listings (`6…`, `9…`) are market 1,
/// everything else market 0.
pub fn code_to_secid(code: &str) -> String {
    match code.chars().next() {
        None => String::new(),
        Some('6') | Some('9') => format!("1.{code}"),
        Some(_) => format!("0.{code}"),
    }
}

pub struct AshareSource {
    http: Arc<HttpFetcher>,
    endpoint: String,
    secids: Vec<String>,
}

impl AshareSource {
    pub fn new(http: Arc<HttpFetcher>, watch_codes: &[String]) -> Self {
        let mut secids: Vec<String> = INDEX_SECIDS.iter().map(|s| s.to_string()).collect();
        for code in watch_codes {
            let normalized = normalize_stock_code(code);
            if normalized.is_empty() {
                warn!(source = NAME, code = %code, "ignoring malformed stock code");
                continue;
            }
            let secid = code_to_secid(&normalized);
            if !secids.contains(&secid) {
                secids.push(secid);
            }
        }
        Self {
            http,
            endpoint: QUOTE_BASE.to_string(),
            secids,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn secids(&self) -> &[String] {
        &self.secids
    }

    pub fn quote_url(&self) -> String {
        format!(
            "{}?fltt=2&invt=2&fields={QUOTE_FIELDS}&secids={}",
            self.endpoint,
            self.secids.join(",")
        )
    }
}

#[async_trait]
impl Source for AshareSource {
    fn name(&self) -> &str {
        NAME
    }

    fn channel(&self) -> Channel {
        Channel::Ashare
    }

    async fn fetch(&self) -> Result<Vec<RawItem>, SourceError> {
        let resp = self.http.fetch(NAME, &self.quote_url(), LIMITS).await?;
        let items = parse_quotes(&resp.body, Utc::now())?;
        if items.is_empty() {
            let text = resp.text();
            let preview: String = text.chars().take(300).collect();
            warn!(source = NAME, preview = %preview, "no quotes parsed");
        } else {
            info!(source = NAME, items = items.len(), "parsed quotes");
        }
        Ok(items)
    }
}

fn number(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn code_field(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses `data.diff[]` quotes. Suspended instruments report `"-"` as
/// price and are skipped.
pub fn parse_quotes(body: &[u8], now: DateTime<Utc>) -> Result<Vec<RawItem>, SourceError> {
    let payload: JsonValue = serde_json::from_slice(body)
        .map_err(|e| SourceError::parse(NAME, format!("quote JSON: {e}")))?;
    let Some(diff) = payload.pointer("/data/diff").and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };

    let mut items = Vec::with_capacity(diff.len());
    for quote in diff {
        let Some(code) = code_field(quote.get("f12")) else {
            continue;
        };
        let name = quote.get("f14").and_then(JsonValue::as_str).unwrap_or("").trim();
        let Some(price) = number(quote.get("f2")) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let market = quote.get("f13").and_then(JsonValue::as_i64).unwrap_or(0);
        let change_pct = number(quote.get("f3"));
        let change = number(quote.get("f4"));

        let mut description = format!("{name} {price:.2}");
        if let Some(pct) = change_pct {
            description.push_str(&format!(" {pct:+.2}%"));
        }

        let mut item = RawItem::new(
            Channel::Ashare,
            name,
            format!("https://quote.eastmoney.com/unify/r/{market}.{code}"),
        )
        .with_description(description)
        .published_at(now)
        .hot_score(price)
        .extra("code", code)
        .extra("market", market)
        .extra("price", price);
        if let Some(pct) = change_pct {
            item = item.extra("change_pct", pct);
        }
        if let Some(change) = change {
            item = item.extra("change", change);
        }
        items.push(item);
    }
    Ok(items)
}
