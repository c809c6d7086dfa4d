//! Core domain model for TrendingHub: raw and normalized records, the closed
//! channel set with its shard layout, and the civil-day math shared by the
//! write and read paths.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "thub-core";

/// Offset of the civil timezone (UTC+08:00) every calendar day is derived in.
pub const CIVIL_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Storage and wire format of a calendar day.
pub const DAY_FORMAT: &str = "%Y-%m-%d";

pub fn civil_offset() -> FixedOffset {
    FixedOffset::east_opt(CIVIL_UTC_OFFSET_SECS).expect("civil offset is within +/-24h")
}

/// Wall-clock view of `ts` in the civil timezone.
pub fn civil_time(ts: DateTime<Utc>) -> DateTime<FixedOffset> {
    ts.with_timezone(&civil_offset())
}

/// Calendar day of `ts` in the civil timezone.
///
/// This is the single derivation used when stamping `published_date` on write
/// and when re-deriving the day of legacy rows on read.
pub fn civil_day(ts: DateTime<Utc>) -> NaiveDate {
    civil_time(ts).date_naive()
}

pub fn civil_day_string(ts: DateTime<Utc>) -> String {
    format_day(civil_day(ts))
}

pub fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

/// Half-open UTC interval `[start, end)` covering `day` in the civil timezone.
pub fn civil_day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let midnight = day.and_hms_opt(0, 0, 0).expect("midnight is a valid time");
    let start = civil_offset()
        .from_local_datetime(&midnight)
        .single()
        .expect("fixed offsets have no gaps")
        .with_timezone(&Utc);
    (start, start + Duration::days(1))
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid date {0:?}, expected YYYY-MM-DD")]
pub struct DayParseError(pub String);

pub fn parse_day(value: &str) -> Result<NaiveDate, DayParseError> {
    NaiveDate::parse_from_str(value.trim(), DAY_FORMAT).map_err(|_| DayParseError(value.to_string()))
}

/// Stable identity of a record: UUID v5 of its link in the URL namespace.
pub fn fingerprint(link: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, link.as_bytes())
}

/// Logical partition of the news history. Every channel except `Finance` owns
/// one storage shard; `Finance` is a composite read view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Github,
    Baidu,
    HackerNews,
    Gold,
    Ashare,
    Finance,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::Github,
        Channel::Baidu,
        Channel::HackerNews,
        Channel::Gold,
        Channel::Ashare,
        Channel::Finance,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Channel::Github => "github",
            Channel::Baidu => "baidu",
            Channel::HackerNews => "hackernews",
            Channel::Gold => "gold",
            Channel::Ashare => "ashare",
            Channel::Finance => "finance",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown channel {0:?}")]
pub struct ChannelParseError(pub String);

impl FromStr for Channel {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Channel::ALL
            .into_iter()
            .find(|c| c.code().eq_ignore_ascii_case(needle))
            .ok_or_else(|| ChannelParseError(s.to_string()))
    }
}

/// Source-specific payload prior to normalization. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub channel: Channel,
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    pub published_at: DateTime<Utc>,
    pub hot_score: f64,
    #[serde(default)]
    pub extra: JsonMap<String, JsonValue>,
}

impl RawItem {
    pub fn new(channel: Channel, title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            channel,
            title: title.into(),
            link: link.into(),
            description: None,
            published_at: Utc::now(),
            hot_score: 0.0,
            extra: JsonMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn published_at(mut self, ts: DateTime<Utc>) -> Self {
        self.published_at = ts;
        self
    }

    pub fn hot_score(mut self, score: f64) -> Self {
        self.hot_score = score;
        self
    }

    pub fn extra(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Canonical, storable unit. `id` is always `fingerprint(&link)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRecord {
    pub id: Uuid,
    pub title: String,
    pub link: String,
    pub channel: Channel,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub published_date: String,
    pub hot_score: f64,
    pub extra: JsonMap<String, JsonValue>,
}

/// A record as read back from a shard. `published_date` is optional because
/// rows written before the column existed carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    pub id: Uuid,
    pub title: String,
    pub link: String,
    pub channel: Channel,
    pub description: String,
    pub published_at: DateTime<Utc>,
    pub published_date: Option<String>,
    pub hot_score: f64,
    pub extra: JsonMap<String, JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRecord {
    /// Stored calendar day, or the one derived from `published_at` for legacy rows.
    pub fn effective_day(&self) -> String {
        match self.published_date.as_deref().map(str::trim) {
            Some(day) if !day.is_empty() => day.to_string(),
            _ => civil_day_string(self.published_at),
        }
    }

    pub fn is_on_day(&self, day: NaiveDate) -> bool {
        self.effective_day() == format_day(day)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    #[default]
    Latest,
    Hot,
}

impl SortMode {
    pub fn code(self) -> &'static str {
        match self {
            SortMode::Latest => "latest",
            SortMode::Hot => "hot",
        }
    }

    /// Unknown or empty values fall back to `Latest`.
    pub fn from_code_or_default(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "hot" => SortMode::Hot,
            _ => SortMode::Latest,
        }
    }
}

/// Row order requested from a single shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardOrder {
    PublishedDesc,
    HotDesc,
    PublishedAsc,
}

impl From<SortMode> for ShardOrder {
    fn from(sort: SortMode) -> Self {
        match sort {
            SortMode::Latest => ShardOrder::PublishedDesc,
            SortMode::Hot => ShardOrder::HotDesc,
        }
    }
}

impl ShardOrder {
    pub fn compare(self, a: &StoredRecord, b: &StoredRecord) -> Ordering {
        match self {
            ShardOrder::PublishedDesc => b.published_at.cmp(&a.published_at),
            ShardOrder::PublishedAsc => a.published_at.cmp(&b.published_at),
            ShardOrder::HotDesc => b
                .hot_score
                .total_cmp(&a.hot_score)
                .then_with(|| b.published_at.cmp(&a.published_at)),
        }
    }
}

pub fn sort_records(records: &mut [StoredRecord], order: ShardOrder) {
    records.sort_by(|a, b| order.compare(a, b));
}

/// One physical shard: the channel it holds and its table name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub channel: Channel,
    pub table: &'static str,
}

/// One sub-shard of a composite view with its own ordering and cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositePart {
    pub shard: Channel,
    pub order: ShardOrder,
    pub cap: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeView {
    pub channel: Channel,
    pub parts: Vec<CompositePart>,
    /// Without a day filter, only rows from the current civil day are returned.
    pub today_without_day: bool,
}

/// How a channel filter resolves against the registry.
#[derive(Debug, Clone, Copy)]
pub enum ChannelRoute<'a> {
    All(&'a [ShardDescriptor]),
    Shard(&'a ShardDescriptor),
    Composite(&'a CompositeView),
    Unrouted,
}

/// Explicit (channel, shard) layout built once at startup and shared by
/// reference with the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRegistry {
    shards: Vec<ShardDescriptor>,
    composites: Vec<CompositeView>,
}

pub const FINANCE_PART_CAP: usize = 500;

impl ChannelRegistry {
    pub fn new(shards: Vec<ShardDescriptor>, composites: Vec<CompositeView>) -> Self {
        Self { shards, composites }
    }

    /// Production layout: one `news_*` table per source channel plus the
    /// `finance` view over gold and A-share quotes.
    pub fn standard() -> Self {
        Self::new(
            vec![
                ShardDescriptor { channel: Channel::Github, table: "news_github" },
                ShardDescriptor { channel: Channel::Baidu, table: "news_baidu" },
                ShardDescriptor { channel: Channel::HackerNews, table: "news_hackernews" },
                ShardDescriptor { channel: Channel::Gold, table: "news_gold" },
                ShardDescriptor { channel: Channel::Ashare, table: "news_ashare" },
            ],
            vec![CompositeView {
                channel: Channel::Finance,
                parts: vec![
                    CompositePart {
                        shard: Channel::Gold,
                        order: ShardOrder::PublishedAsc,
                        cap: FINANCE_PART_CAP,
                    },
                    CompositePart {
                        shard: Channel::Ashare,
                        order: ShardOrder::PublishedAsc,
                        cap: FINANCE_PART_CAP,
                    },
                ],
                today_without_day: true,
            }],
        )
    }

    pub fn shards(&self) -> &[ShardDescriptor] {
        &self.shards
    }

    pub fn composites(&self) -> &[CompositeView] {
        &self.composites
    }

    pub fn shard(&self, channel: Channel) -> Option<&ShardDescriptor> {
        self.shards.iter().find(|s| s.channel == channel)
    }

    pub fn composite(&self, channel: Channel) -> Option<&CompositeView> {
        self.composites.iter().find(|c| c.channel == channel)
    }

    pub fn route(&self, channel: Option<Channel>) -> ChannelRoute<'_> {
        let Some(channel) = channel else {
            return ChannelRoute::All(&self.shards);
        };
        if let Some(view) = self.composite(channel) {
            return ChannelRoute::Composite(view);
        }
        match self.shard(channel) {
            Some(shard) => ChannelRoute::Shard(shard),
            None => ChannelRoute::Unrouted,
        }
    }

    /// Every shard a channel filter reads from, in registry order.
    pub fn shards_for(&self, channel: Option<Channel>) -> Vec<&ShardDescriptor> {
        match self.route(channel) {
            ChannelRoute::All(shards) => shards.iter().collect(),
            ChannelRoute::Shard(shard) => vec![shard],
            ChannelRoute::Composite(view) => view
                .parts
                .iter()
                .filter_map(|p| self.shard(p.shard))
                .collect(),
            ChannelRoute::Unrouted => Vec::new(),
        }
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 1000;
pub const DEFAULT_DATES_LIMIT: usize = 31;
pub const MAX_DATES_LIMIT: usize = 365;

/// Full signature of a `ListNews` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewsQuery {
    pub channel: Option<Channel>,
    pub sort: SortMode,
    pub limit: usize,
    pub day: Option<NaiveDate>,
}

impl NewsQuery {
    /// Limits outside `1..=1000` become the default of 20.
    pub fn new(channel: Option<Channel>, sort: SortMode, limit: usize, day: Option<NaiveDate>) -> Self {
        let limit = if limit == 0 || limit > MAX_LIST_LIMIT {
            DEFAULT_LIST_LIMIT
        } else {
            limit
        };
        Self { channel, sort, limit, day }
    }

    pub fn latest(channel: Option<Channel>, limit: usize) -> Self {
        Self::new(channel, SortMode::Latest, limit, None)
    }

    pub fn cache_key(&self) -> String {
        format!(
            "news:list:{}:{}:{}:{}",
            self.channel.map(Channel::code).unwrap_or(""),
            self.sort.code(),
            self.limit,
            self.day.map(format_day).unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatesQuery {
    pub channel: Option<Channel>,
    pub limit: usize,
}

impl DatesQuery {
    /// Limits outside `1..=365` become the default of 31.
    pub fn new(channel: Option<Channel>, limit: usize) -> Self {
        let limit = if limit == 0 || limit > MAX_DATES_LIMIT {
            DEFAULT_DATES_LIMIT
        } else {
            limit
        };
        Self { channel, limit }
    }

    pub fn cache_key(&self) -> String {
        format!(
            "news:dates:{}:{}",
            self.channel.map(Channel::code).unwrap_or(""),
            self.limit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn stored(link: &str, published_at: &str, hot: f64) -> StoredRecord {
        let ts = utc(published_at);
        StoredRecord {
            id: fingerprint(link),
            title: link.to_string(),
            link: link.to_string(),
            channel: Channel::Github,
            description: String::new(),
            published_at: ts,
            published_date: Some(civil_day_string(ts)),
            hot_score: hot,
            extra: JsonMap::new(),
            created_at: ts,
            updated_at: ts,
        }
    }

    #[test]
    fn fingerprint_is_deterministic_per_link() {
        let a = fingerprint("https://github.com/rust-lang/rust");
        let b = fingerprint("https://github.com/rust-lang/rust");
        let c = fingerprint("https://github.com/tokio-rs/tokio");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn civil_day_rolls_over_at_utc_sixteen() {
        assert_eq!(civil_day_string(utc("2024-01-03T15:59:59Z")), "2024-01-03");
        assert_eq!(civil_day_string(utc("2024-01-03T16:00:00Z")), "2024-01-04");
    }

    #[test]
    fn civil_day_bounds_cover_exactly_one_day() {
        let day = parse_day("2024-01-04").unwrap();
        let (start, end) = civil_day_bounds(day);
        assert_eq!(start, utc("2024-01-03T16:00:00Z"));
        assert_eq!(end, utc("2024-01-04T16:00:00Z"));
        assert_eq!(civil_day(start), day);
        assert_ne!(civil_day(end), day);
    }

    #[test]
    fn legacy_rows_derive_their_day() {
        let mut rec = stored("https://a", "2024-01-03T17:00:00Z", 1.0);
        rec.published_date = None;
        assert_eq!(rec.effective_day(), "2024-01-04");
        rec.published_date = Some("  ".to_string());
        assert_eq!(rec.effective_day(), "2024-01-04");
        rec.published_date = Some("2024-01-01".to_string());
        assert_eq!(rec.effective_day(), "2024-01-01");
    }

    #[test]
    fn channel_codes_round_trip_and_reject_unknown() {
        for channel in Channel::ALL {
            assert_eq!(channel.code().parse::<Channel>().unwrap(), channel);
        }
        assert_eq!("HackerNews".parse::<Channel>().unwrap(), Channel::HackerNews);
        assert!("weibo".parse::<Channel>().is_err());
        assert_eq!(serde_json::to_string(&Channel::HackerNews).unwrap(), "\"hackernews\"");
    }

    #[test]
    fn hot_order_breaks_ties_by_recency() {
        let mut rows = vec![
            stored("https://old", "2024-01-01T00:00:00Z", 5.0),
            stored("https://top", "2024-01-01T00:00:00Z", 9.0),
            stored("https://new", "2024-01-02T00:00:00Z", 5.0),
        ];
        sort_records(&mut rows, ShardOrder::HotDesc);
        let links: Vec<_> = rows.iter().map(|r| r.link.as_str()).collect();
        assert_eq!(links, vec!["https://top", "https://new", "https://old"]);
    }

    #[test]
    fn registry_routes_shards_and_composites() {
        let registry = ChannelRegistry::standard();
        assert!(matches!(registry.route(None), ChannelRoute::All(s) if s.len() == 5));
        assert!(matches!(
            registry.route(Some(Channel::Gold)),
            ChannelRoute::Shard(ShardDescriptor { table: "news_gold", .. })
        ));
        assert!(matches!(registry.route(Some(Channel::Finance)), ChannelRoute::Composite(_)));
        let finance_tables: Vec<_> = registry
            .shards_for(Some(Channel::Finance))
            .into_iter()
            .map(|s| s.table)
            .collect();
        assert_eq!(finance_tables, vec!["news_gold", "news_ashare"]);

        let partial = ChannelRegistry::new(
            vec![ShardDescriptor { channel: Channel::Baidu, table: "news_baidu" }],
            vec![],
        );
        assert!(matches!(partial.route(Some(Channel::Github)), ChannelRoute::Unrouted));
        assert!(partial.shards_for(Some(Channel::Github)).is_empty());
    }

    #[test]
    fn query_limits_are_normalized_and_keys_carry_full_signature() {
        assert_eq!(NewsQuery::new(None, SortMode::Hot, 0, None).limit, DEFAULT_LIST_LIMIT);
        assert_eq!(NewsQuery::new(None, SortMode::Hot, 1001, None).limit, DEFAULT_LIST_LIMIT);
        assert_eq!(NewsQuery::new(None, SortMode::Hot, 1000, None).limit, 1000);
        let q = NewsQuery::new(
            Some(Channel::Baidu),
            SortMode::Hot,
            50,
            Some(parse_day("2024-02-01").unwrap()),
        );
        assert_eq!(q.cache_key(), "news:list:baidu:hot:50:2024-02-01");
        assert_eq!(NewsQuery::latest(None, 20).cache_key(), "news:list::latest:20:");
        assert_eq!(DatesQuery::new(Some(Channel::Gold), 400).cache_key(), "news:dates:gold:31");
    }

    #[test]
    fn sort_mode_falls_back_to_latest() {
        assert_eq!(SortMode::from_code_or_default("HOT"), SortMode::Hot);
        assert_eq!(SortMode::from_code_or_default("trending"), SortMode::Latest);
        assert_eq!(SortMode::from_code_or_default(""), SortMode::Latest);
    }
}
