//! Sharded news store for TrendingHub: per-channel upserts, cross-shard merge
//! queries, the composite finance view and a read-through cache.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures::future::try_join_all;
use thiserror::Error;
use thub_core::{
    civil_day, sort_records, Channel, ChannelRegistry, ChannelRoute, CompositeView, DatesQuery,
    NewsQuery, NormalizedRecord, ShardDescriptor, ShardOrder, SortMode, StoredRecord,
    DEFAULT_LIST_LIMIT,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod cache;
pub mod memory;
pub mod pg;
pub mod shard;

pub use cache::{CacheBackend, CacheError, MemoryCache, NoopCache, DEFAULT_CACHE_TTL};
pub use memory::MemoryShards;
pub use pg::{ConnectRetryPolicy, PgShards, DEFAULT_STATEMENT_TIMEOUT};
pub use shard::{ShardBackend, ShardQuery};

pub const CRATE_NAME: &str = "thub-storage";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database unreachable after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: BoxError,
    },
    #[error("ensuring schema for {table}: {source}")]
    Schema {
        table: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("writing to {table} failed after {written} of {attempted} records: {source}")]
    Write {
        table: &'static str,
        attempted: usize,
        written: usize,
        #[source]
        source: BoxError,
    },
    #[error("{table} did not answer within {after:?}")]
    Timeout {
        table: &'static str,
        after: Duration,
    },
    #[error("reading {table}: {source}")]
    Read {
        table: &'static str,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub written: usize,
    /// Records whose channel has no shard in the registry.
    pub skipped_unrouted: usize,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheRefreshOutcome {
    pub refreshed: usize,
    pub failed: usize,
    pub timed_out: bool,
}

/// Write side used by the scheduler.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn save_batch(&self, records: &[NormalizedRecord]) -> Result<SaveSummary, StoreError>;

    /// Starts a background refresh of the default views touching `channels`.
    fn refresh_views(&self, _channels: &[Channel]) -> Option<JoinHandle<CacheRefreshOutcome>> {
        None
    }
}

/// Same-day existence check used by fetch gates.
#[async_trait]
pub trait DayProbe: Send + Sync {
    async fn has_records_for_day(&self, channel: Channel, day: NaiveDate)
        -> Result<bool, StoreError>;
}

/// Read side used by the HTTP API.
#[async_trait]
pub trait NewsReader: Send + Sync {
    async fn list_news(&self, query: NewsQuery) -> Result<Vec<StoredRecord>, StoreError>;
    async fn list_published_dates(&self, query: DatesQuery) -> Result<Vec<String>, StoreError>;
}

pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on any single backend call.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(20);

pub struct Store<B> {
    backend: Arc<B>,
    registry: Arc<ChannelRegistry>,
    cache: Arc<dyn CacheBackend>,
    cache_ttl: Duration,
    refresh_timeout: Duration,
    io_timeout: Duration,
}

impl<B> Clone for Store<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            registry: Arc::clone(&self.registry),
            cache: Arc::clone(&self.cache),
            cache_ttl: self.cache_ttl,
            refresh_timeout: self.refresh_timeout,
            io_timeout: self.io_timeout,
        }
    }
}

impl<B: ShardBackend> Store<B> {
    pub fn new(backend: B, registry: Arc<ChannelRegistry>) -> Self {
        Self {
            backend: Arc::new(backend),
            registry,
            cache: Arc::new(NoopCache),
            cache_ttl: DEFAULT_CACHE_TTL,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        self.cache = cache;
        self.cache_ttl = ttl;
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Ensures every registered shard's table and indexes exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for shard in self.registry.shards() {
            self.bounded(shard, self.backend.ensure_shard(shard)).await?;
            debug!(table = shard.table, "shard ready");
        }
        info!(shards = self.registry.shards().len(), "schema ensured");
        Ok(())
    }

    /// Routes each record to its channel's shard and upserts by link.
    pub async fn save_batch(
        &self,
        records: &[NormalizedRecord],
    ) -> Result<SaveSummary, StoreError> {
        let mut order: Vec<Channel> = Vec::new();
        let mut groups: HashMap<Channel, Vec<NormalizedRecord>> = HashMap::new();
        for record in records {
            if !groups.contains_key(&record.channel) {
                order.push(record.channel);
            }
            groups.entry(record.channel).or_default().push(record.clone());
        }

        let mut summary = SaveSummary::default();
        for channel in order {
            let batch = groups.remove(&channel).unwrap_or_default();
            let Some(shard) = self.registry.shard(channel) else {
                warn!(%channel, skipped = batch.len(), "no shard registered for channel");
                summary.skipped_unrouted += batch.len();
                continue;
            };
            summary.written += self.bounded(shard, self.backend.upsert(shard, &batch)).await?;
            summary.channels.push(channel);
        }
        Ok(summary)
    }

    /// Cached `ListNews`.
    pub async fn list_news(&self, query: NewsQuery) -> Result<Vec<StoredRecord>, StoreError> {
        let query = NewsQuery::new(query.channel, query.sort, query.limit, query.day);
        let key = query.cache_key();
        if let Some(hit) = self.cache_lookup::<Vec<StoredRecord>>(&key).await {
            return Ok(hit);
        }
        let records = self.load_news(&query).await?;
        if !records.is_empty() {
            self.cache_store(&key, &records).await;
        }
        Ok(records)
    }

    /// `ListNews` straight from the shards.
    pub async fn load_news(&self, query: &NewsQuery) -> Result<Vec<StoredRecord>, StoreError> {
        match self.registry.route(query.channel) {
            ChannelRoute::All(shards) => self.merge_shards(shards, query).await,
            ChannelRoute::Shard(shard) => {
                let shard_query = ShardQuery {
                    order: query.sort.into(),
                    day: query.day,
                    limit: query.limit,
                };
                self.bounded(shard, self.backend.query(shard, &shard_query)).await
            }
            ChannelRoute::Composite(view) => self.composite(view, query).await,
            ChannelRoute::Unrouted => Ok(Vec::new()),
        }
    }

    async fn merge_shards(
        &self,
        shards: &[ShardDescriptor],
        query: &NewsQuery,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let order: ShardOrder = query.sort.into();
        let shard_query = ShardQuery {
            order,
            day: query.day,
            limit: query.limit.saturating_mul(2),
        };
        let parts = try_join_all(
            shards
                .iter()
                .map(|shard| self.bounded(shard, self.backend.query(shard, &shard_query))),
        )
        .await?;
        let mut merged: Vec<StoredRecord> = parts.into_iter().flatten().collect();
        sort_records(&mut merged, order);
        merged.truncate(query.limit);
        Ok(merged)
    }

    async fn composite(
        &self,
        view: &CompositeView,
        query: &NewsQuery,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let day = match query.day {
            Some(day) => Some(day),
            None if view.today_without_day => Some(civil_day(Utc::now())),
            None => None,
        };
        let mut out = Vec::new();
        for part in &view.parts {
            let Some(shard) = self.registry.shard(part.shard) else {
                continue;
            };
            let shard_query = ShardQuery {
                order: part.order,
                day,
                limit: part.cap,
            };
            out.extend(self.bounded(shard, self.backend.query(shard, &shard_query)).await?);
        }
        out.truncate(query.limit);
        Ok(out)
    }

    /// Cached `ListPublishedDates`: distinct days, most recent first.
    pub async fn list_published_dates(&self, query: DatesQuery) -> Result<Vec<String>, StoreError> {
        let query = DatesQuery::new(query.channel, query.limit);
        let key = query.cache_key();
        if let Some(hit) = self.cache_lookup::<Vec<String>>(&key).await {
            return Ok(hit);
        }

        let shards = self.registry.shards_for(query.channel);
        let per_shard = try_join_all(
            shards
                .into_iter()
                .map(|shard| self.bounded(shard, self.backend.distinct_days(shard, query.limit))),
        )
        .await?;
        let days: BTreeSet<String> = per_shard.into_iter().flatten().collect();
        let days: Vec<String> = days.into_iter().rev().take(query.limit).collect();

        if !days.is_empty() {
            self.cache_store(&key, &days).await;
        }
        Ok(days)
    }

    /// Whether any shard behind `channel` holds a row for the civil `day`.
    /// Never served from cache.
    pub async fn has_records_for_day(
        &self,
        channel: Channel,
        day: NaiveDate,
    ) -> Result<bool, StoreError> {
        for shard in self.registry.shards_for(Some(channel)) {
            if self.bounded(shard, self.backend.count_for_day(shard, day)).await? > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Recomputes the default views (latest and hot at the default limit) for
    /// each written channel, the composites built on them and the
    /// all-channels view, and writes them to the cache.
    pub fn spawn_cache_refresh(&self, channels: &[Channel]) -> JoinHandle<CacheRefreshOutcome> {
        let store = self.clone();
        let views = self.refresh_targets(channels);
        tokio::spawn(async move {
            let timeout = store.refresh_timeout;
            let mut outcome = CacheRefreshOutcome::default();
            let work = async {
                for channel in views {
                    for sort in [SortMode::Latest, SortMode::Hot] {
                        let query = NewsQuery::new(channel, sort, DEFAULT_LIST_LIMIT, None);
                        match store.load_news(&query).await {
                            Ok(records) => {
                                if !records.is_empty() {
                                    store.cache_store(&query.cache_key(), &records).await;
                                }
                                outcome.refreshed += 1;
                            }
                            Err(err) => {
                                warn!(error = %err, key = %query.cache_key(), "cache refresh query failed");
                                outcome.failed += 1;
                            }
                        }
                    }
                }
            };
            if tokio::time::timeout(timeout, work).await.is_err() {
                outcome.timed_out = true;
            }
            debug!(
                refreshed = outcome.refreshed,
                failed = outcome.failed,
                timed_out = outcome.timed_out,
                "cache refresh finished"
            );
            outcome
        })
    }

    fn refresh_targets(&self, channels: &[Channel]) -> Vec<Option<Channel>> {
        let mut views: Vec<Option<Channel>> = Vec::new();
        for channel in channels {
            if !views.contains(&Some(*channel)) {
                views.push(Some(*channel));
            }
        }
        for view in self.registry.composites() {
            let touched = view.parts.iter().any(|p| channels.contains(&p.shard));
            if touched && !views.contains(&Some(view.channel)) {
                views.push(Some(view.channel));
            }
        }
        views.push(None);
        views
    }

    async fn bounded<T>(
        &self,
        shard: &ShardDescriptor,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.io_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(table = shard.table, after = ?self.io_timeout, "shard call timed out");
                Err(StoreError::Timeout {
                    table: shard.table,
                    after: self.io_timeout,
                })
            }
        }
    }

    async fn cache_lookup<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    debug!(key, "cache hit");
                    Some(value)
                }
                Err(err) => {
                    warn!(key, error = %err, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key, error = %err, "cache read failed; querying shards");
                None
            }
        }
    }

    async fn cache_store<T: serde::Serialize>(&self, key: &str, value: &T) {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(source) => {
                let err = CacheError::Encode {
                    key: key.to_string(),
                    source,
                };
                warn!(error = %err, "cache write skipped");
                return;
            }
        };
        if let Err(err) = self.cache.set(key, encoded, self.cache_ttl).await {
            warn!(key, error = %err, "cache write failed");
        }
    }
}

#[async_trait]
impl<B: ShardBackend> BatchSink for Store<B> {
    async fn save_batch(&self, records: &[NormalizedRecord]) -> Result<SaveSummary, StoreError> {
        Store::save_batch(self, records).await
    }

    fn refresh_views(&self, channels: &[Channel]) -> Option<JoinHandle<CacheRefreshOutcome>> {
        Some(self.spawn_cache_refresh(channels))
    }
}

#[async_trait]
impl<B: ShardBackend> DayProbe for Store<B> {
    async fn has_records_for_day(
        &self,
        channel: Channel,
        day: NaiveDate,
    ) -> Result<bool, StoreError> {
        Store::has_records_for_day(self, channel, day).await
    }
}

#[async_trait]
impl<B: ShardBackend> NewsReader for Store<B> {
    async fn list_news(&self, query: NewsQuery) -> Result<Vec<StoredRecord>, StoreError> {
        Store::list_news(self, query).await
    }

    async fn list_published_dates(&self, query: DatesQuery) -> Result<Vec<String>, StoreError> {
        Store::list_published_dates(self, query).await
    }
}
