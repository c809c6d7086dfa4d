use async_trait::async_trait;
use chrono::NaiveDate;
use thub_core::{NormalizedRecord, ShardDescriptor, ShardOrder, StoredRecord};

use crate::StoreError;

/// Per-shard read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardQuery {
    pub order: ShardOrder,
    /// Civil day filter: stored `published_date`, or for rows without one,
    /// `published_at` inside the day's UTC bounds.
    pub day: Option<NaiveDate>,
    pub limit: usize,
}

/// Physical storage of the per-channel shards.
///
/// The table name always comes from a [`ShardDescriptor`] built from the
/// closed channel set, never from request input.
#[async_trait]
pub trait ShardBackend: Send + Sync + 'static {
    /// Creates the shard's table and indexes when missing.
    async fn ensure_shard(&self, shard: &ShardDescriptor) -> Result<(), StoreError>;

    /// Upserts keyed by link, one row at a time. Returns the number of rows
    /// written; rows written before a failure stay written.
    async fn upsert(
        &self,
        shard: &ShardDescriptor,
        records: &[NormalizedRecord],
    ) -> Result<usize, StoreError>;

    async fn query(
        &self,
        shard: &ShardDescriptor,
        query: &ShardQuery,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Distinct effective days, most recent first.
    async fn distinct_days(
        &self,
        shard: &ShardDescriptor,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    async fn count_for_day(&self, shard: &ShardDescriptor, day: NaiveDate)
        -> Result<u64, StoreError>;
}
