//! In-memory shard backend for tests and local dry runs.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use thub_core::{
    civil_day_bounds, format_day, sort_records, NormalizedRecord, ShardDescriptor, StoredRecord,
};
use tokio::sync::RwLock;

use crate::shard::{ShardBackend, ShardQuery};
use crate::StoreError;

#[derive(Debug)]
pub struct MemoryShards {
    tables: RwLock<HashMap<&'static str, Vec<StoredRecord>>>,
    write_budget: AtomicUsize,
}

impl Default for MemoryShards {
    fn default() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            write_budget: AtomicUsize::new(usize::MAX),
        }
    }
}

impl MemoryShards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows only `rows` more row writes; the next one fails.
    pub fn limit_writes(&self, rows: usize) {
        self.write_budget.store(rows, Ordering::SeqCst);
    }

    /// Inserts a row verbatim, e.g. a legacy row without `published_date`.
    pub async fn seed(&self, table: &'static str, record: StoredRecord) {
        self.tables.write().await.entry(table).or_default().push(record);
    }

    pub async fn rows(&self, table: &str) -> Vec<StoredRecord> {
        self.tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn take_write_slot(&self) -> bool {
        self.write_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }
}

fn matches_day(record: &StoredRecord, day: NaiveDate) -> bool {
    match record.published_date.as_deref().map(str::trim) {
        Some(stored) if !stored.is_empty() => stored == format_day(day),
        _ => {
            let (start, end) = civil_day_bounds(day);
            record.published_at >= start && record.published_at < end
        }
    }
}

#[async_trait]
impl ShardBackend for MemoryShards {
    async fn ensure_shard(&self, shard: &ShardDescriptor) -> Result<(), StoreError> {
        self.tables.write().await.entry(shard.table).or_default();
        Ok(())
    }

    async fn upsert(
        &self,
        shard: &ShardDescriptor,
        records: &[NormalizedRecord],
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(shard.table).or_default();
        let mut written = 0;
        for record in records {
            if !self.take_write_slot() {
                return Err(StoreError::Write {
                    table: shard.table,
                    attempted: records.len(),
                    written,
                    source: "write budget exhausted".into(),
                });
            }
            let now = Utc::now();
            match rows.iter_mut().find(|row| row.link == record.link) {
                Some(row) => {
                    row.title = record.title.clone();
                    row.description = record.description.clone();
                    row.hot_score = record.hot_score;
                    row.published_at = record.published_at;
                    row.published_date = Some(record.published_date.clone());
                    row.extra = record.extra.clone();
                    row.updated_at = now;
                }
                None => rows.push(StoredRecord {
                    id: record.id,
                    title: record.title.clone(),
                    link: record.link.clone(),
                    channel: record.channel,
                    description: record.description.clone(),
                    published_at: record.published_at,
                    published_date: Some(record.published_date.clone()),
                    hot_score: record.hot_score,
                    extra: record.extra.clone(),
                    created_at: now,
                    updated_at: now,
                }),
            }
            written += 1;
        }
        Ok(written)
    }

    async fn query(
        &self,
        shard: &ShardDescriptor,
        query: &ShardQuery,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<StoredRecord> = tables
            .get(shard.table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| query.day.map_or(true, |day| matches_day(r, day)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_records(&mut rows, query.order);
        rows.truncate(query.limit);
        Ok(rows)
    }

    async fn distinct_days(
        &self,
        shard: &ShardDescriptor,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.read().await;
        let days: BTreeSet<String> = tables
            .get(shard.table)
            .map(|rows| rows.iter().map(StoredRecord::effective_day).collect())
            .unwrap_or_default();
        Ok(days.into_iter().rev().take(limit).collect())
    }

    async fn count_for_day(
        &self,
        shard: &ShardDescriptor,
        day: NaiveDate,
    ) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(shard.table)
            .map(|rows| rows.iter().filter(|r| matches_day(r, day)).count() as u64)
            .unwrap_or(0))
    }
}
