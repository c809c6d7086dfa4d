//! Postgres shard backend: one `news_*` table per channel.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thub_core::{
    civil_day_bounds, format_day, NormalizedRecord, ShardDescriptor, ShardOrder, StoredRecord,
    CIVIL_UTC_OFFSET_SECS,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::shard::{ShardBackend, ShardQuery};
use crate::StoreError;

/// Fixed-delay retry used while the database is still coming up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ConnectRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(2),
        }
    }
}

impl ConnectRetryPolicy {
    /// Runs `op` until it succeeds or the attempts run out. On exhaustion the
    /// last error is returned with the number of attempts made.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, (u32, E)>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts => {
                    warn!(target_name = label, attempt, attempts, error = %err, "connect attempt failed; retrying");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err((attempt, err)),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgShards {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = "id, title, link, channel, description, published_at, published_date, \
     hot_score, extra, created_at, updated_at";

const DAY_FILTER: &str = "(NULLIF(TRIM(published_date), '') = $1 OR (NULLIF(TRIM(published_date), '') IS NULL \
     AND published_at >= $2 AND published_at < $3))";

/// Server-side bound on every statement issued through the pool.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(15);

impl PgShards {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        statement_timeout: Duration,
        retry: ConnectRetryPolicy,
    ) -> Result<Self, StoreError> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|source| StoreError::Connect {
                attempts: 0,
                source: Box::new(source),
            })?
            .options([(
                "statement_timeout",
                format!("{}ms", statement_timeout.as_millis().max(1)),
            )]);
        let pool = retry
            .run("postgres", || {
                PgPoolOptions::new()
                    .max_connections(max_connections.max(1))
                    .acquire_timeout(Duration::from_secs(10))
                    .connect_with(options.clone())
            })
            .await
            .map_err(|(attempts, source)| StoreError::Connect {
                attempts,
                source: Box::new(source),
            })?;
        info!(max_connections, "connected to postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_one(
        &self,
        sql: &str,
        record: &NormalizedRecord,
    ) -> Result<sqlx::postgres::PgQueryResult, sqlx::Error> {
        sqlx::query(sql)
            .bind(record.id)
            .bind(&record.title)
            .bind(&record.link)
            .bind(record.channel.code())
            .bind(&record.description)
            .bind(record.published_at)
            .bind(&record.published_date)
            .bind(record.hot_score)
            .bind(JsonValue::Object(record.extra.clone()))
            .execute(&self.pool)
            .await
    }
}

fn order_clause(order: ShardOrder) -> &'static str {
    match order {
        ShardOrder::PublishedDesc => "published_at DESC",
        ShardOrder::PublishedAsc => "published_at ASC",
        ShardOrder::HotDesc => "hot_score DESC, published_at DESC",
    }
}

fn read_err(table: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Read {
        table,
        source: Box::new(source),
    }
}

fn decode_row(shard: &ShardDescriptor, row: &PgRow) -> Result<StoredRecord, sqlx::Error> {
    let channel: String = row.try_get("channel")?;
    let extra: JsonValue = row.try_get("extra")?;
    Ok(StoredRecord {
        id: row.try_get::<Uuid, _>("id")?,
        title: row.try_get("title")?,
        link: row.try_get("link")?,
        channel: channel.parse().unwrap_or(shard.channel),
        description: row.try_get("description")?,
        published_at: row.try_get::<DateTime<Utc>, _>("published_at")?,
        published_date: row.try_get("published_date")?,
        hot_score: row.try_get("hot_score")?,
        extra: match extra {
            JsonValue::Object(map) => map,
            _ => Default::default(),
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ShardBackend for PgShards {
    async fn ensure_shard(&self, shard: &ShardDescriptor) -> Result<(), StoreError> {
        let table = shard.table;
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    link TEXT PRIMARY KEY,
                    id UUID NOT NULL,
                    title TEXT NOT NULL,
                    channel TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    published_at TIMESTAMPTZ NOT NULL,
                    published_date TEXT,
                    hot_score DOUBLE PRECISION NOT NULL DEFAULT 0,
                    extra JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#
            ),
            format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS published_date TEXT"),
            format!("CREATE INDEX IF NOT EXISTS {table}_id_idx ON {table} (id)"),
            format!("CREATE INDEX IF NOT EXISTS {table}_published_at_idx ON {table} (published_at DESC)"),
            format!("CREATE INDEX IF NOT EXISTS {table}_hot_score_idx ON {table} (hot_score DESC)"),
            format!("CREATE INDEX IF NOT EXISTS {table}_published_date_idx ON {table} (published_date)"),
        ];
        for sql in &statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|source| StoreError::Schema {
                    table,
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }

    async fn upsert(
        &self,
        shard: &ShardDescriptor,
        records: &[NormalizedRecord],
    ) -> Result<usize, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {table}
                (id, title, link, channel, description, published_at, published_date, hot_score, extra)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (link) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                hot_score = EXCLUDED.hot_score,
                published_at = EXCLUDED.published_at,
                published_date = EXCLUDED.published_date,
                extra = EXCLUDED.extra,
                updated_at = NOW()
            "#,
            table = shard.table
        );

        let mut written = 0;
        for record in records {
            let mut result = self.upsert_one(&sql, record).await;
            // Tables created with `id` as primary key can still race on it;
            // the second attempt takes the ON CONFLICT path.
            if matches!(&result, Err(sqlx::Error::Database(db)) if db.is_unique_violation()) {
                warn!(table = shard.table, link = %record.link, "concurrent insert of the same link; retrying as update");
                result = self.upsert_one(&sql, record).await;
            }
            result.map_err(|source| StoreError::Write {
                table: shard.table,
                attempted: records.len(),
                written,
                source: Box::new(source),
            })?;
            written += 1;
        }
        Ok(written)
    }

    async fn query(
        &self,
        shard: &ShardDescriptor,
        query: &ShardQuery,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let order = order_clause(query.order);
        let rows = match query.day {
            Some(day) => {
                let (start, end) = civil_day_bounds(day);
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM {table} WHERE {DAY_FILTER} ORDER BY {order} LIMIT $4",
                    table = shard.table
                );
                sqlx::query(&sql)
                    .bind(format_day(day))
                    .bind(start)
                    .bind(end)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM {table} ORDER BY {order} LIMIT $1",
                    table = shard.table
                );
                sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await
            }
        }
        .map_err(read_err(shard.table))?;

        rows.iter()
            .map(|row| decode_row(shard, row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_err(shard.table))
    }

    async fn distinct_days(
        &self,
        shard: &ShardDescriptor,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let sql = format!(
            r#"
            SELECT day FROM (
                SELECT DISTINCT COALESCE(
                    NULLIF(TRIM(published_date), ''),
                    to_char(published_at AT TIME ZONE make_interval(secs => $1), 'YYYY-MM-DD')
                ) AS day
                FROM {table}
            ) days
            WHERE day IS NOT NULL
            ORDER BY day DESC
            LIMIT $2
            "#,
            table = shard.table
        );
        let rows = sqlx::query(&sql)
            .bind(f64::from(CIVIL_UTC_OFFSET_SECS))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(read_err(shard.table))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("day"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_err(shard.table))
    }

    async fn count_for_day(
        &self,
        shard: &ShardDescriptor,
        day: NaiveDate,
    ) -> Result<u64, StoreError> {
        let (start, end) = civil_day_bounds(day);
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {table} WHERE {DAY_FILTER}",
            table = shard.table
        );
        let row = sqlx::query(&sql)
            .bind(format_day(day))
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .map_err(read_err(shard.table))?;
        let n: i64 = row.try_get("n").map_err(read_err(shard.table))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }
}
