//! Runs only when `THUB_TEST_DATABASE_URL` points at a disposable database.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thub_core::{
    civil_day_string, fingerprint, parse_day, Channel, ChannelRegistry, DatesQuery, NewsQuery,
    NormalizedRecord, ShardDescriptor, SortMode,
};
use thub_storage::{ConnectRetryPolicy, PgShards, Store, DEFAULT_STATEMENT_TIMEOUT};

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn record(link: &str, at: DateTime<Utc>, hot: f64) -> NormalizedRecord {
    NormalizedRecord {
        id: fingerprint(link),
        title: link.to_string(),
        link: link.to_string(),
        channel: Channel::Github,
        description: String::new(),
        published_at: at,
        published_date: civil_day_string(at),
        hot_score: hot,
        extra: serde_json::json!({"lang": "rust"}).as_object().cloned().unwrap(),
    }
}

async fn connect(url: &str, max_connections: u32) -> PgShards {
    PgShards::connect(
        url,
        max_connections,
        DEFAULT_STATEMENT_TIMEOUT,
        ConnectRetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(200),
        },
    )
    .await
    .expect("connect")
}

async fn fresh_store(url: &str, max_connections: u32, table: &'static str) -> Store<PgShards> {
    let shards = connect(url, max_connections).await;
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(shards.pool())
        .await
        .expect("drop");
    let registry = ChannelRegistry::new(
        vec![ShardDescriptor { channel: Channel::Github, table }],
        vec![],
    );
    Store::new(shards, Arc::new(registry))
}

/// Saves the same new links from many tasks at once and checks that every
/// save succeeds and each link ends up as one row.
async fn race_same_links(store: &Store<PgShards>, table: &str) {
    for round in 0..5 {
        let link = format!("https://github.com/race/{round}");
        let saves = (0..8).map(|i| {
            let store = store.clone();
            let rec = record(&link, ts("2024-01-03T17:00:00Z"), f64::from(i));
            tokio::spawn(async move { store.save_batch(&[rec]).await })
        });
        for outcome in futures::future::join_all(saves).await {
            let summary = outcome.expect("task").expect("concurrent save");
            assert_eq!(summary.written, 1);
        }
        let (rows,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table} WHERE link = $1"))
            .bind(&link)
            .fetch_one(store.backend().pool())
            .await
            .expect("count");
        assert_eq!(rows, 1);
    }
}

#[tokio::test]
async fn postgres_upsert_and_day_queries() {
    let Ok(url) = std::env::var("THUB_TEST_DATABASE_URL") else {
        eprintln!("THUB_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let store = fresh_store(&url, 2, "news_test_github").await;
    store.ensure_schema().await.expect("schema");
    store.ensure_schema().await.expect("schema is idempotent");

    let a = record("https://github.com/a", ts("2024-01-03T17:00:00Z"), 5.0);
    let b = record("https://github.com/b", ts("2024-01-03T15:00:00Z"), 9.0);
    store.save_batch(&[a.clone(), b]).await.expect("save");
    let mut a2 = a.clone();
    a2.hot_score = 50.0;
    store.save_batch(&[a2]).await.expect("upsert");

    let hot = store
        .list_news(NewsQuery::new(Some(Channel::Github), SortMode::Hot, 10, None))
        .await
        .expect("list");
    assert_eq!(hot.len(), 2);
    assert_eq!(hot[0].link, "https://github.com/a");
    assert_eq!(hot[0].hot_score, 50.0);
    assert_eq!(hot[0].id, fingerprint("https://github.com/a"));
    assert_eq!(hot[0].extra.get("lang").and_then(|v| v.as_str()), Some("rust"));

    let day = parse_day("2024-01-04").unwrap();
    let on_day = store
        .list_news(NewsQuery::new(Some(Channel::Github), SortMode::Latest, 10, Some(day)))
        .await
        .expect("list day");
    assert_eq!(on_day.len(), 1);

    let dates = store
        .list_published_dates(DatesQuery::new(Some(Channel::Github), 31))
        .await
        .expect("dates");
    assert_eq!(dates, vec!["2024-01-04", "2024-01-03"]);
    assert!(store.has_records_for_day(Channel::Github, day).await.expect("day check"));
}

#[tokio::test]
async fn postgres_blank_published_date_falls_back_to_published_at() {
    let Ok(url) = std::env::var("THUB_TEST_DATABASE_URL") else {
        eprintln!("THUB_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let store = fresh_store(&url, 2, "news_test_blank_github").await;
    store.ensure_schema().await.expect("schema");

    // 2024-01-05 10:00 civil time, stored with a whitespace-only day
    sqlx::query(
        "INSERT INTO news_test_blank_github (id, title, link, channel, published_at, published_date) \
         VALUES ($1, 'blank', 'https://github.com/blank', 'github', $2, '  ')",
    )
    .bind(fingerprint("https://github.com/blank"))
    .bind(ts("2024-01-05T02:00:00Z"))
    .execute(store.backend().pool())
    .await
    .expect("insert");

    let day = parse_day("2024-01-05").unwrap();
    let on_day = store
        .list_news(NewsQuery::new(Some(Channel::Github), SortMode::Latest, 10, Some(day)))
        .await
        .expect("list day");
    assert_eq!(on_day.len(), 1);
    assert_eq!(on_day[0].link, "https://github.com/blank");

    let dates = store
        .list_published_dates(DatesQuery::new(Some(Channel::Github), 31))
        .await
        .expect("dates");
    assert_eq!(dates, vec!["2024-01-05"]);
    assert!(store.has_records_for_day(Channel::Github, day).await.expect("day check"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn postgres_concurrent_saves_of_one_link_all_succeed() {
    let Ok(url) = std::env::var("THUB_TEST_DATABASE_URL") else {
        eprintln!("THUB_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let store = fresh_store(&url, 8, "news_test_race_github").await;
    store.ensure_schema().await.expect("schema");
    race_same_links(&store, "news_test_race_github").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn postgres_concurrent_saves_on_an_id_keyed_table_all_succeed() {
    let Ok(url) = std::env::var("THUB_TEST_DATABASE_URL") else {
        eprintln!("THUB_TEST_DATABASE_URL not set; skipping");
        return;
    };
    let store = fresh_store(&url, 8, "news_test_legacy_github").await;
    // older deployments keyed the table on id with a separate unique link
    sqlx::query(
        r#"
        CREATE TABLE news_test_legacy_github (
            id UUID PRIMARY KEY,
            title TEXT NOT NULL,
            link TEXT NOT NULL UNIQUE,
            channel TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            published_at TIMESTAMPTZ NOT NULL,
            published_date TEXT,
            hot_score DOUBLE PRECISION NOT NULL DEFAULT 0,
            extra JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(store.backend().pool())
    .await
    .expect("create id-keyed table");
    store.ensure_schema().await.expect("schema on existing table");
    race_same_links(&store, "news_test_legacy_github").await;
}
