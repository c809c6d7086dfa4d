use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, NaiveDate, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use thub_core::{fingerprint, Channel, DatesQuery, NewsQuery, RawItem, SortMode, StoredRecord};
use thub_ingest::{IngestScheduler, Normalizer, SourceJob};
use thub_sources::{Source, SourceError};
use thub_storage::{
    BatchSink, NewsReader, SaveSummary, StoreError,
};
use thub_web::{app, AppState};
use tower::ServiceExt;

#[derive(Default)]
struct RecordingReader {
    news: Mutex<Vec<NewsQuery>>,
    dates: Mutex<Vec<DatesQuery>>,
    fail: bool,
}

fn stored(link: &str) -> StoredRecord {
    let at = DateTime::parse_from_rfc3339("2024-01-03T04:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    StoredRecord {
        id: fingerprint(link),
        title: "a title".into(),
        link: link.into(),
        channel: Channel::Github,
        description: "a description".into(),
        published_at: at,
        published_date: Some("2024-01-03".into()),
        hot_score: 12.0,
        extra: Default::default(),
        created_at: at,
        updated_at: at,
    }
}

#[async_trait]
impl NewsReader for RecordingReader {
    async fn list_news(&self, query: NewsQuery) -> Result<Vec<StoredRecord>, StoreError> {
        self.news.lock().unwrap().push(query);
        if self.fail {
            return Err(StoreError::Read {
                table: "news_github",
                source: "pool timed out".into(),
            });
        }
        Ok(vec![stored("https://github.com/a/b")])
    }

    async fn list_published_dates(&self, query: DatesQuery) -> Result<Vec<String>, StoreError> {
        self.dates.lock().unwrap().push(query);
        Ok(vec!["2024-01-03".into(), "2024-01-02".into()])
    }
}

async fn call(app: axum::Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let resp = app
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_reports_ok() {
    let reader = Arc::new(RecordingReader::default());
    let (status, body) = call(app(AppState::new(reader)), "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn news_defaults_and_envelope() {
    let reader = Arc::new(RecordingReader::default());
    let (status, body) = call(app(AppState::new(reader.clone())), "GET", "/api/v1/news").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], "ok");
    assert_eq!(body["data"][0]["link"], "https://github.com/a/b");
    assert_eq!(body["data"][0]["hotScore"], 12.0);

    let seen = reader.news.lock().unwrap().clone();
    assert_eq!(seen, vec![NewsQuery::new(None, SortMode::Latest, 20, None)]);
}

#[tokio::test]
async fn news_parameters_are_forwarded_and_capped() {
    let reader = Arc::new(RecordingReader::default());
    let router = app(AppState::new(reader.clone()));

    let (status, _) = call(
        router.clone(),
        "GET",
        "/api/v1/news?channel=github&sort=hot&limit=5000&date=2024-01-03",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(router.clone(), "GET", "/api/v1/news?channel=finance&limit=600&sort=weird").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(router, "GET", "/api/v1/news?limit=abc").await;
    assert_eq!(status, StatusCode::OK);

    let seen = reader.news.lock().unwrap().clone();
    assert_eq!(
        seen[0],
        NewsQuery::new(
            Some(Channel::Github),
            SortMode::Hot,
            100,
            NaiveDate::from_ymd_opt(2024, 1, 3)
        )
    );
    assert_eq!(seen[1], NewsQuery::new(Some(Channel::Finance), SortMode::Latest, 600, None));
    assert_eq!(seen[2].limit, 20);
}

#[tokio::test]
async fn bad_input_is_rejected_before_the_store() {
    let reader = Arc::new(RecordingReader::default());
    let router = app(AppState::new(reader.clone()));

    let (status, body) = call(router.clone(), "GET", "/api/v1/news?date=03-01-2024").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
    assert!(body["data"].is_null());

    let (status, _) = call(router, "GET", "/api/v1/news?channel=weibo").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(reader.news.lock().unwrap().is_empty());
}

#[tokio::test]
async fn store_failures_become_internal_errors() {
    let reader = Arc::new(RecordingReader {
        fail: true,
        ..Default::default()
    });
    let (status, body) = call(app(AppState::new(reader)), "GET", "/api/v1/news?channel=github").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "internal_error");
}

#[tokio::test]
async fn published_dates_default_limit() {
    let reader = Arc::new(RecordingReader::default());
    let router = app(AppState::new(reader.clone()));
    let (status, body) = call(router.clone(), "GET", "/api/v1/news/dates?channel=baidu").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], serde_json::json!(["2024-01-03", "2024-01-02"]));

    let (status, _) = call(router.clone(), "GET", "/api/v1/news/dates?channel=baidu&limit=5000").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(router, "GET", "/api/v1/news/dates?limit=90").await;
    assert_eq!(status, StatusCode::OK);

    let seen = reader.dates.lock().unwrap().clone();
    assert_eq!(seen[0], DatesQuery::new(Some(Channel::Baidu), 31));
    assert_eq!(seen[1], DatesQuery::new(Some(Channel::Baidu), 365));
    assert_eq!(seen[1].limit, 365);
    assert_eq!(seen[2], DatesQuery::new(None, 90));
}

struct OneItem;

#[async_trait]
impl Source for OneItem {
    fn name(&self) -> &str {
        "baidu_hot"
    }

    fn channel(&self) -> Channel {
        Channel::Baidu
    }

    async fn fetch(&self) -> Result<Vec<RawItem>, SourceError> {
        Ok(vec![RawItem::new(Channel::Baidu, "hot topic", "https://top.baidu.com/x")])
    }
}

struct CountingSink;

#[async_trait]
impl BatchSink for CountingSink {
    async fn save_batch(
        &self,
        records: &[thub_core::NormalizedRecord],
    ) -> Result<SaveSummary, StoreError> {
        Ok(SaveSummary {
            written: records.len(),
            skipped_unrouted: 0,
            channels: vec![Channel::Baidu],
        })
    }
}

#[tokio::test]
async fn collect_needs_a_scheduler() {
    let reader = Arc::new(RecordingReader::default());
    let (status, body) = call(app(AppState::new(reader.clone())), "POST", "/api/v1/collect").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let scheduler = Arc::new(IngestScheduler::new(
        vec![SourceJob::new(Arc::new(OneItem), "0 */30 * * * *")],
        Arc::new(CountingSink),
        Normalizer::default(),
    ));
    let state = AppState::new(reader).with_scheduler(scheduler);
    let (status, body) = call(app(state), "POST", "/api/v1/collect").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["source"], "baidu_hot");
    assert_eq!(body["data"][0]["outcome"]["status"], "saved");
    assert_eq!(body["data"][0]["outcome"]["written"], 1);
}
