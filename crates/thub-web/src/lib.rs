//! JSON read API over the news store, plus a health probe and a manual
//! collection trigger.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thub_core::{
    parse_day, Channel, DatesQuery, NewsQuery, SortMode, DEFAULT_DATES_LIMIT, DEFAULT_LIST_LIMIT,
    MAX_DATES_LIMIT,
};
use thub_ingest::IngestScheduler;
use thub_storage::NewsReader;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "thub-web";

pub const MAX_API_LIMIT: usize = 100;
pub const MAX_FINANCE_API_LIMIT: usize = 600;

#[derive(Clone)]
pub struct AppState {
    pub reader: Arc<dyn NewsReader>,
    /// Absent when the process runs without ingestion.
    pub scheduler: Option<Arc<IngestScheduler>>,
}

impl AppState {
    pub fn new(reader: Arc<dyn NewsReader>) -> Self {
        Self {
            reader,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<IngestScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: &'static str,
    pub message: String,
    pub data: Option<T>,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        code: "ok",
        message: String::new(),
        data: Some(data),
    })
    .into_response()
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", m),
        };
        (
            status,
            Json(Envelope::<()> {
                code,
                message,
                data: None,
            }),
        )
            .into_response()
    }
}

// Query values arrive as strings so that garbage falls back to defaults
// instead of a rejection.
#[derive(Debug, Default, Deserialize)]
struct NewsParams {
    channel: Option<String>,
    sort: Option<String>,
    limit: Option<String>,
    date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DatesParams {
    channel: Option<String>,
    limit: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/news", get(news_handler))
        .route("/api/v1/news/dates", get(dates_handler))
        .route("/api/v1/collect", post(collect_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

fn parse_channel(raw: Option<&str>) -> Result<Option<Channel>, ApiError> {
    match raw.map(str::trim) {
        None | Some("") | Some("all") => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e: thub_core::ChannelParseError| ApiError::BadRequest(e.to_string())),
    }
}

fn parse_limit(raw: Option<&str>) -> Option<usize> {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
}

async fn news_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NewsParams>,
) -> Result<Response, ApiError> {
    let channel = parse_channel(params.channel.as_deref())?;
    let sort = SortMode::from_code_or_default(params.sort.as_deref().unwrap_or_default());
    let day = match params.date.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => Some(parse_day(value).map_err(|e| ApiError::BadRequest(e.to_string()))?),
    };
    let ceiling = if channel == Some(Channel::Finance) {
        MAX_FINANCE_API_LIMIT
    } else {
        MAX_API_LIMIT
    };
    let limit = parse_limit(params.limit.as_deref())
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(ceiling);

    let records = state
        .reader
        .list_news(NewsQuery::new(channel, sort, limit, day))
        .await
        .map_err(|err| {
            error!(error = %err, "listing news failed");
            ApiError::Internal(err.to_string())
        })?;
    Ok(ok(records))
}

async fn dates_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DatesParams>,
) -> Result<Response, ApiError> {
    let channel = parse_channel(params.channel.as_deref())?;
    let limit = parse_limit(params.limit.as_deref())
        .unwrap_or(DEFAULT_DATES_LIMIT)
        .min(MAX_DATES_LIMIT);
    let dates = state
        .reader
        .list_published_dates(DatesQuery::new(channel, limit))
        .await
        .map_err(|err| {
            error!(error = %err, "listing published dates failed");
            ApiError::Internal(err.to_string())
        })?;
    Ok(ok(dates))
}

async fn collect_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let Some(scheduler) = &state.scheduler else {
        return Err(ApiError::NotFound("ingestion is not running".to_string()));
    };
    let reports = scheduler.run_all_once().await;
    info!(sources = reports.len(), "manual collection finished");
    Ok(ok(reports))
}
