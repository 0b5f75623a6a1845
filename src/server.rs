//! HTTP API.
//!
//! Serves retrieval and chat over JSON while the change-feed listener keeps
//! the index current in the background.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/prompt` | Retrieve context and stream a chat reply as `text/plain` |
//! | `GET`  | `/query` | Ranked chunks for `q` |
//! | `POST` | `/update` | Replace the pushed content entries; returns `{processed, updated, skipped, errors}` |
//! | `POST` | `/reingest` | Rebuild the feed-sourced index from `_all_docs` |
//! | `GET`  | `/cursor` | Current change-feed cursor |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "No messages provided" } }
//! ```
//!
//! Error codes: `bad_request` (400), `internal` (500).
//!
//! # Chat ids
//!
//! `/prompt` takes the chat id from the body's `chat_id`, then from the
//! `X-Chat-Id` header, and otherwise starts a new chat. The id in use is
//! returned in the `X-Chat-Id` response header.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat::ChatLogger;
use crate::classify::ContentPrefixes;
use crate::config::Config;
use crate::cursor::{CursorStore, SqliteCursorStore};
use crate::generate::{OpenAiGenerator, ResponseGenerator};
use crate::index::SqliteIndex;
use crate::listener::{shutdown_signal, ChangeFeedListener, HttpChangeFeed, ListenerHandle};
use crate::models::{ContentItem, PromptMessage, Role, SearchHit};
use crate::revalidate::RevalidationClient;
use crate::search::{excerpt, search_chunks};
use crate::{db, migrate};

pub const CHAT_ID_HEADER: &str = "x-chat-id";

/// How long `serve` waits for the listener after the HTTP server stops.
const LISTENER_GRACE: Duration = Duration::from_secs(10);

const MAX_LIMIT: i64 = 50;
const DEBUG_CONTENT_CHARS: usize = 100;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub chat: ChatLogger,
    pub generator: Arc<dyn ResponseGenerator>,
    pub cursor: Arc<dyn CursorStore>,
    pub index: Arc<SqliteIndex>,
    pub feed: Arc<HttpChangeFeed>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        pool: SqlitePool,
        generator: Arc<dyn ResponseGenerator>,
        feed: Arc<HttpChangeFeed>,
    ) -> Self {
        let index = SqliteIndex::new(
            pool.clone(),
            config.chunking.max_tokens,
            ContentPrefixes::from_config(&config.content),
        );
        Self {
            chat: ChatLogger::new(pool.clone()),
            cursor: Arc::new(SqliteCursorStore::new(pool.clone())),
            index: Arc::new(index),
            config,
            pool,
            generator,
            feed,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::HeaderName::from_static(CHAT_ID_HEADER)]);

    Router::new()
        .route("/health", get(handle_health))
        .route("/prompt", post(handle_prompt))
        .route("/query", get(handle_query))
        .route("/update", post(handle_update))
        .route("/reingest", post(handle_reingest))
        .route("/cursor", get(handle_cursor))
        .layer(cors)
        .with_state(state)
}

/// `feedrag serve`: runs the HTTP API and the change-feed listener until ctrl-c.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());

    let pool = db::connect(&config).await?;
    migrate::migrate_pool(&pool).await?;

    let feed = Arc::new(HttpChangeFeed::from_config(&config.feed)?);
    let generator: Arc<dyn ResponseGenerator> =
        Arc::new(OpenAiGenerator::from_config(&config.generation)?);
    let state = AppState::new(config.clone(), pool.clone(), generator, feed.clone());

    let listener = ChangeFeedListener::new(
        feed,
        state.cursor.clone(),
        state.index.clone(),
        Arc::new(RevalidationClient::from_config(&config.revalidation)?),
        ContentPrefixes::from_config(&config.content),
    );
    let shutdown = CancellationToken::new();
    let handle = ListenerHandle::start_with_token(listener, shutdown.child_token());

    let tcp = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("feedrag listening on http://{}", bind_addr);

    let signal = shutdown.clone();
    axum::serve(tcp, router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = signal.cancelled() => {}
            }
            signal.cancel();
        })
        .await?;

    if let Some(stats) = handle.stop(LISTENER_GRACE).await {
        info!(
            events = stats.events,
            applied = stats.applied,
            reconnects = stats.reconnects,
            "listener finished"
        );
    }
    pool.close().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// 500 with a generic message; the cause is logged, not returned.
fn internal(context: &str, err: anyhow::Error) -> AppError {
    error!(error = %format!("{:#}", err), "{}", context);
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: context.to_string(),
    }
}

fn check_limit(limit: i64) -> Result<i64, AppError> {
    if (1..=MAX_LIMIT).contains(&limit) {
        Ok(limit)
    } else {
        Err(bad_request(format!("limit must be between 1 and {}", MAX_LIMIT)))
    }
}

fn check_threshold(threshold: f64) -> Result<f64, AppError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(bad_request("threshold must be between 0 and 1"))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /prompt ============

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
    #[serde(default)]
    pub chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptParams {
    limit: Option<i64>,
    threshold: Option<f64>,
}

/// Body `chat_id` wins over the header; either must be a UUID when present.
fn requested_chat_id(body: Option<&str>, headers: &HeaderMap) -> Result<Option<Uuid>, AppError> {
    if let Some(id) = body.map(str::trim).filter(|s| !s.is_empty()) {
        return Uuid::parse_str(id)
            .map(Some)
            .map_err(|_| bad_request("Invalid chat_id"));
    }
    match headers.get(CHAT_ID_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map(Some)
            .ok_or_else(|| bad_request("Invalid X-Chat-Id header")),
    }
}

/// Slugs of the hits, in rank order, without repeats.
fn context_slugs(hits: &[SearchHit]) -> Vec<String> {
    let mut slugs: Vec<String> = Vec::new();
    for slug in hits.iter().filter_map(|h| h.slug.as_ref()) {
        if !slugs.contains(slug) {
            slugs.push(slug.clone());
        }
    }
    slugs
}

async fn handle_prompt(
    State(state): State<AppState>,
    Query(params): Query<PromptParams>,
    headers: HeaderMap,
    payload: Result<Json<PromptRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|e| bad_request(e.body_text()))?;
    if request.messages.is_empty() {
        return Err(bad_request("No messages provided"));
    }
    let limit = check_limit(params.limit.unwrap_or(state.config.retrieval.default_limit))?;
    let threshold = check_threshold(
        params
            .threshold
            .unwrap_or(state.config.retrieval.default_threshold),
    )?;

    let chat_id = state
        .chat
        .ensure_chat_id(requested_chat_id(request.chat_id.as_deref(), &headers)?);
    debug!(chat_id = %chat_id, messages = request.messages.len(), "prompt received");

    let latest = request
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();

    let hits = search_chunks(&state.pool, &latest, limit, threshold)
        .await
        .map_err(|e| internal("retrieval failed", e))?;
    let slugs = context_slugs(&hits);

    let seq = state
        .chat
        .next_sequence(chat_id)
        .await
        .map_err(|e| internal("failed to log prompt", e))?;
    state
        .chat
        .log_message(chat_id, Role::User, seq, &latest, Some(slugs.as_slice()))
        .await
        .map_err(|e| internal("failed to log prompt", e))?;

    let deltas = state
        .generator
        .stream_reply(&request.messages, &hits)
        .await
        .map_err(|e| internal("generation failed", e))?;

    let (body_tx, body_rx) = mpsc::channel::<Result<String, std::io::Error>>(16);
    tokio::spawn(relay_reply(
        deltas,
        body_tx,
        state.chat.clone(),
        chat_id,
        seq + 1,
        slugs,
    ));

    let stream = futures::stream::unfold(body_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::HeaderName::from_static(CHAT_ID_HEADER),
                chat_id.to_string(),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Forwards reply deltas to the response body and logs the assistant turn
/// once the reply ends, is cut short, or the client goes away.
async fn relay_reply(
    mut deltas: mpsc::Receiver<anyhow::Result<String>>,
    body: mpsc::Sender<Result<String, std::io::Error>>,
    chat: ChatLogger,
    chat_id: Uuid,
    seq: i64,
    slugs: Vec<String>,
) {
    let mut reply = String::new();
    while let Some(delta) = deltas.recv().await {
        match delta {
            Ok(text) => {
                reply.push_str(&text);
                if body.send(Ok(text)).await.is_err() {
                    debug!(chat_id = %chat_id, "client disconnected mid-reply");
                    break;
                }
            }
            Err(e) => {
                warn!(chat_id = %chat_id, error = %e, "reply stream failed");
                let _ = body.send(Err(std::io::Error::other(e.to_string()))).await;
                break;
            }
        }
    }

    let reply = reply.trim();
    if !reply.is_empty() {
        if let Err(e) = chat
            .log_message(chat_id, Role::Assistant, seq, reply, Some(slugs.as_slice()))
            .await
        {
            error!(chat_id = %chat_id, error = %e, "failed to log assistant message");
        }
    }
    drop(body);
}

// ============ GET /query ============

#[derive(Debug, Deserialize)]
struct QueryParams {
    q: Option<String>,
    limit: Option<i64>,
    threshold: Option<f64>,
    #[serde(default)]
    debug: bool,
}

#[derive(Serialize)]
struct DebugHit {
    id: String,
    title: Option<String>,
    content: Option<String>,
    similarity: f64,
}

async fn handle_query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> Result<Response, AppError> {
    let q = params.q.unwrap_or_default();
    if q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let limit = check_limit(params.limit.unwrap_or(10))?;
    let threshold = check_threshold(
        params
            .threshold
            .unwrap_or(state.config.retrieval.default_threshold),
    )?;

    let hits = search_chunks(&state.pool, &q, limit, threshold)
        .await
        .map_err(|e| internal("query failed", e))?;

    if params.debug {
        let debug: Vec<DebugHit> = hits
            .into_iter()
            .map(|h| DebugHit {
                id: h.id,
                title: h.title,
                content: (!h.content.is_empty()).then(|| excerpt(&h.content, DEBUG_CONTENT_CHARS)),
                similarity: h.similarity,
            })
            .collect();
        return Ok(Json(debug).into_response());
    }

    Ok(Json(hits).into_response())
}

// ============ POST /update ============

#[derive(Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    timestamp: Option<String>,
    content: Vec<ContentItem>,
}

/// Replaces the pushed content entries with the request's `content` list.
async fn handle_update(
    State(state): State<AppState>,
    payload: Result<Json<UpdateRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|e| bad_request(e.body_text()))?;
    info!(
        items = request.content.len(),
        timestamp = request.timestamp.as_deref().unwrap_or("-"),
        "content update received"
    );

    let stats = state
        .index
        .replace_content(&request.content)
        .await
        .map_err(|e| internal("Failed to process content update", e))?;
    Ok(Json(stats).into_response())
}

// ============ POST /reingest ============

async fn handle_reingest(State(state): State<AppState>) -> Result<Response, AppError> {
    let docs = state
        .feed
        .fetch_all_docs()
        .await
        .map_err(|e| internal("ingestion failed", e))?;
    let stats = state
        .index
        .reingest_all(&docs)
        .await
        .map_err(|e| internal("ingestion failed", e))?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "ingestion completed.",
        "stats": stats,
    }))
    .into_response())
}

// ============ GET /cursor ============

async fn handle_cursor(State(state): State<AppState>) -> Result<Response, AppError> {
    let cursor = state
        .cursor
        .get_cursor()
        .await
        .map_err(|e| internal("failed to read cursor", e))?;
    Ok(Json(cursor).into_response())
}
