//! HTTP edge over the retrieval pipeline and the session store.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::db::PageStore;
use crate::embedding::EmbeddingClient;
use crate::error::ArchiveError;
use crate::history::{HistoryStore, MessageRecord, SessionRecord};
use crate::llm::LlmClient;
use crate::rag::{RagEngine, StreamEvent};
use crate::vector::{VectorStore, PAGE_COLLECTION, PDF_COLLECTION};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The retrieval pipeline.
    pub rag: Arc<RagEngine>,
    /// Session/history store.
    pub history: HistoryStore,
    /// Relational page store (stats + health).
    pub db: PageStore,
    /// Vector store (stats + health).
    pub vector: VectorStore,
    /// Embedding service (health).
    pub embedding: EmbeddingClient,
    /// Language-model runtime (health).
    pub llm: LlmClient,
    /// Server start time for uptime reporting.
    pub started: Instant,
    /// Optional search rate limiter.
    pub rate_limiter: Option<SearchLimiter>,
}

/// Builds the API router with permissive CORS.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/health/detailed", get(health_detailed))
        .route("/api/stats", get(stats))
        .route("/api/pdfs", get(pdfs_for_page))
        .route("/api/search", axum::routing::post(search))
        .route("/api/sessions", get(list_sessions))
        .route(
            "/api/sessions/{id}",
            get(get_session)
                .delete(delete_session)
                .patch(rename_session),
        )
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn not_found(message: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn too_many_requests() -> ApiError {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorBody {
            message: "rate limit exceeded".to_string(),
        }),
    )
}

fn internal_error(err: ArchiveError) -> ApiError {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            message: err.to_string(),
        }),
    )
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime": state.started.elapsed().as_secs(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn health_detailed(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let (db, vector, embedding, llm) = tokio::join!(
        state.db.health_check(),
        state.vector.health(),
        state.embedding.health(),
        state.llm.health(),
    );

    let component = |result: &Result<(), ArchiveError>| match result {
        Ok(()) => json!({"status": "healthy"}),
        Err(err) => json!({"status": "unhealthy", "error": err.to_string()}),
    };
    let all_healthy = db.is_ok() && vector.is_ok() && embedding.is_ok() && llm.is_ok();

    let body = json!({
        "status": if all_healthy { "healthy" } else { "unhealthy" },
        "uptime": state.started.elapsed().as_secs(),
        "components": {
            "database": component(&db),
            "vector_store": component(&vector),
            "embedding_service": component(&embedding),
            "llm_runtime": component(&llm),
        },
    });
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let pages = state.db.page_count().await.map_err(internal_error)?;
    let images = state.db.image_count().await.map_err(internal_error)?;
    let page_vectors = state
        .vector
        .points_count(PAGE_COLLECTION)
        .await
        .unwrap_or(0);
    let pdf_vectors = state.vector.points_count(PDF_COLLECTION).await.unwrap_or(0);

    Ok(Json(json!({
        "pages": format_count(pages.max(0) as u64),
        "images": format_count(images.max(0) as u64),
        "page_vectors": format_count(page_vectors),
        "pdf_vectors": format_count(pdf_vectors),
        "raw": {
            "pages": pages,
            "images": images,
            "page_vectors": page_vectors,
            "pdf_vectors": pdf_vectors,
        },
    })))
}

#[derive(Debug, Deserialize)]
struct PdfsQuery {
    page: String,
    #[serde(default = "default_pdf_limit")]
    limit: usize,
}

fn default_pdf_limit() -> usize {
    50
}

/// PDF chunks discovered on a given page, straight from the vector store.
async fn pdfs_for_page(
    State(state): State<AppState>,
    Query(query): Query<PdfsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.page.trim().is_empty() {
        return Err(bad_request("page must not be empty"));
    }
    let chunks = state
        .vector
        .scroll_pdfs_by_page(&query.page, query.limit.clamp(1, 200))
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "count": chunks.len(), "chunks": chunks })))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.try_acquire().await {
            return Err(too_many_requests());
        }
    }

    let (tx, rx) = mpsc::channel::<StreamEvent>(64);
    let rag = Arc::clone(&state.rag);
    tokio::spawn(async move {
        rag.search_stream(&request.query, request.session_id, tx)
            .await;
    });

    let stream = ReceiverStream::new(rx).map(|event| Ok(to_sse_event(event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: StreamEvent) -> SseEvent {
    match event {
        StreamEvent::Status(status) => SseEvent::default().event("status").data(status),
        StreamEvent::Session { session_id } => SseEvent::default()
            .event("session")
            .data(json!({ "session_id": session_id }).to_string()),
        StreamEvent::Sources(sources) => SseEvent::default()
            .event("sources")
            .data(serde_json::to_string(&sources).unwrap_or_else(|_| "{}".to_string())),
        StreamEvent::Token(token) => SseEvent::default().event("token").data(token),
        StreamEvent::Error(message) => SseEvent::default().event("error").data(message),
        StreamEvent::Done { total_time_ms } => SseEvent::default()
            .event("done")
            .data(json!({ "total_time_ms": total_time_ms }).to_string()),
    }
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionRecord>>, ApiError> {
    state
        .history
        .list_sessions()
        .await
        .map(Json)
        .map_err(internal_error)
}

#[derive(Debug, Serialize)]
struct SessionDetail {
    #[serde(flatten)]
    session: SessionRecord,
    messages: Vec<MessageRecord>,
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetail>, ApiError> {
    let session = state
        .history
        .get_session(&id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("session not found"))?;
    let messages = state
        .history
        .get_full_history(&id)
        .await
        .map_err(internal_error)?;
    Ok(Json(SessionDetail { session, messages }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed = state
        .history
        .delete_session(&id)
        .await
        .map_err(internal_error)?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("session not found"))
    }
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    title: String,
}

async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<StatusCode, ApiError> {
    if request.title.trim().is_empty() {
        return Err(bad_request("title must not be empty"));
    }
    let renamed = state
        .history
        .update_session_title(&id, request.title.trim())
        .await
        .map_err(internal_error)?;
    if renamed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("session not found"))
    }
}

/// Formats archive sizes the way the UI shows them: `812`, `1.2K+`, `3.4M+`.
fn format_count(count: u64) -> String {
    if count >= 1_000_000 {
        format!("{:.1}M+", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}K+", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

/// Fixed-window request counter guarding the search endpoint: at most
/// `max_requests` searches per `window_ms` span, then 429 until the
/// window rolls over.
#[derive(Clone)]
pub struct SearchLimiter {
    max_requests: u32,
    window: std::time::Duration,
    current: Arc<Mutex<WindowCount>>,
}

struct WindowCount {
    opened_at: Instant,
    used: u32,
}

impl SearchLimiter {
    /// Builds a limiter for the configured window. A zero window or a
    /// zero request budget disables limiting entirely (returns `None`).
    pub fn new(max_requests: u32, window_ms: u64) -> Option<Self> {
        if max_requests == 0 || window_ms == 0 {
            return None;
        }
        Some(Self {
            max_requests,
            window: std::time::Duration::from_millis(window_ms),
            current: Arc::new(Mutex::new(WindowCount {
                opened_at: Instant::now(),
                used: 0,
            })),
        })
    }

    /// Counts this request against the current window, opening a fresh
    /// window first when the old one has expired.
    pub async fn try_acquire(&self) -> bool {
        let mut current = self.current.lock().await;
        if current.opened_at.elapsed() >= self.window {
            current.opened_at = Instant::now();
            current.used = 0;
        }
        if current.used >= self.max_requests {
            return false;
        }
        current.used += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_formatting_tiers() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(812), "812");
        assert_eq!(format_count(1_234), "1.2K+");
        assert_eq!(format_count(999_999), "1000.0K+");
        assert_eq!(format_count(3_400_000), "3.4M+");
    }

    #[tokio::test]
    async fn limiter_exhausts_within_a_window() {
        let limiter = SearchLimiter::new(2, 60_000).unwrap();
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn limiter_resets_when_the_window_rolls_over() {
        let limiter = SearchLimiter::new(1, 20).unwrap();
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(limiter.try_acquire().await);
    }

    #[test]
    fn zero_limits_disable_rate_limiting() {
        assert!(SearchLimiter::new(0, 1000).is_none());
        assert!(SearchLimiter::new(10, 0).is_none());
    }

    #[test]
    fn sse_token_event_carries_raw_text() {
        // Smoke check that event construction does not panic on
        // multi-line token payloads.
        let _ = to_sse_event(StreamEvent::Token("line one\nline two".to_string()));
        let _ = to_sse_event(StreamEvent::Status("Searching..."));
    }
}
