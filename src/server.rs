//! HTTP server for book ingestion and chat.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/stats` | Index statistics |
//! | `POST` | `/books` | Ingest a book from JSON text (202, `pending`) |
//! | `POST` | `/books/{id}/upload` | Ingest raw bytes; `Content-Type` picks the extractor |
//! | `GET`  | `/books/{id}/status` | Poll ingestion status |
//! | `DELETE` | `/books/{id}` | Delete a book and its index entries |
//! | `POST` | `/chat` | One chat turn; the client supplies the history |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "book_not_found", "message": "book not found: b1" } }
//! ```
//!
//! Codes are the engine's error kinds (`malformed_input`, `book_not_found`,
//! `unsupported_format`, `provider_unavailable`, `timeout`, ...) plus
//! `bad_request` for request-shape problems.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use folio_core::models::{Book, IngestStatus, Visibility};
use folio_core::store::IndexStats;
use folio_core::Error;

use crate::app::App;
use crate::chat::{ChatRequest, ChatResponse};
use crate::extract::extract_text;

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(app: Arc<App>) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("Folio server listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");
    axum::serve(listener, router(app)).await?;
    Ok(())
}

/// Build the router over shared application state.
pub fn router(app: Arc<App>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/books", post(handle_create_book))
        .route("/books/{id}", axum::routing::delete(handle_delete_book))
        .route("/books/{id}/upload", post(handle_upload_book))
        .route("/books/{id}/status", get(handle_status))
        .route("/chat", post(handle_chat))
        .layer(cors)
        .with_state(app)
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

struct AppError {
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

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::MalformedInput(_)
            | Error::InsufficientEvidence { .. }
            | Error::EmptyFusionInput
            | Error::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::BookNotFound(_) => StatusCode::NOT_FOUND,
            Error::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::IndexUnavailable { .. } | Error::ProviderUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::ModelMismatch { .. }
            | Error::Cancelled
            | Error::InvalidTransition { .. }
            | Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &err {
            Error::IndexUnavailable { .. } | Error::ProviderUnavailable(_) => {
                format!("temporarily unavailable, try again: {}", err)
            }
            _ => err.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(kind = err.kind(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.kind().to_string(),
            message,
        }
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

async fn handle_stats(State(app): State<Arc<App>>) -> Result<Json<IndexStats>, AppError> {
    Ok(Json(app.index.stats().await?))
}

// ============ Books ============

#[derive(Deserialize)]
struct CreateBookRequest {
    #[serde(default)]
    id: Option<String>,
    title: String,
    #[serde(default)]
    author: String,
    text: String,
    #[serde(default)]
    visibility: Visibility,
    #[serde(default)]
    owner_id: Option<String>,
}

#[derive(Deserialize)]
struct UploadParams {
    title: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    visibility: Visibility,
    #[serde(default)]
    owner_id: Option<String>,
}

#[derive(Serialize)]
struct IngestAck {
    book_id: String,
    status: IngestStatus,
}

fn new_book(
    id: String,
    title: String,
    author: String,
    text: String,
    visibility: Visibility,
    owner_id: Option<String>,
) -> Book {
    Book {
        id,
        title,
        author,
        text,
        visibility,
        owner_id,
        chunk_ids: Vec::new(),
        character_ids: Vec::new(),
        created_at: chrono::Utc::now().timestamp(),
    }
}

async fn submit(app: &App, book: Book) -> Result<(StatusCode, Json<IngestAck>), AppError> {
    let book_id = book.id.clone();
    let (status, _handle) = app.ingest.submit(book).await?;
    Ok((StatusCode::ACCEPTED, Json(IngestAck { book_id, status })))
}

async fn handle_create_book(
    State(app): State<Arc<App>>,
    Json(req): Json<CreateBookRequest>,
) -> Result<(StatusCode, Json<IngestAck>), AppError> {
    if req.title.trim().is_empty() {
        return Err(bad_request("title must not be empty"));
    }
    let id = req
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let book = new_book(
        id,
        req.title,
        req.author,
        req.text,
        req.visibility,
        req.owner_id,
    );
    submit(&app, book).await
}

async fn handle_upload_book(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestAck>), AppError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| bad_request("Content-Type header is required"))?;
    let text = extract_text(&body, content_type)?;
    let book = new_book(
        id,
        params.title,
        params.author,
        text,
        params.visibility,
        params.owner_id,
    );
    submit(&app, book).await
}

async fn handle_status(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<IngestAck>, AppError> {
    let status = app.ingest.status(&id).await?;
    Ok(Json(IngestAck { book_id: id, status }))
}

#[derive(Serialize)]
struct DeleteResponse {
    book_id: String,
    deleted: bool,
}

async fn handle_delete_book(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    if !app.ingest.delete(&id).await? {
        return Err(Error::BookNotFound(id).into());
    }
    Ok(Json(DeleteResponse {
        book_id: id,
        deleted: true,
    }))
}

// ============ POST /chat ============

async fn handle_chat(
    State(app): State<Arc<App>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    Ok(Json(app.chat.chat_once(req).await?))
}
