//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/upload` | Store a document and start ingestion (202) |
//! | `GET`  | `/status/{document_id}` | Last committed processing snapshot |
//! | `POST` | `/documents/{document_id}/reprocess` | Re-run ingestion (202, 409 while in flight) |
//! | `POST` | `/chat` | Answer a question, optionally grounded in one document |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! Callers are already authenticated; the owner id arrives in the
//! `x-owner-id` header.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `processing_failed` (422), `upstream_error` (502), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use docchat_core::models::{Citation, StatusSnapshot};

use crate::app::DocChat;
use crate::composer::MAX_MESSAGE_CHARS;
use crate::config::Config;
use crate::error::Error;

const OWNER_HEADER: &str = "x-owner-id";
const FILE_NAME_HEADER: &str = "x-file-name";

/// Starts the HTTP server on `[server].bind` with config-built services.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let app = DocChat::from_config(config).await?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "docchat server listening");
    serve(app, listener).await
}

/// Serve `app` on an already-bound listener until the process ends.
pub async fn serve(app: DocChat, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    axum::serve(listener, router(app)).await?;
    Ok(())
}

pub fn router(app: DocChat) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    // Leave room for the size check to report a proper 400.
    let body_limit = usize::try_from(app.config.upload.max_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(1024);

    Router::new()
        .route("/upload", post(handle_upload))
        .route("/status/{document_id}", get(handle_status))
        .route(
            "/documents/{document_id}/reprocess",
            post(handle_reprocess),
        )
        .route("/chat", post(handle_chat))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
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
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

/// Converts into an Axum HTTP response.
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
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            Error::Processing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code: err.error_code().to_string(),
            message: err.user_message(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

fn owner_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| bad_request(format!("missing {} header", OWNER_HEADER)))
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

// ============ POST /upload ============

#[derive(Serialize)]
struct UploadResponse {
    document_id: String,
    status: String,
}

/// Raw document bytes in the body. `content-type` is checked against the
/// bytes; `x-file-name` becomes the display name.
async fn handle_upload(
    State(app): State<DocChat>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let owner = owner_id(&headers)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let file_name = headers
        .get(FILE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let doc = app
        .pipeline
        .upload(&owner, file_name, content_type, &body)
        .await?;
    app.pipeline.spawn_ingest(&doc, body.to_vec())?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            document_id: doc.id,
            status: doc.status.as_str().to_string(),
        }),
    ))
}

// ============ GET /status/{document_id} ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    document_id: String,
    processing_status: String,
    total_pages: u32,
    chunk_count: u32,
    is_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl From<StatusSnapshot> for StatusResponse {
    fn from(snap: StatusSnapshot) -> Self {
        Self {
            document_id: snap.document_id,
            processing_status: snap.status.as_str().to_string(),
            total_pages: snap.total_pages,
            chunk_count: snap.chunk_count,
            is_ready: snap.is_ready,
            error_message: snap.error_message,
        }
    }
}

async fn handle_status(
    State(app): State<DocChat>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, AppError> {
    let owner = owner_id(&headers)?;
    let snap = app.tracker.get_status(&document_id, &owner).await?;
    Ok(Json(snap.into()))
}

// ============ POST /documents/{document_id}/reprocess ============

async fn handle_reprocess(
    State(app): State<DocChat>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<StatusResponse>), AppError> {
    let owner = owner_id(&headers)?;
    let snap = app.pipeline.spawn_reprocess(&document_id, &owner).await?;
    Ok((StatusCode::ACCEPTED, Json(snap.into())))
}

// ============ POST /chat ============

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChatRequest {
    chat_id: String,
    message: String,
    #[serde(default)]
    document_id: Option<String>,
}

impl ChatRequest {
    fn validate(&self) -> Result<(), AppError> {
        if self.chat_id.trim().is_empty() {
            return Err(bad_request("chat_id must not be empty"));
        }
        if self.message.trim().is_empty() {
            return Err(bad_request("message must not be empty"));
        }
        if self.message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(bad_request(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        if matches!(&self.document_id, Some(id) if id.trim().is_empty()) {
            return Err(bad_request("document_id must not be empty when present"));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct CitationResponse {
    page: u32,
    snippet: String,
    chunk_index: i64,
    /// Cosine similarity as a 0–1 decimal.
    similarity_score: f32,
}

impl From<Citation> for CitationResponse {
    fn from(c: Citation) -> Self {
        Self {
            page: c.page,
            snippet: c.snippet,
            chunk_index: c.chunk_index,
            similarity_score: c.similarity.clamp(0.0, 1.0),
        }
    }
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
    citations: Vec<CitationResponse>,
}

async fn handle_chat(
    State(app): State<DocChat>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    let owner = owner_id(&headers)?;
    let Json(req) = payload?;
    req.validate()?;

    let answer = app
        .composer
        .answer(&req.chat_id, &owner, &req.message, req.document_id.as_deref())
        .await?;

    Ok(Json(ChatResponse {
        answer: answer.text,
        citations: answer.citations.into_iter().map(Into::into).collect(),
    }))
}
