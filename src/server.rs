//! HTTP surface over the chat, ingestion, and retrieval services.
//!
//! Routes delegate straight to the service layer; all policy (validation,
//! retries, ownership checks) lives below this module. Errors map to
//! `{"error": {"code", "message"}}` bodies with status codes derived from
//! [`ChatError::code`].

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::embedding::OpenAiEmbedder;
use crate::error::ChatError;
use crate::ingest::{Ingestor, UploadMeta};
use crate::llm::OpenAiChatClient;
use crate::migrate;
use crate::models::{DocumentInfo, SessionSummary, Turn};
use crate::orchestrator::ChatService;
use crate::retrieval::Retriever;
use crate::store::ConversationStore;

/// Headroom on top of the configured file limit for multipart framing and
/// metadata fields.
const UPLOAD_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub ingestor: Ingestor,
    pub retriever: Retriever,
    /// Mirrors `ingest.max_file_bytes`; raises the framework body limit so
    /// oversize uploads reach the ingestor's own size check.
    pub max_upload_bytes: usize,
}

pub struct AppError(ChatError);

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            ChatError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::PartialFailure { .. } => StatusCode::BAD_GATEWAY,
            ChatError::Store(_) | ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("request failed: {}", err);
        }

        let body = Json(json!({
            "error": { "code": err.code(), "message": err.to_string() }
        }));

        if let ChatError::ServiceUnavailable {
            retry_after_secs, ..
        } = &err
        {
            let mut resp = (status, body).into_response();
            if let Ok(value) = retry_after_secs.to_string().parse() {
                resp.headers_mut().insert(header::RETRY_AFTER, value);
            }
            return resp;
        }

        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, AppError>;

#[derive(Deserialize)]
struct StartRequest {
    user_email: String,
}

#[derive(Deserialize)]
struct MessageRequest {
    session_id: String,
    user_email: String,
    message: String,
}

#[derive(Deserialize)]
struct HistoryRequest {
    session_id: String,
    user_email: String,
    cursor: Option<i64>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct UserQuery {
    user_email: String,
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    limit: Option<i64>,
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn chat_start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let session_id = state.chat.start_session(&req.user_email).await?;
    Ok(Json(json!({ "session_id": session_id })))
}

async fn chat_message(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> ApiResult<Json<Turn>> {
    let turn = state
        .chat
        .send_message(&req.session_id, &req.user_email, &req.message)
        .await?;
    Ok(Json(turn))
}

async fn chat_history(
    State(state): State<AppState>,
    Json(req): Json<HistoryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let (turns, next_cursor) = state
        .chat
        .get_history(&req.session_id, &req.user_email, req.cursor, req.limit)
        .await?;
    Ok(Json(json!({ "turns": turns, "next_cursor": next_cursor })))
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    let sessions = state.chat.list_conversations(&q.user_email).await?;
    Ok(Json(sessions))
}

async fn close_conversation(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(q): Query<UserQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .chat
        .close_conversation(&session_id, &q.user_email)
        .await?;
    Ok(Json(json!({ "closed": true })))
}

async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let mut filename = None;
    let mut bytes = None;
    let mut title = None;
    let mut department = String::from("general");
    let mut content_type = String::from("document");
    let mut uploaded_by = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ChatError::invalid(format!("malformed multipart body: {}", e)))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                filename = field.file_name().map(|s| s.to_string());
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ChatError::invalid(format!("failed to read file: {}", e)))?,
                );
            }
            "title" => title = Some(read_text_field(field).await?),
            "department" => department = read_text_field(field).await?,
            "content_type" => content_type = read_text_field(field).await?,
            "uploaded_by" => uploaded_by = read_text_field(field).await?,
            _ => {}
        }
    }

    let filename =
        filename.ok_or_else(|| ChatError::invalid("multipart field 'file' is required"))?;
    let bytes = bytes.ok_or_else(|| ChatError::invalid("multipart field 'file' is required"))?;
    let meta = UploadMeta {
        title: title.unwrap_or_else(|| filename.clone()),
        department,
        content_type,
        uploaded_by,
    };

    let report = state.ingestor.ingest(&filename, &bytes, &meta).await?;
    Ok(Json(json!({
        "document_id": report.document_id,
        "chunks_indexed": report.chunks_indexed,
    })))
}

async fn read_text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| AppError(ChatError::invalid(format!("bad multipart field: {}", e))))
}

async fn list_documents(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let documents = state.ingestor.list_documents().await?;
    Ok(Json(json!({ "documents": documents })))
}

async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> ApiResult<Json<DocumentInfo>> {
    Ok(Json(state.ingestor.get_document(&document_id).await?))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.ingestor.delete_document(&document_id).await?;
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Deserialize)]
struct RenameRequest {
    user_email: String,
    title: String,
}

async fn rename_conversation(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let title = state
        .chat
        .rename_conversation(&session_id, &req.user_email, &req.title)
        .await?;
    Ok(Json(json!({ "title": title })))
}

async fn search_documents(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let query = req.query.trim();
    if query.is_empty() {
        return Err(ChatError::invalid("query must not be empty").into());
    }
    let limit = req.limit.unwrap_or(state.retriever.top_k()).clamp(1, 50);
    let results = state.retriever.search(query, limit).await?;
    Ok(Json(json!({ "results": results })))
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes + UPLOAD_OVERHEAD_BYTES;
    Router::new()
        .route("/health", get(health))
        .route("/chat/start", post(chat_start))
        .route("/chat/message", post(chat_message))
        .route("/chat/history", post(chat_history))
        .route("/chat/conversations", get(list_conversations))
        .route("/chat/conversations/{session_id}", delete(close_conversation))
        .route(
            "/chat/conversations/{session_id}/title",
            put(rename_conversation),
        )
        .route("/documents/upload", post(upload_document))
        .route("/documents", get(list_documents))
        .route(
            "/documents/{document_id}",
            get(get_document).delete(delete_document),
        )
        .route("/documents/search", post(search_documents))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wire up the production services and serve until interrupted.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let embedder = Arc::new(OpenAiEmbedder::new(&config.embedding));
    let retriever = Retriever::new(pool.clone(), embedder, &config.retrieval);
    let store = ConversationStore::new(pool.clone());
    let llm = Arc::new(OpenAiChatClient::new(&config.llm));
    let chat = Arc::new(ChatService::new(
        store,
        retriever.clone(),
        llm,
        &config.chat,
        &config.llm,
    ));
    let ingestor = Ingestor::new(
        pool,
        retriever.clone(),
        &config.chunking,
        &config.embedding,
        &config.ingest,
    );

    let state = AppState {
        chat,
        ingestor,
        retriever,
        max_upload_bytes: config.ingest.max_file_bytes,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!("listening on {}", config.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}
