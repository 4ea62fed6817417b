use std::collections::HashMap;
use std::convert::Infallible;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use askama::Template;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cache::SharedCache;
use crate::config::AppConfig;
use crate::kb_client::KnowledgeBaseClient;
use crate::models::{
    AddSourceRequest, AddSourceResponse, ChatRequest, ChatResponse, HistoryResponse, IngestKind,
    SessionRequest, SessionResponse, UploadResponse,
};
use crate::session::SessionController;

/// A session's controller plus the storage directory backing its vector
/// collection. The `TempDir` guard keeps per-session storage alive until the
/// session is dropped.
struct SessionEntry {
    controller: SessionController,
    _storage: Option<TempDir>,
}

type SessionHandle = Arc<tokio::sync::Mutex<SessionEntry>>;

#[derive(Clone)]
struct AppState {
    config: AppConfig,
    cache: SharedCache,
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

pub async fn run_server(config: AppConfig, cache: SharedCache) -> Result<()> {
    let state = AppState {
        config,
        cache,
        sessions: Arc::new(Mutex::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/", get(index_page))
        .route("/api/session", post(create_session))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", get(chat_stream))
        .route("/api/upload", post(upload_pdfs))
        .route("/api/add", post(add_source))
        .route("/api/history/:session_id", get(get_history))
        .route("/api/reset", post(reset_session))
        .nest_service("/static", ServeDir::new("static"))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr: SocketAddr = state.config.bind_addr.parse()?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Registers a fresh app on the knowledge-base service and stores the new
/// session. Each session gets its own vector-store directory, temporary
/// unless one was configured.
async fn open_session(state: &AppState) -> Result<String> {
    let session_id = Uuid::new_v4().to_string();

    let (storage_path, storage_guard) = match &state.config.vector_store.dir {
        Some(dir) => {
            let path = dir.join(&session_id);
            tokio::fs::create_dir_all(&path).await?;
            (path, None)
        }
        None => {
            let tmp = tempfile::tempdir().context("failed to create session storage dir")?;
            (tmp.path().to_path_buf(), Some(tmp))
        }
    };

    let app =
        KnowledgeBaseClient::create(&state.config.kb_base_url, &state.config, &storage_path)
            .await?;

    let entry = SessionEntry {
        controller: SessionController::new(Arc::new(app), state.cache.clone()),
        _storage: storage_guard,
    };

    state
        .sessions
        .lock()
        .map_err(|_| anyhow::anyhow!("session map lock poisoned"))?
        .insert(session_id.clone(), Arc::new(tokio::sync::Mutex::new(entry)));

    Ok(session_id)
}

fn lookup_session(state: &AppState, session_id: &str) -> Result<SessionHandle, ApiError> {
    let sessions = state
        .sessions
        .lock()
        .map_err(|_| ApiError::from(anyhow::anyhow!("session map lock poisoned")))?;

    sessions
        .get(session_id)
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("session not found: {}", session_id)))
}

async fn index_page(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let session_id = open_session(&state).await.map_err(ApiError::from)?;

    let template = IndexTemplate { session_id };
    let body = template.render().map_err(ApiError::from)?;

    Ok(Html(body))
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    if request.reset.unwrap_or(false) {
        if let Some(session_id) = request.session_id {
            let session = lookup_session(&state, &session_id)?;
            session.lock().await.controller.reset();
            return Ok(Json(SessionResponse { session_id }));
        }
    }

    let session_id = open_session(&state).await?;
    Ok(Json(SessionResponse { session_id }))
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let session = lookup_session(&state, &request.session_id)?;
    let reply = session
        .lock()
        .await
        .controller
        .submit(&request.prompt, |_| {})
        .await;

    Ok(Json(ChatResponse { reply }))
}

#[derive(Debug, Deserialize)]
struct ChatStreamParams {
    session_id: String,
    prompt: String,
}

/// Progressive chat over SSE. Each `delta` event carries the full
/// accumulated text so the client can replace its placeholder in place; the
/// terminal `done` event carries the final rendered reply.
async fn chat_stream(
    State(state): State<AppState>,
    Query(params): Query<ChatStreamParams>,
) -> Result<Sse<UnboundedReceiverStream<Result<Event, Infallible>>>, ApiError> {
    let session = lookup_session(&state, &params.session_id)?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let progress = tx.clone();
        let reply = session
            .lock()
            .await
            .controller
            .submit(&params.prompt, move |partial: &str| {
                let _ = progress.send(Ok(Event::default().event("delta").data(partial)));
            })
            .await;

        let _ = tx.send(Ok(Event::default().event("done").data(reply)));
    });

    Ok(Sse::new(UnboundedReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    session_id: String,
}

async fn upload_pdfs(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let session = lookup_session(&state, &params.session_id)?;
    let mut messages = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?
    {
        let Some(file_name) = field.file_name().map(|name| name.to_string()) else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(err.to_string()))?;

        // Strip any client-supplied path components before using the name
        // as a temp-file prefix.
        let base_name = std::path::Path::new(&file_name)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.pdf".to_string());

        // The temp file is removed on drop, including when ingestion fails.
        let mut temp = tempfile::Builder::new()
            .prefix(&base_name)
            .suffix(".pdf")
            .tempfile()
            .map_err(|err| ApiError::from(anyhow::Error::from(err)))?;
        temp.write_all(&data)
            .map_err(|err| ApiError::from(anyhow::Error::from(err)))?;

        let temp_path = temp.path().display().to_string();
        let message = session
            .lock()
            .await
            .controller
            .ingest(&temp_path, &base_name, IngestKind::PdfFile)
            .await;
        messages.push(message);
    }

    Ok(Json(UploadResponse { messages }))
}

async fn add_source(
    State(state): State<AppState>,
    Json(request): Json<AddSourceRequest>,
) -> Result<Json<AddSourceResponse>, ApiError> {
    if request.kind == IngestKind::PdfFile {
        return Err(ApiError::bad_request(
            "PDF files must go through /api/upload".to_string(),
        ));
    }

    let session = lookup_session(&state, &request.session_id)?;
    let message = session
        .lock()
        .await
        .controller
        .ingest(&request.source, &request.source, request.kind)
        .await;

    Ok(Json(AddSourceResponse { message }))
}

async fn get_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let session = lookup_session(&state, &session_id)?;
    let turns = session.lock().await.controller.turns().to_vec();
    Ok(Json(HistoryResponse { turns }))
}

async fn reset_session(
    State(state): State<AppState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = request
        .session_id
        .ok_or_else(|| ApiError::bad_request("session_id is required".to_string()))?;

    let session = lookup_session(&state, &session_id)?;
    session.lock().await.controller.reset();

    Ok(Json(SessionResponse { session_id }))
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    session_id: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl From<askama::Error> for ApiError {
    fn from(value: askama::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
