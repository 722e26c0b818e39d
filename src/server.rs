//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/chat` | Answer one question, JSON reply |
//! | `POST` | `/chat/stream` | Answer one question as server-sent events |
//! | `POST` | `/index/chunks` | Index a source's text chunks |
//! | `DELETE` | `/index/sources/{source_id}` | Remove a source from a scope |
//! | `GET`  | `/sources` | Sources visible to a scope |
//! | `POST` | `/conversations/{id}/attachments` | Record a file attached to a conversation |
//! | `GET`  | `/messages/{id}` | Fetch a persisted message |
//!
//! Every request names its tenant scope with `user_id` plus exactly one of
//! `bot_id` or `study_space_id` (JSON body fields, or query parameters for
//! `GET` and `DELETE`).
//!
//! Errors use one shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `generation_failed` (502),
//! `internal` (500).
//!
//! The stream emits one SSE event per [`ChatEvent`], named after its `type`
//! (`start`, `chunk`, `end`, `error`) with the event as JSON data.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use botmind_core::models::{Scope, SourceSummary};

use crate::config::Config;
use crate::context::BotProfile;
use crate::error::TurnError;
use crate::messages::StoredMessage;
use crate::pipeline::{self, ChatPipeline, TurnReply, TurnRequest};
use crate::stream::ChatEvent;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<ChatPipeline>,
}

/// Serve the API on `[server].bind` until the process is stopped.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let (pipeline, _worker) = pipeline::open(config).await?;
    let app = router(Arc::new(pipeline));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "botmind listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Routes over an existing pipeline.
pub fn router(pipeline: Arc<ChatPipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/chat", post(handle_chat))
        .route("/chat/stream", post(handle_chat_stream))
        .route("/index/chunks", post(handle_index_chunks))
        .route("/index/sources/{source_id}", delete(handle_delete_source))
        .route("/sources", get(handle_sources))
        .route("/conversations/{id}/attachments", post(handle_attach))
        .route("/messages/{id}", get(handle_get_message))
        .layer(cors)
        .with_state(AppState { pipeline })
}

// ============ Errors ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

impl From<TurnError> for AppError {
    fn from(err: TurnError) -> Self {
        match err {
            TurnError::Generation(e) => AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "generation_failed",
                message: e.to_string(),
            },
            TurnError::Persist(e) => internal(e),
        }
    }
}

// ============ Scope ============

#[derive(Debug, Clone, Deserialize)]
struct ScopeParams {
    user_id: i64,
    #[serde(default)]
    bot_id: Option<i64>,
    #[serde(default)]
    study_space_id: Option<i64>,
}

impl ScopeParams {
    fn scope(&self) -> Result<Scope, AppError> {
        match (self.bot_id, self.study_space_id) {
            (Some(bot), None) => Ok(Scope::bot(self.user_id, bot)),
            (None, Some(space)) => Ok(Scope::study_space(self.user_id, space)),
            _ => Err(bad_request(
                "exactly one of bot_id or study_space_id is required",
            )),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /chat, /chat/stream ============

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(flatten)]
    scope: ScopeParams,
    conversation_id: String,
    question: String,
    #[serde(default)]
    turn_id: Option<String>,
    /// Bot settings for this turn; a strict profile when omitted.
    #[serde(default)]
    bot: Option<BotProfile>,
}

impl ChatRequest {
    fn into_turn(self) -> Result<(BotProfile, TurnRequest), AppError> {
        let scope = self.scope.scope()?;
        if self.question.trim().is_empty() {
            return Err(bad_request("question must not be empty"));
        }
        if self.conversation_id.trim().is_empty() {
            return Err(bad_request("conversation_id must not be empty"));
        }
        let bot = self
            .bot
            .unwrap_or_else(|| BotProfile::strict("Assistant"));
        Ok((
            bot,
            TurnRequest {
                scope,
                conversation_id: self.conversation_id,
                question: self.question,
                turn_id: self.turn_id,
            },
        ))
    }
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<TurnReply>, AppError> {
    let (bot, turn) = req.into_turn()?;
    let reply = state.pipeline.respond(&bot, turn).await?;
    Ok(Json(reply))
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, AppError> {
    let (bot, turn) = req.into_turn()?;
    let (tx, mut rx) = mpsc::channel::<ChatEvent>(32);

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        pipeline.respond_stream(&bot, turn, tx).await;
    });

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let name = event_name(&event);
            yield Ok(Event::default()
                .event(name)
                .json_data(&event)
                .unwrap_or_else(|_| Event::default().event(name).data("{}")));
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn event_name(event: &ChatEvent) -> &'static str {
    match event {
        ChatEvent::Start { .. } => "start",
        ChatEvent::Chunk { .. } => "chunk",
        ChatEvent::End { .. } => "end",
        ChatEvent::Error { .. } => "error",
    }
}

// ============ Index management ============

#[derive(Debug, Deserialize)]
struct IndexChunksRequest {
    #[serde(flatten)]
    scope: ScopeParams,
    source_id: String,
    source_name: String,
    chunks: Vec<String>,
}

#[derive(Serialize)]
struct IndexChunksResponse {
    source_id: String,
    chunks: usize,
}

async fn handle_index_chunks(
    State(state): State<AppState>,
    Json(req): Json<IndexChunksRequest>,
) -> Result<Json<IndexChunksResponse>, AppError> {
    let scope = req.scope.scope()?;
    if req.source_id.trim().is_empty() {
        return Err(bad_request("source_id must not be empty"));
    }
    if req.chunks.iter().all(|c| c.trim().is_empty()) {
        return Err(bad_request("chunks must contain text"));
    }
    let written = state
        .pipeline
        .knowledge()
        .add_document_chunks(&scope, &req.source_id, &req.source_name, &req.chunks)
        .await
        .map_err(internal)?;
    Ok(Json(IndexChunksResponse {
        source_id: req.source_id,
        chunks: written,
    }))
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: usize,
}

async fn handle_delete_source(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    Query(params): Query<ScopeParams>,
) -> Result<Json<DeleteResponse>, AppError> {
    let scope = params.scope()?;
    let deleted = state
        .pipeline
        .knowledge()
        .delete_source(&scope, &source_id)
        .await
        .map_err(internal)?;
    if deleted == 0 {
        return Err(not_found(format!("no source '{}' in {}", source_id, scope)));
    }
    Ok(Json(DeleteResponse { deleted }))
}

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<SourceSummary>,
}

async fn handle_sources(
    State(state): State<AppState>,
    Query(params): Query<ScopeParams>,
) -> Result<Json<SourcesResponse>, AppError> {
    let scope = params.scope()?;
    let sources = state
        .pipeline
        .knowledge()
        .list_sources(&scope)
        .await
        .map_err(internal)?;
    Ok(Json(SourcesResponse { sources }))
}

// ============ Conversations and messages ============

#[derive(Debug, Deserialize)]
struct AttachRequest {
    source_id: String,
    source_name: String,
}

async fn handle_attach(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<AttachRequest>,
) -> Result<StatusCode, AppError> {
    if req.source_id.trim().is_empty() {
        return Err(bad_request("source_id must not be empty"));
    }
    state
        .pipeline
        .messages()
        .add_attachment(&conversation_id, &req.source_id, &req.source_name)
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_get_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StoredMessage>, AppError> {
    state
        .pipeline
        .messages()
        .get(&id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found(format!("no message with id: {}", id)))
}
