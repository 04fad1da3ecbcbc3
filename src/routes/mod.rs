//! API routes
//!
//! The HTTP surface of the chat front-end. The server keeps one
//! [`UiState`]: the chat the user is working in and the document attached
//! to it. Handlers lock it for the duration of a turn so two requests
//! never interleave on the same session.

mod error;
mod page;

use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, Json,
    },
    routing::{get, post, put},
    Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ModelEntry, ModelRegistry};
use crate::conversation::{Role, Session, SessionSummary};
use crate::core::{ActiveSession, ChatError, ChatOrchestrator, MAX_TITLE_CHARS};
use crate::documents::{AttachedDocument, ContextSource, DocumentContext};
use crate::AppState;

pub use error::ApiError;

/// Largest accepted document upload
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

const UNTITLED: &str = "New Chat";

/// What the user is looking at
#[derive(Debug, Default)]
pub struct UiState {
    pub active: Option<ActiveSession>,
    pub document: Option<AttachedDocument>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<ModelEntry>,
    default: String,
    offline: bool,
}

/// A session as shown to the client
#[derive(Debug, Serialize)]
struct SessionView {
    #[serde(flatten)]
    session: Session,
    model_name: Option<String>,
    awaiting_reply: bool,
}

impl SessionView {
    fn new(active: &ActiveSession, models: &ModelRegistry) -> Self {
        Self {
            session: active.session().clone(),
            model_name: models.display_name(active.model_id()).map(str::to_string),
            awaiting_reply: active.awaiting_reply(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DocumentInfo {
    name: String,
    content_type: Option<String>,
    chars: usize,
}

impl From<&AttachedDocument> for DocumentInfo {
    fn from(document: &AttachedDocument) -> Self {
        Self {
            name: document.name.clone(),
            content_type: document.content_type.clone(),
            chars: document.char_count(),
        }
    }
}

#[derive(Debug, Serialize)]
struct UiStateResponse {
    session: Option<SessionView>,
    document: Option<DocumentInfo>,
}

#[derive(Debug, Serialize)]
struct TurnResponse {
    reply: String,
    session: SessionView,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateSessionRequest {
    pub title: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct SwitchModelRequest {
    pub model: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub name: String,
}

async fn index() -> Html<&'static str> {
    Html(page::INDEX_HTML)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_models(State(state): State<AppState>) -> Result<Json<ModelsResponse>, ApiError> {
    Ok(Json(ModelsResponse {
        models: state.chat.models().entries().to_vec(),
        default: state.chat.default_model().await?,
        offline: state.config.offline,
    }))
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(state.chat.store().list_sessions().await?))
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    let title = request
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| UNTITLED.to_string());

    let mut ui = state.ui.lock().await;
    let active = state
        .chat
        .new_session(&title, request.model.as_deref())
        .await?;

    let view = SessionView::new(&active, state.chat.models());
    ui.active = Some(active);
    ui.document = None;

    Ok((StatusCode::CREATED, Json(view)))
}

async fn open_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    let mut ui = state.ui.lock().await;
    let active = state.chat.load(id).await?;

    let view = SessionView::new(&active, state.chat.models());
    ui.active = Some(active);

    Ok(Json(view))
}

async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RenameRequest>,
) -> Result<StatusCode, ApiError> {
    let mut ui = state.ui.lock().await;
    state.chat.store().rename_session(id, &request.title).await?;

    if ui.active.as_ref().is_some_and(|a| a.id() == id) {
        ui.active = Some(state.chat.load(id).await?);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let mut ui = state.ui.lock().await;
    state.chat.store().delete_session(id).await?;

    if ui.active.as_ref().is_some_and(|a| a.id() == id) {
        ui.active = None;
        ui.document = None;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn current_state(State(state): State<AppState>) -> Json<UiStateResponse> {
    let ui = state.ui.lock().await;
    Json(UiStateResponse {
        session: ui
            .active
            .as_ref()
            .map(|a| SessionView::new(a, state.chat.models())),
        document: ui.document.as_ref().map(DocumentInfo::from),
    })
}

async fn switch_model(
    State(state): State<AppState>,
    Json(request): Json<SwitchModelRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let mut ui = state.ui.lock().await;
    let active = ui.active.as_mut().ok_or(ApiError::NoActiveSession)?;

    state.chat.switch_model(active, &request.model).await?;
    Ok(Json(SessionView::new(active, state.chat.models())))
}

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    validate_message(&request.message)?;

    let mut ui = state.ui.lock().await;
    let document = document_context(ui.document.as_ref(), &request.message).await?;
    let active = ensure_active(&state.chat, &mut ui.active, &request.message).await?;

    let reply = state
        .chat
        .send_user_message_with_cancel(active, &request.message, document.as_ref(), &state.shutdown)
        .await?;

    Ok(Json(TurnResponse {
        reply,
        session: SessionView::new(active, state.chat.models()),
    }))
}

/// Send a message and stream the reply as server-sent events.
///
/// Events: `chunk` carries `{"text": ...}`, `done` carries the updated
/// session, `error` carries the same body as an error response.
async fn stream_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    validate_message(&request.message)?;

    let mut ui = state.ui.clone().lock_owned().await;
    let document = document_context(ui.document.as_ref(), &request.message).await?;
    ensure_active(&state.chat, &mut ui.active, &request.message).await?;

    let chat = state.chat.clone();
    let stream = async_stream::stream! {
        let failure = match ui.active.as_mut() {
            Some(active) => {
                match chat.stream_user_message(active, &request.message, document.as_ref()).await {
                    Ok(mut replies) => {
                        let mut failure = None;
                        while let Some(chunk) = replies.next().await {
                            match chunk {
                                Ok(text) => {
                                    let data = serde_json::json!({ "text": text });
                                    yield Ok::<_, Infallible>(Event::default().event("chunk").data(data.to_string()));
                                }
                                Err(e) => {
                                    failure = Some(ApiError::from(e));
                                    break;
                                }
                            }
                        }
                        failure
                    }
                    Err(e) => Some(ApiError::from(e)),
                }
            }
            None => Some(ApiError::NoActiveSession),
        };

        match (failure, ui.active.as_ref()) {
            (Some(error), _) => {
                yield Ok(error_event(error));
            }
            (None, Some(active)) => {
                let view = SessionView::new(active, chat.models());
                let data = serde_json::to_string(&view).unwrap_or_default();
                yield Ok(Event::default().event("done").data(data));
            }
            (None, None) => {}
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn retry(State(state): State<AppState>) -> Result<Json<TurnResponse>, ApiError> {
    let mut ui = state.ui.lock().await;
    let ui = &mut *ui;
    let active = ui.active.as_mut().ok_or(ApiError::NoActiveSession)?;

    let query = active
        .messages()
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default();
    let document = document_context(ui.document.as_ref(), &query).await?;

    let reply = state.chat.retry(active, document.as_ref()).await?;
    Ok(Json(TurnResponse {
        reply,
        session: SessionView::new(active, state.chat.models()),
    }))
}

async fn attach_document(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DocumentInfo>, ApiError> {
    let name = params.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("document name must not be empty".into()));
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let max_chars = state.config.max_context_chars;

    let document = tokio::task::spawn_blocking(move || {
        AttachedDocument::from_upload(name, &body, content_type.as_deref(), max_chars)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("document extraction failed: {e}")))??;

    let info = DocumentInfo::from(&document);
    state.ui.lock().await.document = Some(document);
    Ok(Json(info))
}

async fn detach_document(State(state): State<AppState>) -> StatusCode {
    state.ui.lock().await.document = None;
    StatusCode::NO_CONTENT
}

fn validate_message(text: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ChatError::Invalid("message must not be empty".into()).into());
    }
    Ok(())
}

async fn document_context(
    document: Option<&AttachedDocument>,
    query: &str,
) -> Result<Option<DocumentContext>, ApiError> {
    let Some(document) = document else {
        return Ok(None);
    };

    let context = document.context_for(query).await?;
    tracing::debug!(document = document.name(), excerpts = context.excerpts.len(), "Document context added");
    Ok(Some(context))
}

/// The active session, starting one titled after `first_message` if needed
async fn ensure_active<'s>(
    chat: &ChatOrchestrator,
    slot: &'s mut Option<ActiveSession>,
    first_message: &str,
) -> Result<&'s mut ActiveSession, ApiError> {
    if slot.is_none() {
        let active = chat.new_session(&title_from(first_message), None).await?;
        tracing::info!(session = %active.id(), title = active.title(), "Started a chat for the first message");
        *slot = Some(active);
    }
    slot.as_mut().ok_or(ApiError::NoActiveSession)
}

fn title_from(message: &str) -> String {
    let title: String = message
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();

    if title.is_empty() {
        UNTITLED.to_string()
    } else {
        title
    }
}

fn error_event(error: ApiError) -> Event {
    let (_, body) = error.status_and_body();
    let data = serde_json::to_string(&body).unwrap_or_default();
    Event::default().event("error").data(data)
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/sessions", get(list_sessions).post(create_session))
        .route(
            "/v1/sessions/:id",
            get(open_session).patch(rename_session).delete(delete_session),
        )
        .route("/v1/session", get(current_state))
        .route("/v1/session/model", put(switch_model))
        .route("/v1/session/messages", post(send_message))
        .route("/v1/session/messages/stream", post(stream_message))
        .route("/v1/session/retry", post(retry))
        .route(
            "/v1/session/document",
            put(attach_document)
                .delete(detach_document)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
}
