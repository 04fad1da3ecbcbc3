//! Chat orchestration
//!
//! The [`ChatOrchestrator`] carries no conversation state of its own. Each
//! interaction takes the [`ActiveSession`] it works on, which is the
//! in-memory copy of one stored session. A turn:
//! 1. Persists the user message (the commit point for the turn)
//! 2. Builds the prompt: optional document context, then the full history
//! 3. Calls the model runtime
//! 4. Persists the assistant reply, tagged with the model that wrote it
//!
//! If step 3 fails the user message stays stored and the session is left
//! awaiting a reply, which [`ChatOrchestrator::retry`] can answer later.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ModelRegistry;
use crate::conversation::{Message, Role, Session};
use crate::documents::DocumentContext;
use crate::providers::{ModelRuntime, ProviderError};

use super::store::{SessionStore, StoreError};

/// Reply fragments from a streamed turn
pub type ReplyStream<'a> = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send + 'a>>;

/// Errors from the chat orchestrator
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Session not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Storage error: {0}")]
    Storage(StoreError),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(#[from] ProviderError),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Request cancelled before the model replied")]
    Cancelled,

    #[error("The last message already has a reply")]
    NothingToRetry,
}

impl From<StoreError> for ChatError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => ChatError::NotFound(id),
            StoreError::Invalid(msg) => ChatError::Invalid(msg),
            other => ChatError::Storage(other),
        }
    }
}

/// The session the user is currently working in
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSession {
    #[serde(flatten)]
    session: Session,
}

impl ActiveSession {
    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn title(&self) -> &str {
        &self.session.title
    }

    pub fn model_id(&self) -> &str {
        &self.session.model_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.session.messages
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// True when the last stored message is a user turn with no reply yet
    pub fn awaiting_reply(&self) -> bool {
        self.session
            .messages
            .last()
            .is_some_and(|m| m.role == Role::User)
    }

    fn push(&mut self, message: Message) {
        self.session.updated_at = message.created_at;
        self.session.messages.push(message);
    }
}

impl From<Session> for ActiveSession {
    fn from(session: Session) -> Self {
        Self { session }
    }
}

/// Mediates between user input, the session store and the model runtime
pub struct ChatOrchestrator {
    store: Arc<SessionStore>,
    runtime: Arc<dyn ModelRuntime>,
    models: ModelRegistry,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        runtime: Arc<dyn ModelRuntime>,
        models: ModelRegistry,
    ) -> Self {
        Self {
            store,
            runtime,
            models,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Model for new chats: the last one the user picked, if still known
    pub async fn default_model(&self) -> Result<String, ChatError> {
        let stored = self.store.default_model().await?;
        Ok(stored
            .filter(|id| self.models.contains(id))
            .unwrap_or_else(|| self.models.default_id().to_string()))
    }

    /// Start a new, empty session
    pub async fn new_session(
        &self,
        title: &str,
        model: Option<&str>,
    ) -> Result<ActiveSession, ChatError> {
        let model_id = match model {
            Some(name_or_id) => {
                let model_id = self.resolve_model(name_or_id)?.to_string();
                self.store.set_default_model(&model_id).await?;
                model_id
            }
            None => self.default_model().await?,
        };

        let id = self.store.create_session(title, &model_id).await?;
        self.load(id).await
    }

    /// Replace the working copy with a stored session
    pub async fn load(&self, session_id: Uuid) -> Result<ActiveSession, ChatError> {
        let session = self.store.load_session(session_id).await?;
        tracing::debug!(session = %session_id, messages = session.messages.len(), "Session loaded");
        Ok(ActiveSession::from(session))
    }

    /// Use a different model for the following turns of this session
    pub async fn switch_model(
        &self,
        active: &mut ActiveSession,
        model: &str,
    ) -> Result<(), ChatError> {
        let model_id = self.resolve_model(model)?.to_string();

        self.store.set_session_model(active.id(), &model_id).await?;

        tracing::info!(
            session = %active.id(),
            from = active.model_id(),
            to = %model_id,
            "Model switched"
        );
        active.session.model_id = model_id;
        Ok(())
    }

    /// Send a message and wait for the complete reply
    pub async fn send_user_message(
        &self,
        active: &mut ActiveSession,
        text: &str,
        document: Option<&DocumentContext>,
    ) -> Result<String, ChatError> {
        self.send_user_message_with_cancel(active, text, document, &CancellationToken::new())
            .await
    }

    /// Like [`send_user_message`](Self::send_user_message), but gives up
    /// waiting for the model once `cancel` fires
    pub async fn send_user_message_with_cancel(
        &self,
        active: &mut ActiveSession,
        text: &str,
        document: Option<&DocumentContext>,
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        let prompt = self.commit_user_message(active, text, document).await?;
        self.complete(active, prompt, cancel).await
    }

    /// Ask the model again for a session left awaiting a reply
    pub async fn retry(
        &self,
        active: &mut ActiveSession,
        document: Option<&DocumentContext>,
    ) -> Result<String, ChatError> {
        if !active.awaiting_reply() {
            return Err(ChatError::NothingToRetry);
        }

        let prompt = build_prompt(active.messages(), document);
        self.complete(active, prompt, &CancellationToken::new()).await
    }

    /// Send a message and receive the reply as it is generated.
    ///
    /// The user message is stored before this returns. The assistant
    /// message is stored once the stream has been read to the end; a
    /// stream dropped early leaves the session awaiting a reply.
    pub async fn stream_user_message<'a>(
        &'a self,
        active: &'a mut ActiveSession,
        text: &str,
        document: Option<&DocumentContext>,
    ) -> Result<ReplyStream<'a>, ChatError> {
        let prompt = self.commit_user_message(active, text, document).await?;
        let model = active.model_id().to_string();

        let mut chunks = self
            .runtime
            .chat_stream(&model, &prompt)
            .await
            .map_err(|e| self.unavailable(&model, e))?;

        let stream = async_stream::try_stream! {
            let mut reply = String::new();

            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(|e| self.unavailable(&model, e))?;
                reply.push_str(&chunk);
                yield chunk;
            }

            if reply.trim().is_empty() {
                Err::<(), _>(self.unavailable(
                    &model,
                    ProviderError::InvalidResponse("empty reply".into()),
                ))?;
            }

            self.commit_assistant(active, reply, &model).await?;
        };

        Ok(Box::pin(stream))
    }

    fn resolve_model<'m>(&'m self, name_or_id: &'m str) -> Result<&'m str, ChatError> {
        self.models
            .resolve(name_or_id)
            .ok_or_else(|| ChatError::UnknownModel(name_or_id.to_string()))
    }

    async fn commit_user_message(
        &self,
        active: &mut ActiveSession,
        text: &str,
        document: Option<&DocumentContext>,
    ) -> Result<Vec<Message>, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::Invalid("message must not be empty".into()));
        }

        let message = Message::user(text).with_document(document.map(|d| d.source.as_str()));
        self.store.append_message(active.id(), &message).await?;
        active.push(message);

        Ok(build_prompt(active.messages(), document))
    }

    async fn complete(
        &self,
        active: &mut ActiveSession,
        prompt: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<String, ChatError> {
        let model = active.model_id().to_string();
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(session = %active.id(), "Chat request cancelled");
                return Err(ChatError::Cancelled);
            }
            result = self.runtime.chat(&model, &prompt) => result,
        };

        let reply = result.map_err(|e| self.unavailable(&model, e))?;
        if reply.trim().is_empty() {
            return Err(self.unavailable(
                &model,
                ProviderError::InvalidResponse("empty reply".into()),
            ));
        }

        tracing::info!(
            session = %active.id(),
            model = %model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Reply received"
        );

        self.commit_assistant(active, reply.clone(), &model).await?;
        Ok(reply)
    }

    async fn commit_assistant(
        &self,
        active: &mut ActiveSession,
        content: String,
        model: &str,
    ) -> Result<(), ChatError> {
        let message = Message::assistant(content, model);
        self.store.append_message(active.id(), &message).await?;
        active.push(message);
        Ok(())
    }

    fn unavailable(&self, model: &str, error: ProviderError) -> ChatError {
        tracing::error!(runtime = self.runtime.name(), model, "Model runtime error: {}", error);
        ChatError::ModelUnavailable(error)
    }
}

/// Document context (if any) followed by the whole history
fn build_prompt(history: &[Message], document: Option<&DocumentContext>) -> Vec<Message> {
    let mut prompt = Vec::with_capacity(history.len() + 1);
    if let Some(document) = document {
        prompt.push(document.to_system_message());
    }
    prompt.extend(history.iter().cloned());
    prompt
}
