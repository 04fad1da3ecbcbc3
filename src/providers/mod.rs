//! Model runtime integrations

mod ollama;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::config::Config;
use crate::conversation::Message;

pub use ollama::OllamaProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Request failed: {0}")]
    RequestFailed(reqwest::Error),

    #[error("Model runtime did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Incremental response text from a streaming chat call
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// A text-generation backend.
///
/// The runtime is stateless across calls: every request carries the
/// model identifier and the complete message history.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Generate a full reply in one response
    async fn chat(&self, model: &str, messages: &[Message]) -> Result<String, ProviderError>;

    /// Generate a reply as a sequence of text fragments
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[Message],
    ) -> Result<ChunkStream, ProviderError>;
}

/// Build the runtime selected by the configuration
pub fn from_config(config: &Config) -> Result<Arc<dyn ModelRuntime>, ProviderError> {
    match config.provider.to_lowercase().as_str() {
        "ollama" => {
            let provider = OllamaProvider::new(config.ollama_url.clone(), config.request_timeout)?;
            Ok(Arc::new(provider))
        }
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}
