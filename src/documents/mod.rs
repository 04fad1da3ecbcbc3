//! Document context for prompts
//!
//! An uploaded file becomes a [`ContextSource`]. Before each turn the
//! orchestrator's caller asks the source for a [`DocumentContext`] relevant
//! to the user's message and passes it along; the context is rendered into
//! a system message ahead of the history.
//!
//! [`AttachedDocument`] hands back the whole (clipped) text. Ranked
//! retrieval over embeddings belongs to an external pipeline and plugs in
//! by implementing the same trait.

mod extract;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::conversation::Message;

pub use extract::extract_text;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("DOCX extraction failed: {0}")]
    Docx(String),

    #[error("The document appears to be empty or unreadable")]
    Empty,
}

/// Excerpts of a document to merge into a prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentContext {
    /// Name of the document the excerpts come from
    pub source: String,
    pub excerpts: Vec<String>,
}

impl DocumentContext {
    pub fn new(source: impl Into<String>, excerpts: Vec<String>) -> Self {
        Self {
            source: source.into(),
            excerpts,
        }
    }

    /// Render as the system message that leads the prompt
    pub fn to_system_message(&self) -> Message {
        let body = self.excerpts.join("\n\n---\n\n");
        Message::system(format!(
            "The user has shared the document \"{}\". Use the following content from it \
             as context when answering.\n\n{}",
            self.source, body
        ))
    }
}

/// Something that can supply prompt context for a user query
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Name shown to the user and recorded on messages
    fn name(&self) -> &str;

    async fn context_for(&self, query: &str) -> Result<DocumentContext, DocumentError>;
}

/// A document uploaded for the active chat, kept as extracted text
#[derive(Debug, Clone, Serialize)]
pub struct AttachedDocument {
    pub name: String,
    pub content_type: Option<String>,
    #[serde(skip)]
    text: String,
    #[serde(skip)]
    max_chars: usize,
}

impl AttachedDocument {
    /// Extract the text of an uploaded file
    pub fn from_upload(
        name: impl Into<String>,
        bytes: &[u8],
        content_type: Option<&str>,
        max_chars: usize,
    ) -> Result<Self, DocumentError> {
        let name = name.into();
        let text = extract_text(bytes, content_type, &name)?;
        tracing::info!(document = %name, chars = text.chars().count(), "Document attached");

        Ok(Self {
            name,
            content_type: content_type.map(str::to_string),
            text,
            max_chars,
        })
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    /// The text as it will appear in prompts
    fn clipped_text(&self) -> String {
        if self.char_count() <= self.max_chars {
            return self.text.clone();
        }
        let mut clipped: String = self.text.chars().take(self.max_chars).collect();
        clipped.push_str("\n[document truncated]");
        clipped
    }
}

#[async_trait]
impl ContextSource for AttachedDocument {
    fn name(&self) -> &str {
        &self.name
    }

    async fn context_for(&self, _query: &str) -> Result<DocumentContext, DocumentError> {
        Ok(DocumentContext::new(self.name.clone(), vec![self.clipped_text()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;

    #[tokio::test]
    async fn test_attached_document_returns_whole_text() {
        let doc = AttachedDocument::from_upload("notes.txt", b"line one\nline two", Some("text/plain"), 1000)
            .unwrap();

        let context = doc.context_for("anything").await.unwrap();
        assert_eq!(context.source, "notes.txt");
        assert_eq!(context.excerpts, vec!["line one\nline two".to_string()]);
    }

    #[tokio::test]
    async fn test_long_documents_are_clipped() {
        let doc = AttachedDocument::from_upload("big.txt", "ä".repeat(50).as_bytes(), None, 10).unwrap();
        assert_eq!(doc.char_count(), 50);

        let context = doc.context_for("q").await.unwrap();
        assert!(context.excerpts[0].starts_with(&"ä".repeat(10)));
        assert!(context.excerpts[0].ends_with("[document truncated]"));
    }

    #[test]
    fn test_context_renders_as_system_message() {
        let context = DocumentContext::new(
            "handbook.pdf",
            vec!["first excerpt".into(), "second excerpt".into()],
        );
        let message = context.to_system_message();

        assert_eq!(message.role, Role::System);
        assert!(message.content.contains("\"handbook.pdf\""));
        assert!(message.content.contains("first excerpt\n\n---\n\nsecond excerpt"));
    }

    #[test]
    fn test_rejects_unreadable_upload() {
        let err = AttachedDocument::from_upload("empty.txt", b"", Some("text/plain"), 100).unwrap_err();
        assert!(matches!(err, DocumentError::Empty));
    }
}
