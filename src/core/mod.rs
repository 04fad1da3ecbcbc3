//! Core chat components
//!
//! Session persistence and the orchestration of a chat turn.

mod chat;
mod store;

pub use chat::{ActiveSession, ChatError, ChatOrchestrator, ReplyStream};
pub use store::{SessionStore, StoreError, MAX_TITLE_CHARS};
