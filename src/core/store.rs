//! Chat session storage using SQLite
//!
//! Sessions own an ordered message history. Message order is the
//! autoincrement row id; session recency is a monotonically increasing
//! `activity` counter bumped on every write to the session.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::conversation::{Message, Role, Session, SessionSummary};

const DEFAULT_MODEL_KEY: &str = "default_model";

/// Longest accepted session title, in characters
pub const MAX_TITLE_CHARS: usize = 50;

/// Errors from the session store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Durable store for chat sessions and their messages
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Open (or create) the store at the given SQLite database path
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(sqlx::Error::Io)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        tracing::info!(path = %db_path.display(), "Session store opened");
        Ok(store)
    }

    /// Create an in-memory store for testing
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // A single connection that never expires keeps the database alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Initialize the database schema
    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                model_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                activity INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                document TEXT,
                model TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a new, empty session and return its id
    pub async fn create_session(&self, title: &str, model_id: &str) -> Result<Uuid, StoreError> {
        let title = checked_title(title)?;
        if model_id.trim().is_empty() {
            return Err(StoreError::Invalid("model id must not be empty".into()));
        }

        let id = Uuid::new_v4();
        let now = timestamp(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO sessions (id, title, model_id, created_at, updated_at, activity)
            VALUES (?, ?, ?, ?, ?, (SELECT COALESCE(MAX(activity), 0) + 1 FROM sessions))
            "#,
        )
        .bind(id.to_string())
        .bind(title)
        .bind(model_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        tracing::info!(session = %id, title, model = model_id, "Session created");
        Ok(id)
    }

    /// Append a message to the end of a session's history
    ///
    /// Either both the message row and the session's recency are written,
    /// or nothing is.
    pub async fn append_message(
        &self,
        session_id: Uuid,
        message: &Message,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            r#"
            UPDATE sessions
            SET updated_at = ?,
                activity = (SELECT COALESCE(MAX(activity), 0) + 1 FROM sessions)
            WHERE id = ?
            "#,
        )
        .bind(timestamp(Utc::now()))
        .bind(session_id.to_string())
        .execute(&mut *tx)
        .await?;

        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound(session_id));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO messages (session_id, role, content, document, model, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.document.as_deref())
        .bind(message.model.as_deref())
        .bind(timestamp(message.created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(session = %session_id, role = %message.role, "Message appended");
        Ok(result.last_insert_rowid())
    }

    /// Load a session with its messages in insertion order
    pub async fn load_session(&self, session_id: Uuid) -> Result<Session, StoreError> {
        let row: Option<(String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT title, model_id, created_at, updated_at
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some((title, model_id, created_at, updated_at)) = row else {
            return Err(StoreError::NotFound(session_id));
        };

        let rows: Vec<(String, String, Option<String>, Option<String>, String)> = sqlx::query_as(
            r#"
            SELECT role, content, document, model, created_at
            FROM messages
            WHERE session_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .map(|(role, content, document, model, created_at)| {
                Ok(Message {
                    role: role.parse::<Role>().map_err(StoreError::Corrupt)?,
                    content,
                    document,
                    model,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Session {
            id: session_id,
            title,
            model_id,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            messages,
        })
    }

    /// List all sessions, most recently active first
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let rows: Vec<(String, String, String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT s.id, s.title, s.model_id, s.created_at, s.updated_at, COUNT(m.id)
            FROM sessions s
            LEFT JOIN messages m ON m.session_id = s.id
            GROUP BY s.id
            ORDER BY s.activity DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, title, model_id, created_at, updated_at, message_count)| {
                    Ok(SessionSummary {
                        id: parse_id(&id)?,
                        title,
                        model_id,
                        created_at: parse_timestamp(&created_at)?,
                        updated_at: parse_timestamp(&updated_at)?,
                        message_count,
                    })
                },
            )
            .collect()
    }

    /// Delete a session and all its messages
    ///
    /// Deleting an id that does not exist is reported as `NotFound`.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id.to_string())
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound(session_id));
        }

        tx.commit().await?;
        tracing::info!(session = %session_id, "Session deleted");
        Ok(())
    }

    /// Change the model used for later turns of a session and remember it
    /// as the default for new chats
    ///
    /// Both writes land together or not at all.
    pub async fn set_session_model(&self, session_id: Uuid, model_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        upsert_default_model(&mut tx, model_id).await?;
        if let Err(e) = update_session_model(&mut tx, session_id, model_id).await {
            tx.rollback().await?;
            return Err(e);
        }

        tx.commit().await?;
        Ok(())
    }

    /// Give a session a new title
    pub async fn rename_session(&self, session_id: Uuid, title: &str) -> Result<(), StoreError> {
        let title = checked_title(title)?;

        let result = sqlx::query("UPDATE sessions SET title = ? WHERE id = ?")
            .bind(title)
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(session_id));
        }
        Ok(())
    }

    /// Model preselected for new chats, if one has been chosen before
    pub async fn default_model(&self) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(DEFAULT_MODEL_KEY)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    pub async fn set_default_model(&self, model_id: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_default_model(&mut conn, model_id).await
    }
}

async fn update_session_model(
    conn: &mut SqliteConnection,
    session_id: Uuid,
    model_id: &str,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET model_id = ?,
            updated_at = ?,
            activity = (SELECT COALESCE(MAX(activity), 0) + 1 FROM sessions)
        WHERE id = ?
        "#,
    )
    .bind(model_id)
    .bind(timestamp(Utc::now()))
    .bind(session_id.to_string())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(session_id));
    }
    Ok(())
}

async fn upsert_default_model(conn: &mut SqliteConnection, model_id: &str) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(DEFAULT_MODEL_KEY)
    .bind(model_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Trimmed title, if it is neither blank nor too long
fn checked_title(title: &str) -> Result<&str, StoreError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(StoreError::Invalid("session title must not be empty".into()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(StoreError::Invalid(format!(
            "session title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(title)
}

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{s}': {e}")))
}

fn parse_id(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("invalid session id '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SessionStore {
        SessionStore::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_create_then_load_is_empty() {
        let store = store().await;

        let id = store.create_session("Demo", "llama3.1").await.unwrap();
        let session = store.load_session(id).await.unwrap();

        assert_eq!(session.id, id);
        assert_eq!(session.title, "Demo");
        assert_eq!(session.model_id, "llama3.1");
        assert!(session.messages.is_empty());
    }

    #[tokio::test]
    async fn test_messages_load_in_append_order() {
        let store = store().await;
        let id = store.create_session("Order", "llama3.1").await.unwrap();

        let contents: Vec<String> = (0..12).map(|i| format!("message {i}")).collect();
        for (i, content) in contents.iter().enumerate() {
            let message = if i % 2 == 0 {
                Message::user(content.clone())
            } else {
                Message::assistant(content.clone(), "llama3.1")
            };
            store.append_message(id, &message).await.unwrap();
        }

        let session = store.load_session(id).await.unwrap();
        let loaded: Vec<String> = session.messages.iter().map(|m| m.content.clone()).collect();
        assert_eq!(loaded, contents);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert_eq!(session.messages[1].model.as_deref(), Some("llama3.1"));
    }

    #[tokio::test]
    async fn test_append_to_missing_session_writes_nothing() {
        let store = store().await;
        let missing = Uuid::new_v4();

        let err = store
            .append_message(missing, &Message::user("lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == missing));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_delete_cascades_and_then_not_found() {
        let store = store().await;
        let id = store.create_session("Doomed", "gemma2").await.unwrap();
        store.append_message(id, &Message::user("bye")).await.unwrap();

        store.delete_session(id).await.unwrap();

        assert!(matches!(
            store.load_session(id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_session(id).await,
            Err(StoreError::NotFound(_))
        ));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE session_id = ?")
            .bind(id.to_string())
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_list_sessions_by_recency() {
        let store = store().await;
        let first = store.create_session("First", "llama3.1").await.unwrap();
        let second = store.create_session("Second", "gemma2").await.unwrap();

        let listed = store.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second);

        store.append_message(first, &Message::user("bump")).await.unwrap();

        let listed = store.list_sessions().await.unwrap();
        assert_eq!(listed[0].id, first);
        assert_eq!(listed[0].message_count, 1);
        assert_eq!(listed[1].id, second);
        assert_eq!(listed[1].message_count, 0);
    }

    #[tokio::test]
    async fn test_rejects_blank_title() {
        let store = store().await;
        assert!(matches!(
            store.create_session("   ", "llama3.1").await,
            Err(StoreError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_model_and_title_updates_on_missing_session() {
        let store = store().await;
        let missing = Uuid::new_v4();

        assert!(matches!(
            store.set_session_model(missing, "gemma2").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.rename_session(missing, "New name").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_session_model_keeps_message_models() {
        let store = store().await;
        let id = store.create_session("Switch", "llama3.1").await.unwrap();
        store
            .append_message(id, &Message::assistant("old reply", "llama3.1"))
            .await
            .unwrap();

        store.set_session_model(id, "gemma2").await.unwrap();
        store.rename_session(id, "Switched").await.unwrap();

        let session = store.load_session(id).await.unwrap();
        assert_eq!(session.model_id, "gemma2");
        assert_eq!(session.title, "Switched");
        assert_eq!(session.messages[0].model.as_deref(), Some("llama3.1"));
    }

    #[tokio::test]
    async fn test_title_length_limit() {
        let store = store().await;
        let longest = "t".repeat(MAX_TITLE_CHARS);

        let id = store.create_session(&longest, "llama3.1").await.unwrap();
        assert_eq!(store.load_session(id).await.unwrap().title, longest);

        let too_long = "é".repeat(MAX_TITLE_CHARS + 1);
        assert!(matches!(
            store.create_session(&too_long, "llama3.1").await,
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            store.rename_session(id, &too_long).await,
            Err(StoreError::Invalid(_))
        ));
        assert_eq!(store.load_session(id).await.unwrap().title, longest);
    }

    #[tokio::test]
    async fn test_set_session_model_is_all_or_nothing() {
        let store = store().await;
        let id = store.create_session("Switch", "llama3.1").await.unwrap();

        store.set_session_model(id, "gemma2").await.unwrap();
        assert_eq!(store.load_session(id).await.unwrap().model_id, "gemma2");
        assert_eq!(store.default_model().await.unwrap().as_deref(), Some("gemma2"));

        // The default is written first; a missing session must undo it
        assert!(matches!(
            store.set_session_model(Uuid::new_v4(), "llama3.1").await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.default_model().await.unwrap().as_deref(), Some("gemma2"));
    }

    #[tokio::test]
    async fn test_default_model_setting() {
        let store = store().await;
        assert_eq!(store.default_model().await.unwrap(), None);

        store.set_default_model("llama3.1").await.unwrap();
        store.set_default_model("gemma2").await.unwrap();

        assert_eq!(store.default_model().await.unwrap().as_deref(), Some("gemma2"));
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chats.db");

        let id = {
            let store = SessionStore::open(&path).await.unwrap();
            let id = store.create_session("Persistent", "llama3.1").await.unwrap();
            store
                .append_message(id, &Message::user("still here?").with_document(Some("notes.txt")))
                .await
                .unwrap();
            store.pool.close().await;
            id
        };

        let store = SessionStore::open(&path).await.unwrap();
        let session = store.load_session(id).await.unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].document.as_deref(), Some("notes.txt"));
    }
}
