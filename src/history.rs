//! Session-scoped conversation history on embedded SQLite.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

/// Title given to a session until its first user message arrives.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// Maximum characters kept when deriving a session title.
const TITLE_MAX_CHARS: usize = 50;

/// How many messages of context the retrieval pipeline loads by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 8;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    /// The querying human.
    User,
    /// The language model.
    Assistant,
}

impl ChatRole {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn parse(raw: &str) -> Self {
        if raw == "assistant" {
            Self::Assistant
        } else {
            Self::User
        }
    }
}

/// A conversation session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    /// Session UUID.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time a message was added or the title changed.
    pub updated_at: DateTime<Utc>,
}

/// A stored message with its metadata.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    /// Author role (`user` or `assistant`).
    pub role: String,
    /// Message body.
    pub content: String,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Structured source attributions, present on assistant turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<serde_json::Value>,
}

/// A trimmed history entry handed to the retrieval pipeline.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Author role.
    pub role: ChatRole,
    /// Message body.
    pub content: String,
}

/// SQLite-backed store for sessions and their messages.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Opens (creating if needed) the history database at `path`.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open history store at {path}"))?;

        let store = Self { pool };
        store
            .create_schema()
            .await
            .context("failed to create history schema")?;
        info!(path, "history store ready");
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
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
                created_at DATETIME NOT NULL,
                sources TEXT,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Creates a fresh session and returns its ID.
    pub async fn create_session(&self, title: Option<&str>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query("INSERT INTO sessions (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(title.unwrap_or(DEFAULT_SESSION_TITLE))
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    /// Appends a message, creating the session when it does not exist.
    ///
    /// The first user message of a still-untitled session becomes its
    /// title (first line, truncated). Every insert bumps `updated_at`.
    pub async fn add_message(
        &self,
        session_id: &str,
        role: ChatRole,
        content: &str,
        sources: Option<&serde_json::Value>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO sessions (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(DEFAULT_SESSION_TITLE)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO messages (session_id, role, content, created_at, sources) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(now)
        .bind(sources.map(|value| value.to_string()))
        .execute(&mut *tx)
        .await?;

        if role == ChatRole::User {
            sqlx::query("UPDATE sessions SET title = ? WHERE id = ? AND title = ?")
                .bind(derive_title(content))
                .bind(session_id)
                .bind(DEFAULT_SESSION_TITLE)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// The newest `limit` messages, returned oldest-first.
    pub async fn get_history(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT role, content FROM messages WHERE session_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries: Vec<HistoryEntry> = rows
            .into_iter()
            .map(|row| HistoryEntry {
                role: ChatRole::parse(&row.get::<String, _>("role")),
                content: row.get("content"),
            })
            .collect();
        entries.reverse();
        Ok(entries)
    }

    /// Every message of a session in chronological order.
    pub async fn get_full_history(&self, session_id: &str) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT role, content, created_at, sources FROM messages WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| MessageRecord {
                role: row.get("role"),
                content: row.get("content"),
                created_at: row.get("created_at"),
                sources: row
                    .get::<Option<String>, _>("sources")
                    .and_then(|raw| serde_json::from_str(&raw).ok()),
            })
            .collect())
    }

    /// Looks up one session.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(session_from_row))
    }

    /// All sessions, most recently updated first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM sessions ORDER BY updated_at DESC, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(session_from_row).collect())
    }

    /// Removes a session and (by cascade) its messages. Returns whether
    /// the session existed.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Renames a session. Returns whether the session existed.
    pub async fn update_session_title(&self, session_id: &str, title: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE sessions SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn session_from_row(row: sqlx::sqlite::SqliteRow) -> SessionRecord {
    SessionRecord {
        id: row.get("id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn derive_title(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or("").trim();
    let truncated: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    if truncated.is_empty() {
        DEFAULT_SESSION_TITLE.to_string()
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> HistoryStore {
        HistoryStore::open(":memory:").await.expect("in-memory store")
    }

    #[tokio::test]
    async fn first_user_message_titles_the_session() {
        let store = memory_store().await;
        let id = store.create_session(None).await.unwrap();
        store
            .add_message(&id, ChatRole::User, "what is a B-tree\nsecond line", None)
            .await
            .unwrap();

        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.title, "what is a B-tree");

        // A later user message must not retitle.
        store
            .add_message(&id, ChatRole::User, "another question", None)
            .await
            .unwrap();
        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.title, "what is a B-tree");
    }

    #[tokio::test]
    async fn long_titles_are_truncated_to_fifty_chars() {
        let store = memory_store().await;
        let id = store.create_session(None).await.unwrap();
        let long = "x".repeat(120);
        store
            .add_message(&id, ChatRole::User, &long, None)
            .await
            .unwrap();
        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.title.chars().count(), 50);
    }

    #[tokio::test]
    async fn history_returns_newest_n_oldest_first() {
        let store = memory_store().await;
        let id = store.create_session(None).await.unwrap();
        for i in 0..12 {
            store
                .add_message(&id, ChatRole::User, &format!("m{i}"), None)
                .await
                .unwrap();
        }
        let history = store.get_history(&id, 8).await.unwrap();
        assert_eq!(history.len(), 8);
        assert_eq!(history[0].content, "m4");
        assert_eq!(history[7].content, "m11");
    }

    #[tokio::test]
    async fn add_message_auto_creates_the_session() {
        let store = memory_store().await;
        store
            .add_message("ghost", ChatRole::Assistant, "hello", None)
            .await
            .unwrap();
        assert!(store.get_session("ghost").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_orders_by_most_recent_activity() {
        let store = memory_store().await;
        let first = store.create_session(None).await.unwrap();
        let second = store.create_session(None).await.unwrap();
        store
            .add_message(&first, ChatRole::User, "touch", None)
            .await
            .unwrap();

        let sessions = store.list_sessions().await.unwrap();
        assert_eq!(sessions[0].id, first);
        assert_eq!(sessions[1].id, second);
    }

    #[tokio::test]
    async fn delete_cascades_messages() {
        let store = memory_store().await;
        let id = store.create_session(None).await.unwrap();
        store
            .add_message(&id, ChatRole::User, "hello", None)
            .await
            .unwrap();
        assert!(store.delete_session(&id).await.unwrap());
        assert!(store.get_session(&id).await.unwrap().is_none());
        assert!(store.get_full_history(&id).await.unwrap().is_empty());
        assert!(!store.delete_session(&id).await.unwrap());
    }

    #[tokio::test]
    async fn sources_round_trip_through_storage() {
        let store = memory_store().await;
        let id = store.create_session(None).await.unwrap();
        let sources = serde_json::json!({"count": 2, "items": []});
        store
            .add_message(&id, ChatRole::Assistant, "answer", Some(&sources))
            .await
            .unwrap();
        let full = store.get_full_history(&id).await.unwrap();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].sources.as_ref().unwrap()["count"], 2);
    }
}
