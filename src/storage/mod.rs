//! Chat persistence
//!
//! [`MessageStore`] is the persistence contract of the relay. The relay only
//! needs `create_message`, `update_message` and `touch_chat` while streaming;
//! the remaining operations back session bootstrap and the history API.
//! [`SqliteStorage`] is the bundled implementation.

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod types;
pub use types::{
    derive_preview, derive_title, ChatSession, ChatTranscript, Role, StoredMessage,
    PREVIEW_MAX_CHARS,
};

/// Persistence operations used by the relay and the history API
///
/// # Examples
///
/// ```
/// use lawchat_relay::storage::{MessageStore, Role, SqliteStorage};
///
/// # tokio_test::block_on(async {
/// let dir = tempfile::tempdir().unwrap();
/// let store = SqliteStorage::new_with_path(dir.path().join("chat.db")).unwrap();
///
/// let (chat, _) = store.create_chat_with_message("user-1", "Is this contract valid?").await.unwrap();
/// store.create_message(&chat.id, Role::Assistant, "It depends on consideration.", &[]).await.unwrap();
/// store.touch_chat(&chat.id).await.unwrap();
///
/// assert_eq!(store.list_valid_chats("user-1").await.unwrap().len(), 1);
/// # });
/// ```
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create an empty chat session
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<ChatSession>;

    /// Create a chat session and its first user message atomically
    async fn create_chat_with_message(
        &self,
        user_id: &str,
        content: &str,
    ) -> Result<(ChatSession, StoredMessage)>;

    /// Fetch a chat session
    async fn get_chat(&self, chat_id: &str) -> Result<Option<ChatSession>>;

    /// Insert a message into an existing chat
    async fn create_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
        references: &[Value],
    ) -> Result<StoredMessage>;

    /// Replace the content and references of a message
    async fn update_message(
        &self,
        message_id: &str,
        content: &str,
        references: &[Value],
    ) -> Result<()>;

    /// Bump the chat's `updated_at` and refresh its preview
    async fn touch_chat(&self, chat_id: &str) -> Result<()>;

    /// Messages of a chat, oldest first
    async fn list_messages(&self, chat_id: &str) -> Result<Vec<StoredMessage>>;

    /// Chats of a user holding at least one user and one assistant message
    async fn list_valid_chats(&self, user_id: &str) -> Result<Vec<ChatSession>>;

    /// Delete a chat and its messages; returns whether it existed
    async fn delete_chat(&self, chat_id: &str) -> Result<bool>;
}

/// SQLite backed [`MessageStore`]
///
/// A connection is opened per operation and used on the blocking thread
/// pool, so the store is cheap to clone and share between turns.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    db_path: PathBuf,
}

impl SqliteStorage {
    /// Create a storage instance in the user's data directory
    pub fn new() -> Result<Self> {
        let proj_dirs = ProjectDirs::from("com", "lawchat", "lawchat-relay")
            .ok_or_else(|| RelayError::Storage("Could not determine data directory".into()))?;

        Self::new_with_path(proj_dirs.data_dir().join("chat.db"))
    }

    /// Create a storage instance that uses the specified database path
    ///
    /// # Examples
    ///
    /// ```
    /// use lawchat_relay::storage::SqliteStorage;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let storage = SqliteStorage::new_with_path(dir.path().join("chat.db")).unwrap();
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RelayError::Storage(format!("Failed to create database directory: {}", e))
            })?;
        }

        let storage = Self { db_path };
        storage.init()?;
        tracing::info!("Using chat database at {}", storage.db_path.display());
        Ok(storage)
    }

    /// Resolve the store from an optional configured path
    pub fn from_config(config: &crate::config::PersistenceConfig) -> Result<Self> {
        match &config.db_path {
            Some(path) => Self::new_with_path(path.clone()),
            None => Self::new(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init(&self) -> Result<()> {
        let conn = open_connection(&self.db_path)
            .map_err(|e| RelayError::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                preview TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                references_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_chats_user ON chats(user_id, updated_at);",
        )
        .map_err(|e| RelayError::Storage(format!("Failed to create tables: {}", e)))?;

        Ok(())
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> std::result::Result<T, RelayError> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path).map_err(|e| map_sqlite(e, "open database"))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| RelayError::persistence(format!("storage task failed: {}", e)))?
        .map_err(Into::into)
    }
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Map a SQLite failure onto the retry classification
fn map_sqlite(error: rusqlite::Error, context: &str) -> RelayError {
    match &error {
        rusqlite::Error::QueryReturnedNoRows => {
            RelayError::persistence_status(404, format!("{}: not found", context))
        }
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch => {
                RelayError::persistence_status(400, format!("{}: {}", context, error))
            }
            ErrorCode::PermissionDenied | ErrorCode::ReadOnly | ErrorCode::AuthorizationForStatementDenied => {
                RelayError::persistence_status(403, format!("{}: {}", context, error))
            }
            _ => RelayError::persistence(format!("{}: {}", context, error)),
        },
        _ => RelayError::persistence(format!("{}: {}", context, error)),
    }
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn references_json(references: &[Value]) -> std::result::Result<String, RelayError> {
    serde_json::to_string(references).map_err(|e| {
        RelayError::persistence_status(400, format!("references are not serializable: {}", e))
    })
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatSession> {
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(ChatSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        preview: row.get(3)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(2)?;
    let references: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role: role.parse().unwrap_or(Role::Assistant),
        content: row.get(3)?,
        references: serde_json::from_str(&references).unwrap_or_default(),
        created_at: parse_ts(&created_at),
    })
}

fn insert_message(
    conn: &Connection,
    chat_id: &str,
    role: Role,
    content: &str,
    references: &[Value],
) -> std::result::Result<StoredMessage, RelayError> {
    let message = StoredMessage {
        id: uuid::Uuid::new_v4().to_string(),
        chat_id: chat_id.to_string(),
        role,
        content: content.to_string(),
        references: references.to_vec(),
        created_at: now(),
    };
    conn.execute(
        "INSERT INTO messages (id, chat_id, role, content, references_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            message.id,
            message.chat_id,
            role.as_str(),
            message.content,
            references_json(references)?,
            format_ts(&message.created_at)
        ],
    )
    .map_err(|e| map_sqlite(e, "insert message"))?;
    Ok(message)
}

#[async_trait]
impl MessageStore for SqliteStorage {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<ChatSession> {
        let chat = ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            preview: None,
            created_at: now(),
            updated_at: now(),
        };
        let row = chat.clone();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO chats (id, user_id, title, preview, created_at, updated_at)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
                params![
                    row.id,
                    row.user_id,
                    row.title,
                    format_ts(&row.created_at),
                    format_ts(&row.updated_at)
                ],
            )
            .map_err(|e| map_sqlite(e, "insert chat"))?;
            Ok(())
        })
        .await?;
        Ok(chat)
    }

    async fn create_chat_with_message(
        &self,
        user_id: &str,
        content: &str,
    ) -> Result<(ChatSession, StoredMessage)> {
        let ts = now();
        let chat = ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: derive_title(content),
            preview: Some(derive_preview(content)),
            created_at: ts,
            updated_at: ts,
        };
        let row = chat.clone();
        let content = content.to_string();
        let message = self
            .with_connection(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(|e| map_sqlite(e, "start transaction"))?;
                tx.execute(
                    "INSERT INTO chats (id, user_id, title, preview, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.id,
                        row.user_id,
                        row.title,
                        row.preview,
                        format_ts(&row.created_at),
                        format_ts(&row.updated_at)
                    ],
                )
                .map_err(|e| map_sqlite(e, "insert chat"))?;
                let message = insert_message(&tx, &row.id, Role::User, &content, &[])?;
                tx.commit()
                    .map_err(|e| map_sqlite(e, "commit transaction"))?;
                Ok(message)
            })
            .await?;
        Ok((chat, message))
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<ChatSession>> {
        let chat_id = chat_id.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT id, user_id, title, preview, created_at, updated_at
                 FROM chats WHERE id = ?1",
                params![chat_id],
                row_to_chat,
            )
            .optional()
            .map_err(|e| map_sqlite(e, "query chat"))
        })
        .await
    }

    async fn create_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
        references: &[Value],
    ) -> Result<StoredMessage> {
        let chat_id = chat_id.to_string();
        let content = content.to_string();
        let references = references.to_vec();
        self.with_connection(move |conn| {
            let exists = conn
                .query_row("SELECT 1 FROM chats WHERE id = ?1", params![chat_id], |_| {
                    Ok(())
                })
                .optional()
                .map_err(|e| map_sqlite(e, "query chat"))?
                .is_some();
            if !exists {
                return Err(RelayError::persistence_status(
                    404,
                    format!("chat {} not found", chat_id),
                ));
            }
            insert_message(conn, &chat_id, role, &content, &references)
        })
        .await
    }

    async fn update_message(
        &self,
        message_id: &str,
        content: &str,
        references: &[Value],
    ) -> Result<()> {
        let message_id = message_id.to_string();
        let content = content.to_string();
        let references = references_json(references)?;
        self.with_connection(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE messages SET content = ?1, references_json = ?2 WHERE id = ?3",
                    params![content, references, message_id],
                )
                .map_err(|e| map_sqlite(e, "update message"))?;
            if updated == 0 {
                return Err(RelayError::persistence_status(
                    404,
                    format!("message {} not found", message_id),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn touch_chat(&self, chat_id: &str) -> Result<()> {
        let chat_id = chat_id.to_string();
        self.with_connection(move |conn| {
            let latest: Option<String> = conn
                .query_row(
                    "SELECT content FROM messages WHERE chat_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    params![chat_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| map_sqlite(e, "query latest message"))?;
            let preview = latest.as_deref().map(derive_preview);
            let updated = conn
                .execute(
                    "UPDATE chats SET updated_at = ?1, preview = COALESCE(?2, preview)
                     WHERE id = ?3",
                    params![format_ts(&now()), preview, chat_id],
                )
                .map_err(|e| map_sqlite(e, "touch chat"))?;
            if updated == 0 {
                return Err(RelayError::persistence_status(
                    404,
                    format!("chat {} not found", chat_id),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<StoredMessage>> {
        let chat_id = chat_id.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, chat_id, role, content, references_json, created_at
                     FROM messages WHERE chat_id = ?1
                     ORDER BY created_at ASC, rowid ASC",
                )
                .map_err(|e| map_sqlite(e, "prepare messages query"))?;
            let rows = stmt
                .query_map(params![chat_id], row_to_message)
                .map_err(|e| map_sqlite(e, "query messages"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| map_sqlite(e, "read messages"))
        })
        .await
    }

    async fn list_valid_chats(&self, user_id: &str) -> Result<Vec<ChatSession>> {
        let user_id = user_id.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT c.id, c.user_id, c.title, c.preview, c.created_at, c.updated_at
                     FROM chats c
                     WHERE c.user_id = ?1
                       AND EXISTS (SELECT 1 FROM messages m
                                   WHERE m.chat_id = c.id AND m.role = 'user')
                       AND EXISTS (SELECT 1 FROM messages m
                                   WHERE m.chat_id = c.id AND m.role = 'assistant')
                     ORDER BY c.updated_at DESC",
                )
                .map_err(|e| map_sqlite(e, "prepare chats query"))?;
            let rows = stmt
                .query_map(params![user_id], row_to_chat)
                .map_err(|e| map_sqlite(e, "query chats"))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| map_sqlite(e, "read chats"))
        })
        .await
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<bool> {
        let chat_id = chat_id.to_string();
        self.with_connection(move |conn| {
            let deleted = conn
                .execute("DELETE FROM chats WHERE id = ?1", params![chat_id])
                .map_err(|e| map_sqlite(e, "delete chat"))?;
            Ok(deleted > 0)
        })
        .await
    }
}
