use async_trait::async_trait;
use lawchat_relay::config::Config;
use lawchat_relay::error::{RelayError, Result};
use lawchat_relay::storage::{ChatSession, MessageStore, Role, SqliteStorage, StoredMessage};
use lawchat_relay::stream::StreamEvent;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

#[allow(dead_code)]
pub fn create_temp_storage() -> (SqliteStorage, TempDir) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let db_path = tmp.path().join("chat.db");
    let storage =
        SqliteStorage::new_with_path(db_path).expect("failed to create sqlite storage with path");
    (storage, tmp)
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Configuration pointing at a mock webhook, with pacing disabled
#[allow(dead_code)]
pub fn test_config(webhook_base: &str) -> Config {
    let mut config = Config::default();
    config.webhook.url = format!("{}/webhook/lawyer-chat", webhook_base);
    config.tracker.enabled = false;
    config.stream.chunk_delay_ms = 0;
    config.persistence.initial_delay_ms = 5;
    config.persistence.max_delay_ms = 20;
    config
}

/// Concatenated text of all `text` events
#[allow(dead_code)]
pub fn joined_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Parse the `data:` frames of an SSE body
#[allow(dead_code)]
pub fn parse_sse_body(body: &str) -> Vec<StreamEvent> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|payload| serde_json::from_str(payload).expect("relay emitted invalid event JSON"))
        .collect()
}

/// Store wrapper counting writes and failing the first `fail_updates` updates
#[allow(dead_code)]
pub struct CountingStore {
    pub inner: SqliteStorage,
    pub updates: AtomicUsize,
    pub creates: AtomicUsize,
    fail_updates: AtomicUsize,
}

#[allow(dead_code)]
impl CountingStore {
    pub fn new(inner: SqliteStorage) -> Arc<Self> {
        Self::failing_updates(inner, 0)
    }

    pub fn failing_updates(inner: SqliteStorage, fail_updates: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            updates: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            fail_updates: AtomicUsize::new(fail_updates),
        })
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for CountingStore {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<ChatSession> {
        self.inner.create_chat(user_id, title).await
    }

    async fn create_chat_with_message(
        &self,
        user_id: &str,
        content: &str,
    ) -> Result<(ChatSession, StoredMessage)> {
        self.inner.create_chat_with_message(user_id, content).await
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<ChatSession>> {
        self.inner.get_chat(chat_id).await
    }

    async fn create_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
        references: &[Value],
    ) -> Result<StoredMessage> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner
            .create_message(chat_id, role, content, references)
            .await
    }

    async fn update_message(
        &self,
        message_id: &str,
        content: &str,
        references: &[Value],
    ) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_updates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_updates.store(remaining - 1, Ordering::SeqCst);
            return Err(RelayError::persistence("database is locked").into());
        }
        self.inner
            .update_message(message_id, content, references)
            .await
    }

    async fn touch_chat(&self, chat_id: &str) -> Result<()> {
        self.inner.touch_chat(chat_id).await
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<StoredMessage>> {
        self.inner.list_messages(chat_id).await
    }

    async fn list_valid_chats(&self, user_id: &str) -> Result<Vec<ChatSession>> {
        self.inner.list_valid_chats(user_id).await
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<bool> {
        self.inner.delete_chat(chat_id).await
    }
}
