//! Test utilities for the relay
//!
//! [`RecordingStore`] is an in-memory [`MessageStore`] that records every
//! write and can inject failures or slow writes.

use crate::error::{RelayError, Result};
use crate::storage::{derive_preview, derive_title, ChatSession, MessageStore, Role, StoredMessage};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Create a temporary directory for testing
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Assert that an error contains the expected message
pub fn assert_error_contains(err: &anyhow::Error, expected: &str) {
    let msg = err.to_string();
    assert!(
        msg.contains(expected),
        "Error message '{}' does not contain '{}'",
        msg,
        expected
    );
}

/// A write observed by [`RecordingStore`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Create { chat_id: String, content: String },
    Update { message_id: String, content: String },
    Touch { chat_id: String },
}

#[derive(Debug, Default)]
struct Inner {
    chats: HashMap<String, ChatSession>,
    messages: Vec<StoredMessage>,
    calls: Vec<StoreCall>,
    failures: VecDeque<RelayError>,
}

/// In-memory store recording every write
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: Mutex<Inner>,
    write_delay: Option<Duration>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write sleeps for `delay` before completing
    pub fn with_write_delay(delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Insert a chat without going through the trait
    pub fn seed_chat(&self, chat_id: &str, user_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.chats.insert(
            chat_id.to_string(),
            ChatSession {
                id: chat_id.to_string(),
                user_id: user_id.to_string(),
                title: "Seeded".to_string(),
                preview: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
    }

    /// Fail the next write with `error`; queued failures are used in order
    pub fn fail_next(&self, error: RelayError) {
        self.inner.lock().unwrap().failures.push_back(error);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn update_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::Update { .. }))
            .count()
    }

    pub fn create_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::Create { .. }))
            .count()
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.inner.lock().unwrap().messages.clone()
    }

    /// Content of the only assistant message
    pub fn assistant_content(&self) -> Option<String> {
        self.messages()
            .into_iter()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content)
    }

    async fn before_write(&self, call: StoreCall) -> Result<()> {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        match inner.failures.pop_front() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MessageStore for RecordingStore {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<ChatSession> {
        let chat = ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            preview: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.inner
            .lock()
            .unwrap()
            .chats
            .insert(chat.id.clone(), chat.clone());
        Ok(chat)
    }

    async fn create_chat_with_message(
        &self,
        user_id: &str,
        content: &str,
    ) -> Result<(ChatSession, StoredMessage)> {
        let mut chat = self.create_chat(user_id, &derive_title(content)).await?;
        chat.preview = Some(derive_preview(content));
        let message = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat.id.clone(),
            role: Role::User,
            content: content.to_string(),
            references: Vec::new(),
            created_at: Utc::now(),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.chats.insert(chat.id.clone(), chat.clone());
        inner.messages.push(message.clone());
        Ok((chat, message))
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<ChatSession>> {
        Ok(self.inner.lock().unwrap().chats.get(chat_id).cloned())
    }

    async fn create_message(
        &self,
        chat_id: &str,
        role: Role,
        content: &str,
        references: &[Value],
    ) -> Result<StoredMessage> {
        self.before_write(StoreCall::Create {
            chat_id: chat_id.to_string(),
            content: content.to_string(),
        })
        .await?;
        let message = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            role,
            content: content.to_string(),
            references: references.to_vec(),
            created_at: Utc::now(),
        };
        self.inner.lock().unwrap().messages.push(message.clone());
        Ok(message)
    }

    async fn update_message(
        &self,
        message_id: &str,
        content: &str,
        references: &[Value],
    ) -> Result<()> {
        self.before_write(StoreCall::Update {
            message_id: message_id.to_string(),
            content: content.to_string(),
        })
        .await?;
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| RelayError::persistence_status(404, "message not found"))?;
        message.content = content.to_string();
        message.references = references.to_vec();
        Ok(())
    }

    async fn touch_chat(&self, chat_id: &str) -> Result<()> {
        self.before_write(StoreCall::Touch {
            chat_id: chat_id.to_string(),
        })
        .await?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(chat) = inner.chats.get_mut(chat_id) {
            chat.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<StoredMessage>> {
        Ok(self
            .messages()
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .collect())
    }

    async fn list_valid_chats(&self, user_id: &str) -> Result<Vec<ChatSession>> {
        let inner = self.inner.lock().unwrap();
        let has = |chat_id: &str, role: Role| {
            inner
                .messages
                .iter()
                .any(|m| m.chat_id == chat_id && m.role == role)
        };
        Ok(inner
            .chats
            .values()
            .filter(|c| c.user_id == user_id && has(&c.id, Role::User) && has(&c.id, Role::Assistant))
            .cloned()
            .collect())
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.messages.retain(|m| m.chat_id != chat_id);
        Ok(inner.chats.remove(chat_id).is_some())
    }
}
