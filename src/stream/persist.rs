//! Incremental persistence of the streaming assistant message
//!
//! The assistant message is created on the first text chunk and then
//! updated in place. A mid-stream create is a single attempt; when it fails
//! the next one waits out the save interval like any other save, and the
//! final save creates the message with the full retry budget. Mid-stream
//! updates are throttled and guarded by a
//! single in-flight slot: a save attempted while another one is still
//! running is dropped, not queued. The final save waits for the in-flight
//! save and then always writes the complete cleaned answer.
//!
//! Store failures are logged and never interrupt delivery to the client.

use super::clean::{detect_anomalies, ResponseAnomaly};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::storage::{MessageStore, Role};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Result of a mid-stream save attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The assistant message was created
    Created,
    /// An update was started in the background
    Started,
    /// The last save is too recent
    Throttled,
    /// A previous save is still running
    InFlight,
    /// Nothing to save yet
    Empty,
    /// The store rejected the write
    Failed,
}

/// Clears the in-flight flag when the save task ends, even on panic
struct InFlightSlot(Arc<AtomicBool>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Persists one assistant message while it streams
pub struct MessagePersister {
    store: Arc<dyn MessageStore>,
    chat_id: String,
    policy: RetryPolicy,
    save_interval: Duration,
    message_id: Option<String>,
    last_save: Option<Instant>,
    in_flight: Arc<AtomicBool>,
    pending: Option<JoinHandle<()>>,
}

impl MessagePersister {
    pub fn new(
        store: Arc<dyn MessageStore>,
        chat_id: impl Into<String>,
        policy: RetryPolicy,
        save_interval: Duration,
    ) -> Self {
        Self {
            store,
            chat_id: chat_id.into(),
            policy,
            save_interval,
            message_id: None,
            last_save: None,
            in_flight: Arc::new(AtomicBool::new(false)),
            pending: None,
        }
    }

    /// Id of the assistant message once created
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Save the answer accumulated so far
    ///
    /// The first call creates the message with one attempt and waits for it.
    /// Later calls start a background update unless one ran within the save
    /// interval or is still running. A failed create is tried again once the
    /// interval has passed.
    pub async fn save_progress(&mut self, content: &str, references: &[Value]) -> SaveOutcome {
        if content.is_empty() {
            return SaveOutcome::Empty;
        }

        if self
            .last_save
            .is_some_and(|at| at.elapsed() < self.save_interval)
        {
            return SaveOutcome::Throttled;
        }

        if self.message_id.is_none() {
            let outcome = match self.create(content, references, RetryPolicy::once()).await {
                Some(_) => SaveOutcome::Created,
                None => SaveOutcome::Failed,
            };
            self.last_save = Some(Instant::now());
            return outcome;
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(chat_id = %self.chat_id, "Save in flight, skipping");
            return SaveOutcome::InFlight;
        }

        let slot = InFlightSlot(self.in_flight.clone());
        let store = self.store.clone();
        let policy = self.policy;
        let message_id = self.message_id.clone().unwrap_or_default();
        let content = content.to_string();
        let references = references.to_vec();

        self.last_save = Some(Instant::now());
        self.pending = Some(tokio::spawn(async move {
            let _slot = slot;
            let result = retry_with_backoff(&policy, "update_message", || {
                store.update_message(&message_id, &content, &references)
            })
            .await;
            if let Err(e) = result {
                crate::metrics::record_persistence_failure("update_message");
                tracing::error!(message_id = %message_id, error = %e, "Mid-stream save failed");
            }
        }));

        SaveOutcome::Started
    }

    /// Write the final answer and bump the chat
    ///
    /// Waits for a running mid-stream save first so the final content is the
    /// last write. Returns whether the answer was stored.
    pub async fn finalize(&mut self, content: &str, references: &[Value]) -> bool {
        if let Some(pending) = self.pending.take() {
            if let Err(e) = pending.await {
                tracing::warn!(error = %e, "Mid-stream save task failed");
            }
        }

        for anomaly in detect_anomalies(content) {
            let kind = match anomaly {
                ResponseAnomaly::Restarted { offset } => {
                    tracing::warn!(
                        chat_id = %self.chat_id,
                        offset,
                        "Answer appears to restart mid-stream"
                    );
                    "restarted"
                }
                ResponseAnomaly::Truncated => {
                    tracing::warn!(chat_id = %self.chat_id, "Answer appears truncated");
                    "truncated"
                }
            };
            crate::metrics::record_anomaly(kind);
        }

        let stored = match self.message_id.clone() {
            Some(message_id) => {
                let store = self.store.clone();
                let result = retry_with_backoff(&self.policy, "update_message", || {
                    store.update_message(&message_id, content, references)
                })
                .await;
                match result {
                    Ok(()) => true,
                    Err(e) => {
                        crate::metrics::record_persistence_failure("update_message");
                        tracing::error!(message_id = %message_id, error = %e, "Final save failed");
                        false
                    }
                }
            }
            None if content.is_empty() && references.is_empty() => {
                tracing::warn!(chat_id = %self.chat_id, "Turn produced no answer, nothing saved");
                return false;
            }
            None => self.create(content, references, self.policy).await.is_some(),
        };

        let store = self.store.clone();
        let chat_id = self.chat_id.clone();
        if let Err(e) =
            retry_with_backoff(&self.policy, "touch_chat", || store.touch_chat(&chat_id)).await
        {
            crate::metrics::record_persistence_failure("touch_chat");
            tracing::error!(chat_id = %self.chat_id, error = %e, "Failed to bump chat");
        }

        stored
    }

    async fn create(
        &mut self,
        content: &str,
        references: &[Value],
        policy: RetryPolicy,
    ) -> Option<String> {
        let store = self.store.clone();
        let chat_id = self.chat_id.clone();
        let result = retry_with_backoff(&policy, "create_message", || {
            store.create_message(&chat_id, Role::Assistant, content, references)
        })
        .await;

        match result {
            Ok(message) => {
                tracing::debug!(chat_id = %self.chat_id, message_id = %message.id, "Created assistant message");
                self.message_id = Some(message.id.clone());
                Some(message.id)
            }
            Err(e) => {
                crate::metrics::record_persistence_failure("create_message");
                tracing::error!(chat_id = %self.chat_id, error = %e, "Failed to create assistant message");
                None
            }
        }
    }
}

impl Drop for MessagePersister {
    fn drop(&mut self) {
        if self.pending.as_ref().is_some_and(|p| !p.is_finished()) {
            tracing::debug!(chat_id = %self.chat_id, "Persister dropped with a save in flight");
        }
    }
}
