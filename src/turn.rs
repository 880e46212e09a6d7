//! Chat turn pipeline
//!
//! [`ChatRelay::start_turn`] runs everything that can still fail with a
//! plain HTTP error (validation, session bootstrap, the webhook call) and
//! then hands the rest of the turn to a producer task. The producer turns
//! the upstream answer into [`StreamEvent`]s on a bounded channel, paces the
//! text, persists the assistant message and always ends with `done`.
//!
//! Progress from the execution tracker reaches the producer only through a
//! `watch` cell, which is read between upstream reads and text chunks.

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::metrics::TurnMetrics;
use crate::relay::fallback::fallback_events;
use crate::relay::{BufferedResponse, ByteStream, RelayResponse, WebhookClient};
use crate::request::{ChatRequest, RequestNormalizer};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::storage::{MessageStore, Role};
use crate::stream::persist::MessagePersister;
use crate::stream::{
    chunk_text, data_payload, parse_upstream_event, LineDecoder, Pacing, ProgressUpdate,
    StreamEvent, TextAccumulator,
};
use crate::tracker::{progress_channel, track_or_simulate, ExecutionTracker, ProgressReceiver};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

/// Buffered events between the producer and the client connection
const EVENT_BUFFER: usize = 64;

/// Delay between fabricated progress stages of the fallback stream
const FALLBACK_STAGE_DELAY: Duration = Duration::from_millis(250);

/// Lifecycle of a chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    RequestSent,
    Streaming,
    BufferedReceived,
    Finalizing,
    Done,
    Error,
}

impl TurnState {
    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (Done, _) => false,
            (Error, Done) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Idle, RequestSent)
            | (RequestSent, Streaming)
            | (RequestSent, BufferedReceived)
            | (Streaming, Finalizing)
            | (BufferedReceived, Finalizing)
            | (Finalizing, Done) => true,
            _ => false,
        }
    }
}

/// A started turn: the resolved chat id and its event stream
pub struct ChatTurn {
    pub chat_id: String,
    pub events: ReceiverStream<StreamEvent>,
}

impl ChatTurn {
    /// Drain the stream; useful for tests and the CLI
    pub async fn collect(self) -> Vec<StreamEvent> {
        self.events.collect().await
    }
}

/// Relays chat turns between clients and the generation backend
pub struct ChatRelay {
    normalizer: RequestNormalizer,
    client: WebhookClient,
    tracker: Option<ExecutionTracker>,
    store: Arc<dyn MessageStore>,
    pacing: Pacing,
    save_interval: Duration,
    retry: RetryPolicy,
}

impl ChatRelay {
    /// Build the relay from configuration
    pub fn from_config(config: &Config, store: Arc<dyn MessageStore>) -> Result<Self> {
        Ok(Self {
            normalizer: RequestNormalizer::new(config.limits.clone()),
            client: WebhookClient::new(config.webhook.clone())?,
            tracker: ExecutionTracker::from_config(&config.tracker)?,
            store,
            pacing: Pacing::from(&config.stream),
            save_interval: Duration::from_millis(config.stream.save_interval_ms),
            retry: RetryPolicy::from(&config.persistence),
        })
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Validate the request, store the user message and call the backend
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Validation`], [`RelayError::Timeout`],
    /// [`RelayError::Upstream`] or a transport error. Once this returns
    /// `Ok`, failures are reported inside the event stream.
    pub async fn start_turn(&self, request: ChatRequest) -> Result<ChatTurn> {
        let mut normalized = self.normalizer.normalize(&request)?;

        let stored_chat = self.resolve_session(&request, &normalized.user_message).await?;
        let chat_id = stored_chat.clone().unwrap_or_else(|| {
            request
                .session_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
        });
        normalized.payload.session_id = chat_id.clone();
        if normalized.payload.session_key.is_empty() {
            normalized.payload.session_key = chat_id.clone();
        }

        let span = tracing::info_span!(
            "chat_turn",
            chat_id = %chat_id,
            session_id = %normalized.payload.session_key
        );

        let mut state = TurnState::Idle;
        advance(&mut state, TurnState::RequestSent);
        let response = self
            .client
            .send(&normalized)
            .instrument(span.clone())
            .await?;

        span.in_scope(|| {
            tracing::info!(mode = response.mode(), "Webhook answered, starting stream");
        });

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let persister = stored_chat.map(|id| {
            MessagePersister::new(self.store.clone(), id, self.retry, self.save_interval)
        });
        let (progress_tx, progress_rx) = progress_channel();
        let metrics = TurnMetrics::new(response.mode());

        let tracker_task = match (response.execution_id(), &self.tracker) {
            (Some(id), Some(tracker)) => {
                tracing::debug!(execution_id = %id, mode = response.mode(), "Tracking execution progress");
                Some(tokio::spawn(
                    track_or_simulate(tracker.clone(), id.to_string(), progress_tx)
                        .instrument(span.clone()),
                ))
            }
            _ => {
                drop(progress_tx);
                None
            }
        };

        let producer = TurnProducer {
            state,
            tx,
            pacing: self.pacing,
            persister,
            accumulator: TextAccumulator::new(),
            sent: String::new(),
            sources: Vec::new(),
            progress: progress_rx,
            progress_open: tracker_task.is_some(),
            last_progress: None,
            started: Instant::now(),
            disconnected: false,
            metrics,
            _tracker: TrackerGuard(tracker_task),
        };
        tokio::spawn(producer.run(response).instrument(span));

        Ok(ChatTurn {
            chat_id,
            events: ReceiverStream::new(rx),
        })
    }

    /// Find or create the chat and store the user message
    ///
    /// Returns `None` when the store is unavailable; the turn then streams
    /// without persistence.
    async fn resolve_session(
        &self,
        request: &ChatRequest,
        user_message: &str,
    ) -> Result<Option<String>> {
        if let Some(chat_id) = request.session_id.as_deref().filter(|id| !id.is_empty()) {
            match self.store.get_chat(chat_id).await {
                Ok(Some(chat)) if chat.user_id != request.user_id => {
                    return Err(RelayError::Validation(format!(
                        "chat {} belongs to another user",
                        chat_id
                    ))
                    .into());
                }
                Ok(Some(_)) => {
                    let store = self.store.clone();
                    let result = retry_with_backoff(&self.retry, "create_message", || {
                        store.create_message(chat_id, Role::User, user_message, &[])
                    })
                    .await;
                    if let Err(e) = result {
                        crate::metrics::record_persistence_failure("create_message");
                        tracing::error!(chat_id, error = %e, "Failed to store user message");
                    }
                    return Ok(Some(chat_id.to_string()));
                }
                Ok(None) => {
                    tracing::debug!(chat_id, "Unknown chat id, starting a new session");
                }
                Err(e) => {
                    tracing::error!(chat_id, error = %e, "Chat lookup failed, streaming without persistence");
                    return Ok(None);
                }
            }
        }

        let store = self.store.clone();
        let user_id = request.user_id.as_str();
        match retry_with_backoff(&self.retry, "create_chat", || {
            store.create_chat_with_message(user_id, user_message)
        })
        .await
        {
            Ok((chat, _)) => {
                tracing::info!(chat_id = %chat.id, user_id, "Created chat session");
                Ok(Some(chat.id))
            }
            Err(e) => {
                crate::metrics::record_persistence_failure("create_chat");
                tracing::error!(user_id, error = %e, "Failed to create chat, streaming without persistence");
                Ok(None)
            }
        }
    }
}

fn advance(state: &mut TurnState, next: TurnState) {
    if !state.can_transition_to(next) {
        tracing::warn!(from = ?state, to = ?next, "Unexpected turn state transition");
    }
    tracing::trace!(from = ?state, to = ?next, "Turn state");
    *state = next;
}

/// Aborts the tracker when the turn ends on any path
struct TrackerGuard(Option<JoinHandle<()>>);

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

enum Flow {
    Continue,
    Finish,
    Fail(String),
}

enum Next {
    Progress(bool),
    Chunk(Option<Result<bytes::Bytes>>),
}

/// Producer side of one turn
struct TurnProducer {
    state: TurnState,
    tx: mpsc::Sender<StreamEvent>,
    pacing: Pacing,
    persister: Option<MessagePersister>,
    accumulator: TextAccumulator,
    /// Text actually delivered to the client
    sent: String,
    sources: Vec<Value>,
    progress: ProgressReceiver,
    progress_open: bool,
    last_progress: Option<ProgressUpdate>,
    started: Instant,
    disconnected: bool,
    metrics: TurnMetrics,
    _tracker: TrackerGuard,
}

impl TurnProducer {
    async fn run(mut self, response: RelayResponse) {
        match response {
            RelayResponse::Streaming { body, .. } => self.run_stream(body).await,
            RelayResponse::Buffered(buffered) => self.run_buffered(buffered).await,
            RelayResponse::Inactive { reason } => self.run_fallback(&reason).await,
        }
    }

    async fn run_stream(&mut self, mut body: ByteStream) {
        advance(&mut self.state, TurnState::Streaming);
        let mut decoder = LineDecoder::new();

        loop {
            if self.disconnected {
                self.finish().await;
                return;
            }

            let next = tokio::select! {
                changed = self.progress.changed(), if self.progress_open => Next::Progress(changed.is_ok()),
                chunk = body.next() => Next::Chunk(chunk),
            };

            match next {
                Next::Progress(true) => self.forward_progress().await,
                Next::Progress(false) => self.progress_open = false,
                Next::Chunk(Some(Ok(bytes))) => {
                    for line in decoder.push(&bytes) {
                        match self.handle_line(&line).await {
                            Flow::Continue => {}
                            Flow::Finish => return self.finish().await,
                            Flow::Fail(message) => return self.fail(message).await,
                        }
                    }
                }
                Next::Chunk(Some(Err(e))) => {
                    tracing::warn!(error = %e, "Upstream stream failed");
                    return self.fail(format!("Upstream stream failed: {}", e)).await;
                }
                Next::Chunk(None) => {
                    if let Some(line) = decoder.finish() {
                        match self.handle_line(&line).await {
                            Flow::Fail(message) => return self.fail(message).await,
                            Flow::Continue | Flow::Finish => {}
                        }
                    }
                    tracing::debug!("Upstream ended without done, finalizing");
                    return self.finish().await;
                }
            }
        }
    }

    async fn run_buffered(&mut self, response: BufferedResponse) {
        advance(&mut self.state, TurnState::BufferedReceived);

        let mut text = self.accumulator.push(&response.text);
        text.push_str(&self.accumulator.finish());
        self.emit_text(&text).await;

        if let Some(data) = response.analytics {
            self.emit(StreamEvent::Analytics { data }).await;
        }
        self.sources = response.sources;
        self.finish().await;
    }

    async fn run_fallback(&mut self, reason: &str) {
        crate::metrics::record_fallback("inactive_workflow");
        tracing::warn!(reason = %truncate_for_log(reason), "Serving fallback stream");
        advance(&mut self.state, TurnState::BufferedReceived);

        for event in fallback_events(self.pacing.chunk_size) {
            if self.disconnected {
                break;
            }
            let delay = match &event {
                StreamEvent::Status(_) => FALLBACK_STAGE_DELAY,
                StreamEvent::Text { .. } => self.pacing.delay,
                _ => Duration::ZERO,
            };
            if matches!(event, StreamEvent::Done { .. }) {
                advance(&mut self.state, TurnState::Finalizing);
            }
            self.emit(event).await;
            if !delay.is_zero() && !self.disconnected {
                tokio::time::sleep(delay).await;
            }
        }

        advance(&mut self.state, TurnState::Done);
        self.metrics.record_outcome("fallback");
    }

    async fn handle_line(&mut self, line: &str) -> Flow {
        let Some(payload) = data_payload(line) else {
            return Flow::Continue;
        };
        match parse_upstream_event(payload) {
            Ok(Some(event)) => self.handle_event(event).await,
            Ok(None) => Flow::Continue,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unparseable upstream line");
                Flow::Continue
            }
        }
    }

    async fn handle_event(&mut self, event: StreamEvent) -> Flow {
        tracing::debug!(kind = event.kind(), "Upstream event");
        match event {
            StreamEvent::Status(update) => {
                let update = self.stamp(update);
                self.emit(StreamEvent::Status(update)).await;
            }
            StreamEvent::Progress(update) => {
                let update = self.stamp(update);
                self.emit(StreamEvent::Progress(update)).await;
            }
            StreamEvent::Text { text } => {
                let delta = self.accumulator.push(&text);
                self.emit_text(&delta).await;
            }
            StreamEvent::Sources { sources } => self.sources = sources,
            StreamEvent::Analytics { data } => {
                self.emit(StreamEvent::Analytics { data }).await;
            }
            StreamEvent::Error { message } => return Flow::Fail(message),
            StreamEvent::Done { sources } => {
                if !sources.is_empty() {
                    self.sources = sources;
                }
                return Flow::Finish;
            }
        }
        Flow::Continue
    }

    fn stamp(&self, mut update: ProgressUpdate) -> ProgressUpdate {
        if update.elapsed_ms.is_none() {
            update.elapsed_ms = Some(self.started.elapsed().as_millis() as u64);
        }
        update
    }

    async fn emit(&mut self, event: StreamEvent) {
        if self.disconnected {
            return;
        }
        if self.tx.send(event).await.is_err() {
            tracing::info!("Client disconnected, stopping stream");
            self.disconnected = true;
        }
    }

    /// Emit `text` in paced chunks, saving progress as it goes
    async fn emit_text(&mut self, text: &str) {
        for chunk in chunk_text(text, self.pacing.chunk_size) {
            if self.disconnected {
                return;
            }
            self.emit(StreamEvent::text(chunk.clone())).await;
            if self.disconnected {
                return;
            }
            self.sent.push_str(&chunk);

            if let Some(persister) = self.persister.as_mut() {
                persister.save_progress(&self.sent, &self.sources).await;
            }
            self.forward_progress().await;

            if !self.pacing.delay.is_zero() {
                tokio::time::sleep(self.pacing.delay).await;
            }
        }
    }

    /// Forward the latest tracked progress if it is new
    async fn forward_progress(&mut self) {
        let current = self.progress.borrow_and_update().clone();
        if current.is_some() && current != self.last_progress {
            self.last_progress = current.clone();
            if let Some(update) = current {
                self.emit(StreamEvent::Progress(update)).await;
            }
        }
    }

    async fn finish(&mut self) {
        advance(&mut self.state, TurnState::Finalizing);

        let rest = self.accumulator.finish();
        self.emit_text(&rest).await;
        if !self.sources.is_empty() {
            self.emit(StreamEvent::Sources {
                sources: self.sources.clone(),
            })
            .await;
        }
        self.emit(StreamEvent::Done {
            sources: self.sources.clone(),
        })
        .await;
        advance(&mut self.state, TurnState::Done);

        self.save_final().await;
        let outcome = if self.disconnected {
            "disconnected"
        } else {
            "completed"
        };
        tracing::info!(
            outcome,
            chars = self.sent.chars().count(),
            sources = self.sources.len(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Turn finished"
        );
        self.metrics.record_outcome(outcome);
    }

    async fn fail(&mut self, message: String) {
        advance(&mut self.state, TurnState::Error);
        tracing::warn!(error = %message, "Turn failed");

        self.emit(StreamEvent::error(message)).await;
        self.emit(StreamEvent::done()).await;
        advance(&mut self.state, TurnState::Done);

        self.save_final().await;
        self.metrics.record_outcome("upstream_error");
    }

    /// Store the text the client actually received
    async fn save_final(&mut self) {
        if let Some(persister) = self.persister.as_mut() {
            persister.finalize(&self.sent, &self.sources).await;
        }
    }
}

fn truncate_for_log(text: &str) -> &str {
    crate::request::truncate_utf8(text, 200)
}
