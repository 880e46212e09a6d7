//! HTTP surface of the relay
//!
//! `POST /api/chat` answers with a server-sent event stream once the
//! webhook has answered; anything that fails before that point is a JSON
//! error with a matching status code. The remaining routes expose the chat
//! history kept in the store.

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::request::ChatRequest;
use crate::storage::{ChatTranscript, MessageStore};
use crate::turn::ChatRelay;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

/// Response header carrying the chat id of a turn
pub const CHAT_ID_HEADER: &str = "x-chat-id";

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state of the HTTP server
pub struct AppState {
    relay: ChatRelay,
}

impl AppState {
    pub fn new(relay: ChatRelay) -> Self {
        Self { relay }
    }

    fn store(&self) -> &Arc<dyn MessageStore> {
        self.relay.store()
    }
}

/// JSON error response built from a relay error
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(error: E) -> Self {
        Self(error.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let Some(error) = self.0.downcast_ref::<RelayError>() else {
            tracing::error!(error = %self.0, "Unhandled error");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"kind": "internal", "message": self.0.to_string()}})),
            )
                .into_response();
        };

        let status =
            StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
        if status.is_server_error() {
            tracing::error!(kind = error.kind(), error = %error, "Request failed");
        } else {
            tracing::debug!(kind = error.kind(), error = %error, "Request rejected");
        }

        let body = match error {
            RelayError::Upstream { status, body } => json!({
                "error": {
                    "kind": error.kind(),
                    "message": error.to_string(),
                    "upstreamStatus": status,
                    "body": body,
                }
            }),
            _ => json!({"error": {"kind": error.kind(), "message": error.to_string()}}),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/chats", get(list_chats).post(create_chat))
        .route("/api/chats/:id", get(get_chat).delete(delete_chat))
        .with_state(state)
}

/// Bind the configured address and serve until Ctrl-C
pub async fn serve(config: &Config, store: Arc<dyn MessageStore>) -> Result<()> {
    let relay = ChatRelay::from_config(config, store)?;
    let app = router(Arc::new(AppState::new(relay)));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .map_err(|e| {
            RelayError::Config(format!("Failed to bind {}: {}", config.server.bind, e))
        })?;
    tracing::info!(addr = %listener.local_addr()?, webhook = %config.webhook.url, "Chat relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Chat relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

async fn chat(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> std::result::Result<Response, ApiError> {
    let Json(request) =
        payload.map_err(|rejection| RelayError::Validation(rejection.body_text()))?;

    let turn = state.relay.start_turn(request).await?;
    let chat_id = turn.chat_id.clone();
    let events = turn
        .events
        .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_json())));

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&chat_id) {
        response.headers_mut().insert(CHAT_ID_HEADER, value);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListChatsQuery {
    user_id: Option<String>,
}

async fn list_chats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListChatsQuery>,
) -> std::result::Result<Response, ApiError> {
    let user_id = query
        .user_id
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| RelayError::Validation("userId is required".to_string()))?;
    let chats = state.store().list_valid_chats(&user_id).await?;
    Ok(Json(chats).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChatBody {
    user_id: String,
    #[serde(default)]
    title: Option<String>,
}

async fn create_chat(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<CreateChatBody>, JsonRejection>,
) -> std::result::Result<Response, ApiError> {
    let Json(body) = payload.map_err(|rejection| RelayError::Validation(rejection.body_text()))?;
    if body.user_id.trim().is_empty() {
        return Err(RelayError::Validation("userId is required".to_string()).into());
    }
    let title = body
        .title
        .as_deref()
        .map(crate::storage::derive_title)
        .unwrap_or_else(|| "New chat".to_string());
    let chat = state.store().create_chat(&body.user_id, &title).await?;
    tracing::info!(chat_id = %chat.id, user_id = %chat.user_id, "Created chat session");
    Ok((StatusCode::CREATED, Json(chat)).into_response())
}

async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let chat = state
        .store()
        .get_chat(&id)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("chat {}", id)))?;
    let messages = state.store().list_messages(&id).await?;
    Ok(Json(ChatTranscript { chat, messages }).into_response())
}

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> std::result::Result<Response, ApiError> {
    if !state.store().delete_chat(&id).await? {
        return Err(RelayError::NotFound(format!("chat {}", id)).into());
    }
    tracing::info!(chat_id = %id, "Deleted chat");
    Ok(StatusCode::NO_CONTENT.into_response())
}
