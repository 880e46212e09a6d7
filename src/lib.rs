//! Lawchat relay - streaming chat relay library
//!
//! This library relays chat turns from a legal research UI to a workflow
//! webhook and streams the answer back as Server-Sent Events, while
//! tracking execution progress and persisting the conversation.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `request`: Validation and normalization of incoming chat requests
//! - `relay`: Webhook client distinguishing streaming and buffered answers
//! - `tracker`: Execution progress polling published through a watch cell
//! - `stream`: Upstream decoding, event model, cleaning, pacing, persistence
//! - `turn`: The per-turn pipeline tying the pieces together
//! - `server`: Axum routes for chat turns and history
//! - `storage`: Chat and message persistence (SQLite)
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use lawchat_relay::{ChatRelay, Config};
//! use lawchat_relay::storage::{MessageStore, SqliteStorage};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let store: Arc<dyn MessageStore> = Arc::new(SqliteStorage::from_config(&config.persistence)?);
//!     let relay = ChatRelay::from_config(&config, store)?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod metrics;
pub mod relay;
pub mod request;
pub mod retry;
pub mod server;
pub mod storage;
pub mod stream;
pub mod tracker;
pub mod turn;

// Re-export commonly used types
pub use config::Config;
pub use error::{RelayError, Result};
pub use request::{ChatRequest, RequestNormalizer};
pub use stream::StreamEvent;
pub use turn::{ChatRelay, ChatTurn};

#[cfg(test)]
pub mod test_utils;
