//! Command-line interface definition for the chat relay
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for serving the relay and inspecting chat history.

use clap::{Parser, Subcommand};

/// Lawchat relay - streaming chat relay for a legal research assistant
///
/// Forwards chat messages to a workflow webhook and streams the answer
/// back to the browser as Server-Sent Events.
#[derive(Parser, Debug, Clone)]
#[command(name = "lawchat-relay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Override the SQLite database path
    #[arg(long, env = "LAWCHAT_DB_PATH")]
    pub db_path: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the HTTP relay server
    Serve {
        /// Address to bind (overrides `server.bind`)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Inspect stored chat sessions
    History {
        /// History subcommand
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

/// Chat history subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommand {
    /// List valid chat sessions of a user
    List {
        /// Owning user id
        #[arg(short, long)]
        user: String,
    },

    /// Show the messages of a chat session
    Show {
        /// Chat session id
        id: String,
    },

    /// Delete a chat session and its messages
    Delete {
        /// Chat session id
        id: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            json_logs: false,
            db_path: None,
            command: Commands::Serve { bind: None },
        }
    }
}
