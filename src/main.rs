//! Lawchat relay - streaming chat relay CLI
//!
#![doc = "Main entry point for the lawchat relay."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lawchat_relay::cli::{Cli, Commands};
use lawchat_relay::commands;
use lawchat_relay::config::{Config, LoggingConfig};
use lawchat_relay::storage::SqliteStorage;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Initialize tracing once the log format is known
    init_tracing(&config.logging, cli.verbose);

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Serve { .. } => {
            tracing::info!(bind = %config.server.bind, "Starting chat relay");
            lawchat_relay::metrics::init_metrics_exporter();
            commands::serve::run_serve(config).await?;
            Ok(())
        }
        Commands::History { command } => {
            let storage = SqliteStorage::from_config(&config.persistence)?;
            commands::history::handle_history(command, &storage).await?;
            Ok(())
        }
    }
}

/// Initialize tracing
///
/// `RUST_LOG` wins over the configured filter; `--verbose` raises the
/// default to debug.
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let default_filter = if verbose {
        "lawchat_relay=debug".to_string()
    } else {
        logging.filter.clone()
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
