//! Command handlers for the relay CLI

pub mod history;

// Serve command handler
pub mod serve {
    use crate::config::Config;
    use crate::error::Result;
    use crate::storage::{MessageStore, SqliteStorage};
    use std::sync::Arc;

    /// Open the store and run the HTTP relay until shutdown
    pub async fn run_serve(config: Config) -> Result<()> {
        let storage = SqliteStorage::from_config(&config.persistence)?;
        let store: Arc<dyn MessageStore> = Arc::new(storage);

        if config.tracker.is_active() {
            tracing::info!(api_base = ?config.tracker.api_base, "Execution tracking enabled");
        } else {
            tracing::info!("Execution tracking disabled");
        }

        crate::server::serve(&config, store).await
    }
}
