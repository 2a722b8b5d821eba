use std::sync::Arc;

use pricebot_core::clock::SystemClock;
use pricebot_core::resilience::ConcurrencyManager;

use crate::commands::{execute, open_shared_store, operation_failed, CommandResult, Completed};

/// Drops every registered conversation slot. Queued requests are kept.
pub fn cleanup() -> CommandResult {
    execute("conversations", |config| async move {
        let store = open_shared_store(&config).await?;
        let manager =
            ConcurrencyManager::new(config.concurrency.clone(), store, Arc::new(SystemClock));

        let removed = manager.force_cleanup().await.map_err(operation_failed)?;
        Ok(Completed::message(format!("removed {removed} conversation slot(s)")))
    })
}
