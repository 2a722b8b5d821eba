use pricebot_core::config::StoreBackend;
use pricebot_db::{connect_from_config, migrations};

use crate::commands::{execute, CommandResult, Completed, EXIT_MIGRATION, EXIT_STORE};

pub fn run() -> CommandResult {
    execute("migrate", |config| async move {
        if config.store.backend == StoreBackend::Memory {
            return Ok(Completed::message("store.backend is `memory`; nothing to migrate"));
        }

        let pool = connect_from_config(&config.store)
            .await
            .map_err(|error| ("store_connectivity", error.to_string(), EXIT_STORE))?;
        let before = migrations::applied_versions(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), EXIT_MIGRATION))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), EXIT_MIGRATION))?;
        let after = migrations::applied_versions(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), EXIT_MIGRATION))?;
        pool.close().await;

        Ok(Completed::message(format!(
            "applied {} pending migration(s); schema at version {}",
            after.len().saturating_sub(before.len()),
            after.last().copied().unwrap_or_default()
        )))
    })
}
