use std::collections::BTreeSet;
use std::sync::Arc;

use pricebot_core::clock::SystemClock;
use pricebot_core::resilience::circuit_breaker::{CHAT_TRANSPORT, NLP_SERVICE, PRICING_API};
use pricebot_core::resilience::{ConcurrencyManager, RateLimiter};
use pricebot_core::store::SharedStore;
use serde_json::json;

use crate::commands::{
    circuit_registry, execute, open_shared_store, operation_failed, CommandResult, Completed,
};

/// Snapshot of every shared component, as the running workers see it.
pub fn run() -> CommandResult {
    execute("status", |config| async move {
        let store: Arc<dyn SharedStore> = open_shared_store(&config).await?;

        let registry = circuit_registry(&config, store.clone());
        for name in circuit_names(store.as_ref(), config.circuit.dependencies.keys()).await? {
            registry.breaker(&name);
        }
        let circuits = registry.all_stats().await;
        let open = circuits.iter().filter(|stats| !stats.can_attempt).count();

        let clock = Arc::new(SystemClock);
        let rate_limits = RateLimiter::new(config.rate_limit.clone(), store.clone(), clock.clone())
            .get_rate_limit_stats()
            .await
            .map_err(operation_failed)?;
        let concurrency =
            ConcurrencyManager::new(config.concurrency.clone(), store, clock).get_stats().await;

        let message = format!(
            "{} circuit(s), {open} rejecting calls; {}/{} conversations active; {} queued",
            circuits.len(),
            concurrency.active_conversations,
            concurrency.max_concurrent,
            concurrency.queue_length
        );
        Ok(Completed {
            message,
            data: Some(json!({
                "circuits": circuits,
                "rate_limits": rate_limits,
                "concurrency": concurrency,
            })),
        })
    })
}

/// Built-in dependencies, configured ones, and any circuit with a record in
/// the store.
async fn circuit_names<'a>(
    store: &dyn SharedStore,
    configured: impl Iterator<Item = &'a String>,
) -> Result<BTreeSet<String>, crate::commands::Failure> {
    let mut names: BTreeSet<String> =
        [NLP_SERVICE, PRICING_API, CHAT_TRANSPORT].iter().map(|name| name.to_string()).collect();
    names.extend(configured.cloned());

    for key in store.scan_prefix("circuit:").await.map_err(operation_failed)? {
        let name = key.trim_start_matches("circuit:");
        if !name.is_empty() && !name.contains(':') {
            names.insert(name.to_owned());
        }
    }
    Ok(names)
}
