use std::sync::Arc;

use pricebot_core::store::SharedStore;

use crate::commands::{
    circuit_registry, execute, open_shared_store, operation_failed, CommandResult, Completed,
    EXIT_OPERATION,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerAction {
    Reset,
    Open,
}

/// Forces the named circuit CLOSED (`Reset`) or OPEN (`Open`) for every
/// worker sharing the store.
pub fn run(action: BreakerAction, name: &str) -> CommandResult {
    let name = name.trim().to_owned();
    execute("breaker", |config| async move {
        if name.is_empty() || name.contains(':') {
            return Err((
                "invalid_argument",
                format!("`{name}` is not a valid circuit name"),
                EXIT_OPERATION,
            ));
        }

        let store: Arc<dyn SharedStore> = open_shared_store(&config).await?;
        let registry = circuit_registry(&config, store);
        let breaker = registry.breaker(&name);

        match action {
            BreakerAction::Reset => breaker.reset().await.map_err(operation_failed)?,
            BreakerAction::Open => breaker.force_open().await.map_err(operation_failed)?,
        }

        let stats = breaker.get_stats().await;
        Ok(Completed {
            message: format!("circuit `{name}` is now {}", stats.state.as_str()),
            data: serde_json::to_value(&stats).ok(),
        })
    })
}
