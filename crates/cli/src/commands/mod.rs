pub mod breaker;
pub mod config;
pub mod conversations;
pub mod doctor;
pub mod migrate;
pub mod status;

use std::future::Future;
use std::sync::Arc;

use pricebot_core::clock::{Clock, SystemClock};
use pricebot_core::config::{AppConfig, LoadOptions, StoreBackend};
use pricebot_core::resilience::CircuitBreakerRegistry;
use pricebot_core::store::SharedStore;
use pricebot_db::{connect_from_config, migrations, SqlSharedStore};
use serde::Serialize;

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_RUNTIME: u8 = 3;
pub const EXIT_STORE: u8 = 4;
pub const EXIT_MIGRATION: u8 = 5;
pub const EXIT_OPERATION: u8 = 6;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with_data(command, message, None)
    }

    pub fn success_with_data(
        command: &str,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\
             \"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// A failed step: error class, message, exit code.
pub(crate) type Failure = (&'static str, String, u8);

pub(crate) struct Completed {
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl Completed {
    pub fn message(message: impl Into<String>) -> Self {
        Self { message: message.into(), data: None }
    }
}

/// Loads config, then drives `body` on a fresh current-thread runtime and
/// folds the outcome into a `CommandResult`.
pub(crate) fn execute<F, Fut>(command: &'static str, body: F) -> CommandResult
where
    F: FnOnce(AppConfig) -> Fut,
    Fut: Future<Output = Result<Completed, Failure>>,
{
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                command,
                "config_validation",
                format!("configuration issue: {error}"),
                EXIT_CONFIG,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                EXIT_RUNTIME,
            );
        }
    };

    match runtime.block_on(body(config)) {
        Ok(done) => CommandResult::success_with_data(command, done.message, done.data),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(command, error_class, message, exit_code)
        }
    }
}

/// Opens the shared sqlite store, applying pending migrations first.
///
/// The memory backend is refused: a CLI process has its own empty memory
/// store, so reading or changing it would not affect any running worker.
pub(crate) async fn open_shared_store(config: &AppConfig) -> Result<Arc<SqlSharedStore>, Failure> {
    if config.store.backend == StoreBackend::Memory {
        return Err((
            "store_backend",
            "store.backend is `memory`; there is no shared state to operate on".to_string(),
            EXIT_OPERATION,
        ));
    }

    let pool = connect_from_config(&config.store)
        .await
        .map_err(|error| ("store_connectivity", error.to_string(), EXIT_STORE))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| ("migration", error.to_string(), EXIT_MIGRATION))?;
    Ok(Arc::new(SqlSharedStore::with_system_clock(pool)))
}

pub(crate) fn circuit_registry(
    config: &AppConfig,
    store: Arc<dyn SharedStore>,
) -> CircuitBreakerRegistry {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    CircuitBreakerRegistry::new(
        store,
        clock,
        std::time::Duration::from_secs(config.circuit.state_ttl_secs),
        config.circuit.dependencies.clone(),
    )
}

pub(crate) fn operation_failed(error: impl std::fmt::Display) -> Failure {
    ("operation", error.to_string(), EXIT_OPERATION)
}
