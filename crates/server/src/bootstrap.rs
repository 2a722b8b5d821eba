use std::sync::Arc;
use std::time::Duration;

use pricebot_chat::{GuardedChatSender, HttpChatSender, LogChatSender};
use pricebot_core::clock::{Clock, SystemClock};
use pricebot_core::config::{AppConfig, ConfigError, LoadOptions, StoreBackend};
use pricebot_core::gateway::{ChatSender, Gateway};
use pricebot_core::resilience::{
    CircuitBreakerRegistry, ConcurrencyManager, OperationType, RateLimiter, TimeoutManager,
};
use pricebot_core::store::{InMemoryStore, SharedStore};
use pricebot_db::{connect_from_config, migrations, SqlSharedStore};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::assistant::{HttpIntentParser, HttpPriceSource, PricingAssistant};

pub struct Application {
    pub config: AppConfig,
    pub store: Arc<dyn SharedStore>,
    /// Set on the sqlite backend; used for expired-row purges.
    pub sql_store: Option<Arc<SqlSharedStore>>,
    pub circuits: Arc<CircuitBreakerRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub concurrency: Arc<ConcurrencyManager>,
    pub timeouts: TimeoutManager,
    pub gateway: Arc<Gateway>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("store connection failed: {0}")]
    StoreConnect(#[source] sqlx::Error),
    #[error("store migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("http client setup failed: {0}")]
    HttpClient(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        store_backend = ?config.store.backend,
        "starting application bootstrap"
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (store, sql_store): (Arc<dyn SharedStore>, Option<Arc<SqlSharedStore>>) =
        match config.store.backend {
            StoreBackend::Memory => {
                warn!(
                    event_name = "system.bootstrap.memory_store",
                    correlation_id = "bootstrap",
                    "in-memory store: limits and circuits are not shared across workers"
                );
                let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new(clock.clone()));
                (store, None)
            }
            StoreBackend::Sqlite => {
                let pool =
                    connect_from_config(&config.store).await.map_err(BootstrapError::StoreConnect)?;
                migrations::run_pending(&pool).await.map_err(BootstrapError::Migration)?;
                info!(
                    event_name = "system.bootstrap.store_ready",
                    correlation_id = "bootstrap",
                    "sqlite store connected and migrated"
                );
                let sql_store = Arc::new(SqlSharedStore::new(pool, clock.clone()));
                let store: Arc<dyn SharedStore> = sql_store.clone();
                (store, Some(sql_store))
            }
        };

    let circuits = Arc::new(CircuitBreakerRegistry::new(
        store.clone(),
        clock.clone(),
        Duration::from_secs(config.circuit.state_ttl_secs),
        config.circuit.dependencies.clone(),
    ));
    let rate_limiter =
        Arc::new(RateLimiter::new(config.rate_limit.clone(), store.clone(), clock.clone()));
    let concurrency =
        Arc::new(ConcurrencyManager::new(config.concurrency.clone(), store.clone(), clock));
    let timeouts = TimeoutManager::new(config.timeouts.clone());

    let assistant = PricingAssistant::new(
        Arc::new(HttpIntentParser::new(
            timeouts
                .create_http_client(OperationType::NlpService)
                .map_err(BootstrapError::HttpClient)?,
            &config.services.nlp_base_url,
            config.services.nlp_api_key.clone(),
        )),
        Arc::new(HttpPriceSource::new(
            timeouts
                .create_http_client(OperationType::PriceLookup)
                .map_err(BootstrapError::HttpClient)?,
            &config.services.pricing_api_base_url,
        )),
        &circuits,
        &timeouts,
    );

    let transport: Arc<dyn ChatSender> = match &config.chat.bot_token {
        Some(token) => Arc::new(
            HttpChatSender::new(&config.chat.api_base_url, token.clone(), &timeouts)
                .map_err(BootstrapError::HttpClient)?,
        ),
        None => {
            warn!(
                event_name = "system.bootstrap.chat_noop",
                correlation_id = "bootstrap",
                "no chat bot token configured; replies will only be logged"
            );
            Arc::new(LogChatSender)
        }
    };
    let sender = Arc::new(GuardedChatSender::new(transport, &circuits, &timeouts));

    let gateway = Arc::new(Gateway::new(
        concurrency.clone(),
        rate_limiter.clone(),
        Arc::new(assistant),
        sender,
        config.chat.locale,
    ));

    info!(
        event_name = "system.bootstrap.complete",
        correlation_id = "bootstrap",
        "application bootstrap complete"
    );

    Ok(Application {
        config,
        store,
        sql_store,
        circuits,
        rate_limiter,
        concurrency,
        timeouts,
        gateway,
    })
}

/// Periodic housekeeping: evicts idle conversation slots and purges expired
/// store rows.
pub fn spawn_maintenance(app: &Application) -> JoinHandle<()> {
    let concurrency = app.concurrency.clone();
    let gateway = app.gateway.clone();
    let sql_store = app.sql_store.clone();
    let period = Duration::from_secs(app.config.server.sweep_interval_secs.max(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_maintenance(&concurrency, &gateway, sql_store.as_deref()).await;
        }
    })
}

/// Slots freed by the sweep are handed to queued messages right away, so a
/// backlog does not wait for the next inbound update.
pub async fn run_maintenance(
    concurrency: &ConcurrencyManager,
    gateway: &Gateway,
    sql_store: Option<&SqlSharedStore>,
) {
    match concurrency.sweep_stale().await {
        Ok(0) => {}
        Ok(evicted) => info!(
            event_name = "system.maintenance.swept",
            correlation_id = "maintenance",
            evicted,
            "evicted idle conversation slots"
        ),
        Err(error) => warn!(
            event_name = "system.maintenance.sweep_failed",
            correlation_id = "maintenance",
            error = %error,
            "stale conversation sweep failed"
        ),
    }

    let drained = gateway.drain_queue().await;
    if drained > 0 {
        info!(
            event_name = "system.maintenance.drained",
            correlation_id = "maintenance",
            drained,
            "queued conversations resumed"
        );
    }

    if let Some(sql_store) = sql_store {
        if let Err(error) = sql_store.purge_expired().await {
            warn!(
                event_name = "system.maintenance.purge_failed",
                correlation_id = "maintenance",
                error = %error,
                "expired store row purge failed"
            );
        }
    }
}
