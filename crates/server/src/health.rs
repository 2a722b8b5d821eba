use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use pricebot_core::gateway::Gateway;
use pricebot_core::resilience::{
    BreakerState, CircuitBreakerRegistry, CircuitStats, ConcurrencyManager, ConcurrencyStats,
    HealthStatus, RateLimitStats, RateLimiter, TimeoutManager,
};
use pricebot_core::resilience::timeout::TimeoutStats;
use pricebot_core::store::SharedStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::bootstrap::Application;
use crate::webhook;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SharedStore>,
    pub circuits: Arc<CircuitBreakerRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub concurrency: Arc<ConcurrencyManager>,
    pub timeouts: TimeoutManager,
    pub gateway: Arc<Gateway>,
}

impl From<&Application> for AppState {
    fn from(app: &Application) -> Self {
        Self {
            store: app.store.clone(),
            circuits: app.circuits.clone(),
            rate_limiter: app.rate_limiter.clone(),
            concurrency: app.concurrency.clone(),
            timeouts: app.timeouts.clone(),
            gateway: app.gateway.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConcurrencySnapshot {
    pub active_conversations: usize,
    pub max_concurrent: usize,
    pub under_backpressure: bool,
    pub accepting_new: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: HealthCheck,
    pub circuits: HealthStatus,
    pub open_circuits: Vec<String>,
    pub concurrency: ConcurrencySnapshot,
    pub checked_at: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatsResponse {
    pub circuits: Vec<CircuitStats>,
    /// Absent while the store cannot be read.
    pub rate_limits: Option<RateLimitStats>,
    pub concurrency: ConcurrencyStats,
    pub timeouts: TimeoutStats,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/webhook", post(webhook::receive))
        .with_state(state)
}

pub async fn serve<S>(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: S,
) -> std::io::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    info!(
        event_name = "system.http.start",
        correlation_id = "bootstrap",
        bind_address = %listener.local_addr()?,
        "http endpoint started"
    );
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store = store_check(state.store.as_ref()).await;
    let store_ready = store.status == "ready";

    let circuits = state.circuits.all_stats().await;
    let open_circuits = circuits
        .iter()
        .filter(|stats| stats.state != BreakerState::Closed)
        .map(|stats| stats.name.clone())
        .collect::<Vec<_>>();
    let circuit_health = state.circuits.aggregate_health().await;

    let concurrency = state.concurrency.get_stats().await;
    let status = if !store_ready {
        "unavailable"
    } else if circuit_health != HealthStatus::Healthy {
        "degraded"
    } else {
        "ok"
    };

    let payload = HealthResponse {
        status,
        store,
        circuits: circuit_health,
        open_circuits,
        concurrency: ConcurrencySnapshot {
            active_conversations: concurrency.active_conversations,
            max_concurrent: concurrency.max_concurrent,
            under_backpressure: concurrency.under_backpressure,
            accepting_new: concurrency.accepting_new,
        },
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if store_ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let rate_limits = match state.rate_limiter.get_rate_limit_stats().await {
        Ok(stats) => Some(stats),
        Err(error) => {
            warn!(
                event_name = "system.stats.rate_limit_unavailable",
                error = %error,
                "rate limit stats unavailable"
            );
            None
        }
    };

    Json(StatsResponse {
        circuits: state.circuits.all_stats().await,
        rate_limits,
        concurrency: state.concurrency.get_stats().await,
        timeouts: state.timeouts.get_timeout_stats(),
    })
}

async fn store_check(store: &dyn SharedStore) -> HealthCheck {
    match store.ping().await {
        Ok(()) => HealthCheck { status: "ready", detail: "store reachable".to_string() },
        Err(error) => HealthCheck { status: "unavailable", detail: error.to_string() },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use pricebot_core::clock::ManualClock;
    use pricebot_core::errors::ApplicationError;
    use pricebot_core::gateway::{
        ChatSendError, ChatSender, ConversationHandler, Gateway, InboundMessage, RequestContext,
    };
    use pricebot_core::messages::Locale;
    use pricebot_core::resilience::{
        CircuitBreakerRegistry, ConcurrencyConfig, ConcurrencyManager, RateLimitConfig,
        RateLimiter, TimeoutConfig, TimeoutManager,
    };
    use pricebot_core::store::InMemoryStore;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    use super::{router, AppState};

    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub(crate) sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatSender for RecordingSender {
        async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChatSendError> {
            self.sent.lock().await.push((chat_id.to_owned(), text.to_owned()));
            Ok(())
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl ConversationHandler for EchoHandler {
        async fn handle(
            &self,
            message: &InboundMessage,
            _context: &RequestContext,
        ) -> Result<String, ApplicationError> {
            Ok(format!("echo: {}", message.text))
        }
    }

    pub(crate) struct Fixture {
        pub(crate) state: AppState,
        pub(crate) store: Arc<InMemoryStore>,
        pub(crate) sender: Arc<RecordingSender>,
    }

    pub(crate) fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let circuits = Arc::new(CircuitBreakerRegistry::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(3_600),
            Default::default(),
        ));
        let rate_limiter =
            Arc::new(RateLimiter::new(RateLimitConfig::default(), store.clone(), clock.clone()));
        let concurrency = Arc::new(ConcurrencyManager::new(
            ConcurrencyConfig::default(),
            store.clone(),
            clock,
        ));
        let sender = Arc::new(RecordingSender::default());
        let gateway = Arc::new(Gateway::new(
            concurrency.clone(),
            rate_limiter.clone(),
            Arc::new(EchoHandler),
            sender.clone(),
            Locale::En,
        ));

        let state = AppState {
            store: store.clone(),
            circuits,
            rate_limiter,
            concurrency,
            timeouts: TimeoutManager::new(TimeoutConfig::default()),
            gateway,
        };
        Fixture { state, store, sender }
    }

    pub(crate) async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn get(state: AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        (status, body_json(response).await)
    }

    #[tokio::test]
    async fn health_is_ok_when_store_reachable_and_circuits_closed() {
        let f = fixture();
        f.state.circuits.breaker("pricing_api");

        let (status, body) = get(f.state, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"]["status"], "ready");
        assert_eq!(body["circuits"], "healthy");
        assert_eq!(body["concurrency"]["max_concurrent"], 100);
    }

    #[tokio::test]
    async fn health_is_degraded_while_a_circuit_is_open() {
        let f = fixture();
        f.state.circuits.breaker("nlp_service").force_open().await.expect("force open");

        let (status, body) = get(f.state, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["circuits"], "unhealthy");
        assert_eq!(body["open_circuits"], serde_json::json!(["nlp_service"]));
    }

    #[tokio::test]
    async fn health_is_unavailable_without_store() {
        let f = fixture();
        f.store.set_unavailable(true);

        let (status, body) = get(f.state, "/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unavailable");
        assert_eq!(body["store"]["status"], "unavailable");
    }

    #[tokio::test]
    async fn stats_reports_every_component() {
        let f = fixture();
        f.state.circuits.breaker("pricing_api");
        f.state.rate_limiter.record_request("42").await;

        let (status, body) = get(f.state, "/stats").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["circuits"][0]["name"], "pricing_api");
        assert_eq!(body["circuits"][0]["state"], "closed");
        assert_eq!(body["rate_limits"]["global_count"], 1);
        assert_eq!(body["concurrency"]["active_conversations"], 0);
        assert_eq!(body["timeouts"]["operations"].as_array().map(Vec::len), Some(5));
    }
}
