use std::sync::Arc;

use async_trait::async_trait;
use pricebot_core::gateway::{ChatSendError, ChatSender};
use pricebot_core::resilience::circuit_breaker::CHAT_TRANSPORT;
use pricebot_core::resilience::{
    CircuitBreakerRegistry, DependencyError, GuardedDependency, OperationType, TimeoutManager,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Sends replies through the bot API's `sendMessage` method.
pub struct HttpChatSender {
    client: reqwest::Client,
    api_base_url: String,
    bot_token: SecretString,
}

impl HttpChatSender {
    /// Builds a sender whose client is bounded by the `webhook` budget.
    pub fn new(
        api_base_url: impl Into<String>,
        bot_token: SecretString,
        timeouts: &TimeoutManager,
    ) -> Result<Self, reqwest::Error> {
        let client = timeouts.create_http_client(OperationType::Webhook)?;
        Ok(Self::with_client(client, api_base_url, bot_token))
    }

    pub fn with_client(
        client: reqwest::Client,
        api_base_url: impl Into<String>,
        bot_token: SecretString,
    ) -> Self {
        let api_base_url = api_base_url.into().trim_end_matches('/').to_owned();
        Self { client, api_base_url, bot_token }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base_url, self.bot_token.expose_secret())
    }
}

#[async_trait]
impl ChatSender for HttpChatSender {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChatSendError> {
        let response = self
            .client
            .post(self.endpoint("sendMessage"))
            .json(&SendMessageRequest { chat_id, text })
            .send()
            .await
            // The URL embeds the token; keep it out of the error text.
            .map_err(|error| ChatSendError::Transport(error.without_url().to_string()))?;

        let status = response.status();
        let body = response.json::<ApiResponse>().await.unwrap_or_default();
        if status.is_success() && body.ok {
            debug!(event_name = "chat.message.sent", chat_id, "reply delivered");
            return Ok(());
        }

        Err(ChatSendError::Rejected(
            body.description.unwrap_or_else(|| format!("status {}", status.as_u16())),
        ))
    }
}

/// Logs replies instead of sending them. Used when no bot token is set.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogChatSender;

#[async_trait]
impl ChatSender for LogChatSender {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChatSendError> {
        info!(event_name = "chat.message.logged", chat_id, text, "reply (no transport configured)");
        Ok(())
    }
}

/// Routes outbound replies through the `chat_transport` breaker and the
/// `webhook` budget.
pub struct GuardedChatSender {
    inner: Arc<dyn ChatSender>,
    guard: GuardedDependency,
}

impl GuardedChatSender {
    pub fn new(
        inner: Arc<dyn ChatSender>,
        circuits: &CircuitBreakerRegistry,
        timeouts: &TimeoutManager,
    ) -> Self {
        let guard = GuardedDependency::new(
            circuits.breaker(CHAT_TRANSPORT),
            timeouts.clone(),
            OperationType::Webhook,
            timeouts.config().default_max_attempts,
        );
        Self { inner, guard }
    }
}

#[async_trait]
impl ChatSender for GuardedChatSender {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChatSendError> {
        self.guard
            .call(|| self.inner.send_message(chat_id, text))
            .await
            .map_err(|error| match error {
                DependencyError::Failed(error) => error,
                DependencyError::CircuitOpen(error) => ChatSendError::Transport(error.to_string()),
                DependencyError::TimedOut(error) => ChatSendError::Transport(error.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use pricebot_core::clock::ManualClock;
    use pricebot_core::gateway::{ChatSendError, ChatSender};
    use pricebot_core::resilience::{
        BreakerState, CircuitBreakerRegistry, OperationType, TimeoutConfig, TimeoutManager,
    };
    use pricebot_core::store::InMemoryStore;
    use secrecy::SecretString;

    use super::{GuardedChatSender, HttpChatSender, LogChatSender};

    fn token() -> SecretString {
        SecretString::from("123456:abc-def".to_owned())
    }

    #[test]
    fn endpoint_embeds_token_and_method() {
        let sender = HttpChatSender::with_client(
            reqwest::Client::new(),
            "https://api.telegram.org/",
            token(),
        );

        assert_eq!(
            sender.endpoint("sendMessage"),
            "https://api.telegram.org/bot123456:abc-def/sendMessage"
        );
    }

    #[tokio::test]
    async fn unreachable_api_is_a_transport_error_without_the_token() {
        let mut config = TimeoutConfig::default();
        *config.budgets_ms.get_mut(OperationType::Webhook) = 500;
        let timeouts = TimeoutManager::new(config);
        let sender =
            HttpChatSender::new("http://127.0.0.1:9", token(), &timeouts).expect("client");

        let error = sender.send_message("1", "hi").await.expect_err("nothing listens on port 9");

        match error {
            ChatSendError::Transport(message) => assert!(!message.contains("abc-def")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn log_sender_always_succeeds() {
        LogChatSender.send_message("1", "hello").await.expect("logged");
    }

    #[derive(Default)]
    struct DownTransport {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChatSender for DownTransport {
        async fn send_message(&self, _chat_id: &str, _text: &str) -> Result<(), ChatSendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ChatSendError::Transport("connection refused".to_owned()))
        }
    }

    #[tokio::test]
    async fn repeated_send_failures_open_the_chat_transport_circuit() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let circuits =
            CircuitBreakerRegistry::new(store, clock, Duration::from_secs(3_600), BTreeMap::new());
        let mut config = TimeoutConfig::default();
        config.backoff.get_mut(OperationType::Webhook).base_delay_ms = 0;
        let transport = Arc::new(DownTransport::default());
        let sender =
            GuardedChatSender::new(transport.clone(), &circuits, &TimeoutManager::new(config));

        // Three attempts per send against a failure threshold of five.
        let first = sender.send_message("1", "hi").await.expect_err("transport is down");
        assert!(matches!(
            first,
            ChatSendError::Transport(ref message) if message == "connection refused"
        ));
        sender.send_message("1", "hi").await.expect_err("transport is down");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 5);
        assert_eq!(circuits.breaker("chat_transport").get_state().await, BreakerState::Open);

        let rejected = sender.send_message("1", "hi").await.expect_err("circuit is open");
        assert!(rejected.to_string().contains("chat_transport"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 5);
    }
}
