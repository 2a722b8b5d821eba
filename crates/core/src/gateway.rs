//! Per-event pipeline: admit, rate-limit, handle, reply, release, drain.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ApplicationError;
use crate::messages::{Locale, Notice};
use crate::resilience::{ConcurrencyManager, Priority, RateLimiter};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub user_id: String,
    pub chat_id: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum ChatSendError {
    #[error("chat transport rejected message: {0}")]
    Rejected(String),
    #[error("chat transport unreachable: {0}")]
    Transport(String),
}

#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChatSendError>;
}

#[async_trait]
pub trait ConversationHandler: Send + Sync {
    async fn handle(
        &self,
        message: &InboundMessage,
        context: &RequestContext,
    ) -> Result<String, ApplicationError>;
}

pub struct RequestContext {
    pub correlation_id: String,
    pub user_id: String,
    /// Handlers skip optional enrichment while this is set.
    pub under_backpressure: bool,
    concurrency: Arc<ConcurrencyManager>,
}

impl RequestContext {
    /// Marks the conversation as active so long handlers are not swept.
    pub async fn keep_alive(&self) {
        self.concurrency.touch_conversation(&self.user_id).await;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    Capacity,
    RateLimited,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayOutcome {
    Replied,
    /// The handler failed; the user got a localized failure notice.
    Failed(Notice),
    Queued,
    Rejected(RejectReason),
}

pub struct Gateway {
    concurrency: Arc<ConcurrencyManager>,
    rate_limiter: Arc<RateLimiter>,
    handler: Arc<dyn ConversationHandler>,
    sender: Arc<dyn ChatSender>,
    locale: Locale,
}

impl Gateway {
    pub fn new(
        concurrency: Arc<ConcurrencyManager>,
        rate_limiter: Arc<RateLimiter>,
        handler: Arc<dyn ConversationHandler>,
        sender: Arc<dyn ChatSender>,
        locale: Locale,
    ) -> Self {
        Self { concurrency, rate_limiter, handler, sender, locale }
    }

    pub async fn handle_event(&self, message: InboundMessage) -> GatewayOutcome {
        let outcome = self.process(&message).await;
        self.drain_queue().await;
        outcome
    }

    async fn process(&self, message: &InboundMessage) -> GatewayOutcome {
        let correlation_id = Uuid::new_v4().to_string();

        if !self.concurrency.register_conversation(&message.user_id).await {
            return self.defer(message, &correlation_id).await;
        }

        if let Err(error) = self.rate_limiter.enforce(&message.user_id).await {
            self.concurrency.unregister_conversation(&message.user_id).await;
            let interface = ApplicationError::from(error).into_interface(&correlation_id);
            self.reply(message, interface.user_message(self.locale), &correlation_id).await;
            return GatewayOutcome::Rejected(RejectReason::RateLimited);
        }

        let context = RequestContext {
            correlation_id: correlation_id.clone(),
            user_id: message.user_id.clone(),
            under_backpressure: self.concurrency.is_under_backpressure().await,
            concurrency: self.concurrency.clone(),
        };

        let outcome = match self.handler.handle(message, &context).await {
            Ok(answer) => {
                self.reply(message, &answer, &correlation_id).await;
                GatewayOutcome::Replied
            }
            Err(error) => {
                warn!(
                    event_name = "gateway.handler.failed",
                    correlation_id = %correlation_id,
                    user_id = %message.user_id,
                    error = %error,
                    "conversation handler failed"
                );
                let notice = error.notice();
                let interface = error.into_interface(&correlation_id);
                self.reply(message, interface.user_message(self.locale), &correlation_id).await;
                GatewayOutcome::Failed(notice)
            }
        };

        self.concurrency.unregister_conversation(&message.user_id).await;
        outcome
    }

    async fn defer(&self, message: &InboundMessage, correlation_id: &str) -> GatewayOutcome {
        let queued = match serde_json::to_value(message) {
            Ok(payload) => self.concurrency.queue_request(payload, Priority::Normal).await.is_ok(),
            Err(_) => false,
        };

        if queued {
            info!(
                event_name = "gateway.event.queued",
                correlation_id,
                user_id = %message.user_id,
                "at capacity; message queued"
            );
            self.reply(message, Notice::Queued.text(self.locale), correlation_id).await;
            GatewayOutcome::Queued
        } else {
            info!(
                event_name = "gateway.event.rejected",
                correlation_id,
                user_id = %message.user_id,
                "at capacity and queue full"
            );
            self.reply(message, Notice::Busy.text(self.locale), correlation_id).await;
            GatewayOutcome::Rejected(RejectReason::Capacity)
        }
    }

    /// Handles whatever the queue releases for the capacity freed so far.
    /// Drained messages that cannot be admitted go back through `defer`.
    /// Returns how many queued requests were taken off the queue.
    pub async fn drain_queue(&self) -> usize {
        let drained = self.concurrency.process_queued_requests().await;
        let count = drained.len();
        for request in drained {
            match serde_json::from_value::<InboundMessage>(request.payload) {
                Ok(message) => {
                    debug!(
                        event_name = "gateway.queue.drained",
                        request_id = %request.id,
                        user_id = %message.user_id,
                        "handling queued message"
                    );
                    self.process(&message).await;
                }
                Err(error) => warn!(
                    event_name = "gateway.queue.undecodable",
                    request_id = %request.id,
                    error = %error,
                    "dropping queued payload"
                ),
            }
        }
        count
    }

    async fn reply(&self, message: &InboundMessage, text: &str, correlation_id: &str) {
        if let Err(error) = self.sender.send_message(&message.chat_id, text).await {
            warn!(
                event_name = "gateway.reply.failed",
                correlation_id,
                chat_id = %message.chat_id,
                error = %error,
                "could not deliver reply"
            );
        }
    }
}
