//! Per-operation time budgets and retry with exponential backoff.
//!
//! Budgets live in one table keyed by [`OperationType`] so worst-case
//! end-to-end latency is the sum of per-hop entries here, not something
//! scattered over call sites.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::TimeoutError;
use crate::messages::{Locale, Notice};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    NlpService,
    PriceLookup,
    Analytics,
    Webhook,
    Default,
}

impl OperationType {
    pub const ALL: [OperationType; 5] =
        [Self::NlpService, Self::PriceLookup, Self::Analytics, Self::Webhook, Self::Default];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NlpService => "nlp_service",
            Self::PriceLookup => "price_lookup",
            Self::Analytics => "analytics",
            Self::Webhook => "webhook",
            Self::Default => "default",
        }
    }

    /// Unknown names resolve to [`OperationType::Default`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "nlp_service" | "nlp" | "ai" => Self::NlpService,
            "price_lookup" | "prices" => Self::PriceLookup,
            "analytics" => Self::Analytics,
            "webhook" => Self::Webhook,
            _ => Self::Default,
        }
    }

    pub fn timeout_notice(self) -> Notice {
        match self {
            Self::NlpService => Notice::AssistantSlow,
            Self::PriceLookup => Notice::PriceLookupSlow,
            Self::Analytics => Notice::AnalyticsSlow,
            Self::Webhook => Notice::WebhookSlow,
            Self::Default => Notice::GenericSlow,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per operation type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerOperation<T> {
    pub nlp_service: T,
    pub price_lookup: T,
    pub analytics: T,
    pub webhook: T,
    pub default: T,
}

impl<T> PerOperation<T> {
    pub fn get(&self, operation: OperationType) -> &T {
        match operation {
            OperationType::NlpService => &self.nlp_service,
            OperationType::PriceLookup => &self.price_lookup,
            OperationType::Analytics => &self.analytics,
            OperationType::Webhook => &self.webhook,
            OperationType::Default => &self.default,
        }
    }

    pub fn get_mut(&mut self, operation: OperationType) -> &mut T {
        match operation {
            OperationType::NlpService => &mut self.nlp_service,
            OperationType::PriceLookup => &mut self.price_lookup,
            OperationType::Analytics => &mut self.analytics,
            OperationType::Webhook => &mut self.webhook,
            OperationType::Default => &mut self.default,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub budgets_ms: PerOperation<u64>,
    pub backoff: PerOperation<BackoffPolicy>,
    pub max_backoff_ms: u64,
    pub connect_timeout_cap_ms: u64,
    pub default_max_attempts: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            budgets_ms: PerOperation {
                nlp_service: 8_000,
                price_lookup: 3_000,
                analytics: 5_000,
                webhook: 2_500,
                default: 5_000,
            },
            backoff: PerOperation {
                nlp_service: BackoffPolicy { base_delay_ms: 1_000, multiplier: 2.0 },
                price_lookup: BackoffPolicy { base_delay_ms: 250, multiplier: 1.5 },
                analytics: BackoffPolicy { base_delay_ms: 1_000, multiplier: 2.0 },
                webhook: BackoffPolicy { base_delay_ms: 100, multiplier: 2.0 },
                default: BackoffPolicy { base_delay_ms: 500, multiplier: 2.0 },
            },
            max_backoff_ms: 10_000,
            connect_timeout_cap_ms: 5_000,
            default_max_attempts: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum TimeoutFailure<E> {
    #[error(transparent)]
    TimedOut(TimeoutError),
    #[error("{0}")]
    Inner(E),
}

impl<E> TimeoutFailure<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperationTimeout {
    pub operation: OperationType,
    pub budget_ms: u64,
    pub connect_timeout_ms: u64,
    pub backoff_base_delay_ms: u64,
    pub backoff_multiplier: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimeoutStats {
    pub operations: Vec<OperationTimeout>,
    pub default_max_attempts: u32,
    pub max_backoff_ms: u64,
    pub connect_timeout_cap_ms: u64,
}

#[derive(Clone, Debug, Default)]
pub struct TimeoutManager {
    config: TimeoutConfig,
}

impl TimeoutManager {
    pub fn new(config: TimeoutConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    pub fn get_timeout(&self, operation: OperationType) -> u64 {
        *self.config.budgets_ms.get(operation)
    }

    pub fn get_timeout_by_name(&self, name: &str) -> u64 {
        self.get_timeout(OperationType::from_name(name))
    }

    pub fn budget(&self, operation: OperationType) -> Duration {
        Duration::from_millis(self.get_timeout(operation))
    }

    pub fn connect_timeout(&self, operation: OperationType) -> Duration {
        Duration::from_millis(self.get_timeout(operation).min(self.config.connect_timeout_cap_ms))
    }

    /// Delay before retry number `retry_index` (0 for the first retry).
    pub fn backoff_delay(&self, operation: OperationType, retry_index: u32) -> Duration {
        let policy = self.config.backoff.get(operation);
        let exponent = i32::try_from(retry_index.min(16)).unwrap_or(16);
        let delay_ms = (policy.base_delay_ms as f64) * policy.multiplier.max(1.0).powi(exponent);
        let capped = delay_ms.min(self.config.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Runs `call` under the operation's budget, making at most
    /// `max_attempts` attempts in total. The last failure is returned.
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        call: F,
        operation: OperationType,
        max_attempts: u32,
    ) -> Result<T, TimeoutFailure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.execute_with_retry_filter(call, operation, max_attempts, |_| true).await
    }

    /// Same as [`execute_with_timeout`](Self::execute_with_timeout) but stops
    /// retrying as soon as `should_retry` returns false for a failure.
    pub async fn execute_with_retry_filter<F, Fut, T, E, R>(
        &self,
        mut call: F,
        operation: OperationType,
        max_attempts: u32,
        should_retry: R,
    ) -> Result<T, TimeoutFailure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        R: Fn(&TimeoutFailure<E>) -> bool,
    {
        self.retry_with_backoff(
            move || self.run_within_budget(call(), operation),
            operation,
            max_attempts,
            should_retry,
        )
        .await
    }

    /// The retry loop behind every guarded call. `attempt` is expected to
    /// apply its own budget; this only counts attempts and sleeps the
    /// operation's backoff between them.
    pub async fn retry_with_backoff<F, Fut, T, X, R>(
        &self,
        mut attempt_fn: F,
        operation: OperationType,
        max_attempts: u32,
        should_retry: R,
    ) -> Result<T, X>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, X>>,
        X: std::fmt::Display,
        R: Fn(&X) -> bool,
    {
        let attempts = max_attempts.max(1);
        let mut attempt = 0_u32;

        loop {
            attempt += 1;
            let failure = match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            if attempt >= attempts || !should_retry(&failure) {
                warn!(
                    event_name = "resilience.timeout.exhausted",
                    operation = %operation,
                    attempt,
                    max_attempts = attempts,
                    error = %failure,
                    "outbound call failed; giving up"
                );
                return Err(failure);
            }

            let delay = self.backoff_delay(operation, attempt - 1);
            debug!(
                event_name = "resilience.timeout.retry",
                operation = %operation,
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "outbound call failed; retrying after backoff"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// One attempt, no retry.
    pub async fn run_within_budget<Fut, T, E>(
        &self,
        future: Fut,
        operation: OperationType,
    ) -> Result<T, TimeoutFailure<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.budget(operation), future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(TimeoutFailure::Inner(error)),
            Err(_) => Err(TimeoutFailure::TimedOut(TimeoutError {
                operation,
                budget_ms: self.get_timeout(operation),
            })),
        }
    }

    pub fn get_timeout_message(&self, operation: OperationType, locale: Locale) -> &'static str {
        operation.timeout_notice().text(locale)
    }

    pub fn create_http_client(
        &self,
        operation: OperationType,
    ) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(self.budget(operation))
            .connect_timeout(self.connect_timeout(operation))
            .build()
    }

    pub fn get_all_timeouts(&self) -> PerOperation<u64> {
        self.config.budgets_ms.clone()
    }

    pub fn get_timeout_stats(&self) -> TimeoutStats {
        let operations = OperationType::ALL
            .into_iter()
            .map(|operation| {
                let backoff = self.config.backoff.get(operation);
                OperationTimeout {
                    operation,
                    budget_ms: self.get_timeout(operation),
                    connect_timeout_ms: self.connect_timeout(operation).as_millis() as u64,
                    backoff_base_delay_ms: backoff.base_delay_ms,
                    backoff_multiplier: backoff.multiplier,
                }
            })
            .collect();

        TimeoutStats {
            operations,
            default_max_attempts: self.config.default_max_attempts,
            max_backoff_ms: self.config.max_backoff_ms,
            connect_timeout_cap_ms: self.config.connect_timeout_cap_ms,
        }
    }
}
