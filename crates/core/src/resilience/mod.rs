//! Failure isolation and load control for calls to flaky dependencies.

pub mod circuit_breaker;
pub mod concurrency;
pub mod rate_limit;
pub mod timeout;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

pub use circuit_breaker::{
    BreakerError, BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitStats, HealthStatus,
};
pub use concurrency::{
    ConcurrencyConfig, ConcurrencyManager, ConcurrencyStats, OverflowPolicy, Priority,
    QueuedRequest,
};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimitStats, RateLimiter};
pub use timeout::{OperationType, TimeoutConfig, TimeoutFailure, TimeoutManager};

use crate::errors::{ApplicationError, CircuitOpenError, TimeoutError};

#[derive(Debug, Error)]
pub enum DependencyError<E> {
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),
    #[error(transparent)]
    TimedOut(TimeoutError),
    #[error("{0}")]
    Failed(E),
}

impl<E: std::fmt::Display> DependencyError<E> {
    pub fn into_application(self) -> ApplicationError {
        match self {
            Self::CircuitOpen(error) => ApplicationError::CircuitOpen(error),
            Self::TimedOut(error) => ApplicationError::Timeout(error),
            Self::Failed(error) => ApplicationError::Integration(error.to_string()),
        }
    }
}

/// One outbound dependency behind its breaker and timeout budget.
///
/// Each attempt runs under the operation's budget inside the breaker, so a
/// timeout counts as a breaker failure. Failed attempts are retried with the
/// operation's backoff through [`TimeoutManager::retry_with_backoff`]. An open
/// circuit is never retried, and a failure that trips the breaker is returned
/// as is.
#[derive(Clone)]
pub struct GuardedDependency {
    breaker: Arc<CircuitBreaker>,
    timeouts: TimeoutManager,
    operation: OperationType,
    max_attempts: u32,
}

impl GuardedDependency {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        timeouts: TimeoutManager,
        operation: OperationType,
        max_attempts: u32,
    ) -> Self {
        Self { breaker, timeouts, operation, max_attempts: max_attempts.max(1) }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn operation(&self) -> OperationType {
        self.operation
    }

    pub async fn call<F, Fut, T, E>(&self, mut call: F) -> Result<T, DependencyError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let breaker: &CircuitBreaker = &self.breaker;
        let timeouts = &self.timeouts;
        let operation = self.operation;

        let outcome = timeouts
            .retry_with_backoff(
                move || {
                    let future = call();
                    async move {
                        let outcome =
                            breaker.execute(|| timeouts.run_within_budget(future, operation)).await;
                        match outcome {
                            Ok(value) => Ok(value),
                            Err(BreakerError::Open(error)) => Err(Attempt {
                                error: DependencyError::CircuitOpen(error),
                                retryable: false,
                            }),
                            Err(BreakerError::Inner(failure)) => {
                                // A failure that tripped the breaker is final.
                                let tripped = breaker.get_state().await == BreakerState::Open;
                                Err(Attempt { error: failure.into(), retryable: !tripped })
                            }
                        }
                    }
                },
                operation,
                self.max_attempts,
                |attempt: &Attempt<E>| attempt.retryable,
            )
            .await;

        outcome.map_err(|attempt| {
            debug!(
                event_name = "resilience.dependency.failed",
                dependency = self.breaker.name(),
                operation = %self.operation,
                error = %attempt.error,
                "guarded dependency call failed"
            );
            attempt.error
        })
    }
}

impl<E> From<TimeoutFailure<E>> for DependencyError<E> {
    fn from(failure: TimeoutFailure<E>) -> Self {
        match failure {
            TimeoutFailure::TimedOut(error) => Self::TimedOut(error),
            TimeoutFailure::Inner(error) => Self::Failed(error),
        }
    }
}

/// One failed attempt and whether another one may follow.
struct Attempt<E> {
    error: DependencyError<E>,
    retryable: bool,
}

impl<E: fmt::Display> fmt::Display for Attempt<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}
