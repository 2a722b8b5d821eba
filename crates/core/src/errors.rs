use std::time::Duration;

use thiserror::Error;

use crate::messages::{Locale, Notice};
use crate::resilience::timeout::OperationType;
use crate::store::StoreError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("circuit for `{dependency}` is open; call not attempted")]
pub struct CircuitOpenError {
    pub dependency: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("`{operation}` exceeded its {budget_ms}ms budget")]
pub struct TimeoutError {
    pub operation: OperationType,
    pub budget_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitScope {
    Global,
    User(String),
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("rate limit exceeded for {scope} (limit {limit}); retry after {}s", retry_after.as_secs())]
pub struct RateLimitExceededError {
    pub scope: RateLimitScope,
    pub limit: u64,
    pub retry_after: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityReason {
    Admission,
    QueueFull,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("capacity exceeded ({reason:?}): {current}/{limit}")]
pub struct CapacityExceededError {
    pub reason: CapacityReason,
    pub current: u64,
    pub limit: u64,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ApplicationError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceededError),
    #[error(transparent)]
    CapacityExceeded(#[from] CapacityExceededError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    /// The chat reply this failure should surface as.
    pub fn notice(&self) -> Notice {
        match self {
            Self::CircuitOpen(_) | Self::Integration(_) | Self::Store(_) => {
                Notice::ServiceUnavailable
            }
            Self::Timeout(error) => error.operation.timeout_notice(),
            Self::RateLimited(_) => Notice::RateLimited,
            Self::CapacityExceeded(_) => Notice::Busy,
            Self::Configuration(_) => Notice::InternalError,
        }
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::Throttled { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("throttled: {message}")]
    Throttled { message: String, notice: Notice, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, notice: Notice, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, notice: Notice, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self, locale: Locale) -> &'static str {
        match self {
            Self::Throttled { notice, .. }
            | Self::ServiceUnavailable { notice, .. }
            | Self::Internal { notice, .. } => notice.text(locale),
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Throttled { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let notice = value.notice();
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::RateLimited(_) | ApplicationError::CapacityExceeded(_) => {
                Self::Throttled { message, notice, correlation_id }
            }
            ApplicationError::CircuitOpen(_)
            | ApplicationError::Timeout(_)
            | ApplicationError::Store(_)
            | ApplicationError::Integration(_) => {
                Self::ServiceUnavailable { message, notice, correlation_id }
            }
            ApplicationError::Configuration(_) => {
                Self::Internal { message, notice, correlation_id }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::errors::{
        ApplicationError, CapacityExceededError, CapacityReason, CircuitOpenError,
        InterfaceError, RateLimitExceededError, RateLimitScope, TimeoutError,
    };
    use crate::messages::{Locale, Notice};
    use crate::resilience::timeout::OperationType;

    #[test]
    fn rate_limit_maps_to_throttled_with_correlation_id() {
        let interface = ApplicationError::from(RateLimitExceededError {
            scope: RateLimitScope::User("42".to_owned()),
            limit: 20,
            retry_after: Duration::from_secs(60),
        })
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::Throttled { ref correlation_id, .. } if correlation_id == "req-1"
        ));
        assert_eq!(interface.user_message(Locale::En), Notice::RateLimited.text(Locale::En));
    }

    #[test]
    fn timeout_uses_operation_specific_message() {
        let interface = ApplicationError::from(TimeoutError {
            operation: OperationType::PriceLookup,
            budget_ms: 3_000,
        })
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(interface.user_message(Locale::Es), Notice::PriceLookupSlow.text(Locale::Es));
    }

    #[test]
    fn open_circuit_never_leaks_state_names() {
        let interface =
            ApplicationError::from(CircuitOpenError { dependency: "nlp_service".to_owned() })
                .into_interface("req-3");

        let message = interface.user_message(Locale::En);
        assert!(!message.contains("nlp_service"));
        assert!(!message.to_lowercase().contains("open"));
    }

    #[test]
    fn capacity_and_configuration_mapping() {
        let busy = ApplicationError::from(CapacityExceededError {
            reason: CapacityReason::QueueFull,
            current: 50,
            limit: 50,
        })
        .into_interface("req-4");
        assert_eq!(busy.user_message(Locale::En), Notice::Busy.text(Locale::En));

        let internal =
            ApplicationError::Configuration("missing key".to_owned()).into_interface("req-5");
        assert!(matches!(internal, InterfaceError::Internal { .. }));
        assert_eq!(internal.correlation_id(), "req-5");
    }
}
