pub mod clock;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod messages;
pub mod resilience;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{
    ApplicationError, CapacityExceededError, CircuitOpenError, InterfaceError,
    RateLimitExceededError, TimeoutError,
};
pub use gateway::{
    ChatSendError, ChatSender, ConversationHandler, Gateway, GatewayOutcome, InboundMessage,
    RequestContext,
};
pub use messages::{Locale, Notice};
pub use resilience::{
    CircuitBreaker, CircuitBreakerRegistry, ConcurrencyManager, GuardedDependency, RateLimiter,
    TimeoutManager,
};
pub use store::{InMemoryStore, SharedStore, StoreError};
