//! Outbound delivery reliability: quotas, circuit breaking, flood-wait
//! handling and the dead-letter hook.

pub mod circuit_breaker;
pub mod pipeline;
pub mod rate_limiter;

pub use circuit_breaker::{BreakerKey, CircuitBreaker, CircuitBreakerGroup, CircuitConfig, CircuitState};
pub use pipeline::{
    DeadLetterSink, DeliveryAttempt, DeliveryOutcome, FloodWaitPolicy, LogDeadLetterSink, OutboundPipeline,
    SendRequest,
};
pub use rate_limiter::{Quota, RateLimitConfig, RateLimiter};
