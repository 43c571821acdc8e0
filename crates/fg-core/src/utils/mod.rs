pub mod circuit_breaker;
pub mod rate_governor;
pub mod retry;
pub mod weighted;

pub use circuit_breaker::{CircuitBreakerRegistry, CircuitStatus};
pub use rate_governor::{RateGovernor, RateStats, ThrottleDecision};
pub use retry::{with_retry, with_retry_hooks, NoHooks, RetryHooks, RetryableError};
pub use weighted::WeightedRing;
