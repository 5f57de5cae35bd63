pub mod circuit_breaker;
pub mod reliability;
pub mod retry;
pub mod token_bucket;

pub use circuit_breaker::{CallError, CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use reliability::ReliabilityTracker;
pub use retry::RetryPolicy;
pub use token_bucket::TokenBucket;
