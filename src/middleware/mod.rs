// Middleware for resilient service calls
//
// Provides bounded-parallelism limiters and per-provider circuit breaking

pub mod circuit_breaker;
pub mod limiter;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use limiter::{ConcurrencyLimiter, LimiterSlot};
