//! Resilience operators: bounded retry with backoff and per-route circuit
//! breaking. Independently reusable; the proxy composes them with retries on
//! the inside so the breaker sees one outcome per logical call.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use retry::{retry_with_backoff, RetryPolicy};
