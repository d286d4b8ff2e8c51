//! Streaming reverse-proxy gateway for the analytics dashboard.
//!
//! The gateway is the single entry point between browsers and the analytics
//! engine. It terminates OIDC sessions, enforces per-route role checks,
//! shields the engine with retries, per-route circuit breakers, a short-TTL
//! response cache and tiered rate limiting, and relays request and response
//! bodies chunk-at-a-time so multi-gigabyte uploads and Arrow downloads
//! never accumulate in gateway memory.

pub mod auth;
pub mod caching;
pub mod core;
pub mod gateway;
pub mod observability;
pub mod proxy;
pub mod rate_limit;
pub mod resilience;

pub use crate::core::config::GatewayConfig;
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::gateway::{build_router, AppState};
