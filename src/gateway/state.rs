//! Shared application state.
//!
//! Every keyed store (breakers per route, cache entries per URL, rate-limit
//! buckets per tier) lives here as an explicit field rather than an ambient
//! singleton, so a distributed implementation can be swapped in without
//! touching the handlers.

use std::sync::Arc;

use crate::auth::{OidcClient, SessionStore};
use crate::caching::ResponseCache;
use crate::core::config::GatewayConfig;
use crate::proxy::ProxyClient;
use crate::rate_limit::RateLimiter;
use crate::resilience::{BreakerRegistry, RetryPolicy};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub oidc: Arc<OidcClient>,
    pub sessions: Arc<dyn SessionStore>,
    pub proxy: Arc<ProxyClient>,
    pub breakers: Arc<BreakerRegistry>,
    pub retry: RetryPolicy,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        oidc: OidcClient,
        sessions: Arc<dyn SessionStore>,
    ) -> crate::core::error::GatewayResult<Self> {
        let proxy = ProxyClient::new(
            &config.backend_url,
            config.gateway_secret.clone(),
            config.proxy.clone(),
        )?;
        Ok(Self {
            breakers: Arc::new(BreakerRegistry::new(config.circuit_breaker.clone())),
            retry: RetryPolicy::from(&config.retry),
            cache: Arc::new(ResponseCache::new(config.cache.clone())),
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            proxy: Arc::new(proxy),
            oidc: Arc::new(oidc),
            sessions,
            config: Arc::new(config),
        })
    }
}
