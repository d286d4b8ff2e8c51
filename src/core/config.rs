//! Gateway configuration.
//!
//! Configuration is loaded from a YAML file and then overridden by a small
//! set of environment variables for the values that should never live in a
//! file (shared secret, OIDC client secret, Redis URL). All durations use
//! humantime notation in YAML (`"3ms"`, `"30s"`, `"10m"`).
//!
//! Validation happens once at startup via [`GatewayConfig::validate`]; the
//! process refuses to boot on a bad configuration instead of failing requests
//! later.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};

/// Top-level configuration for the gateway process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Base URL of the analytics engine, e.g. `http://engine:8000`.
    pub backend_url: String,

    /// Shared secret forwarded as `X-Gateway-Secret` so the engine can trust
    /// forwarded identity headers without re-validating the OIDC token.
    #[serde(default)]
    pub gateway_secret: String,

    pub oidc: OidcConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Browser origin allowed to call the gateway cross-origin. Unset means
    /// the UI is served from the same origin and no CORS layer is mounted.
    #[serde(default)]
    pub cors_allowed_origin: Option<String>,
}

/// OIDC client settings for the authorization-code flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
    /// Issuer base URL; discovery is fetched from
    /// `{issuer}/.well-known/openid-configuration`.
    pub issuer: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    pub redirect_uri: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Where to send the browser after logout when the identity provider does
    /// not advertise an end-session endpoint.
    #[serde(default = "default_post_logout")]
    pub post_logout_redirect: String,
    /// Where to send the browser after a successful login callback.
    #[serde(default = "default_post_login")]
    pub post_login_redirect: String,
    /// Where to send the browser when the login callback fails (rejected
    /// code exchange, malformed access token).
    #[serde(default = "default_error_redirect")]
    pub error_redirect: String,
    /// Deadline for discovery and token-endpoint calls.
    #[serde(with = "humantime_serde", default = "default_token_timeout")]
    pub token_timeout: Duration,
}

/// Session cookie and store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Rolling TTL; every authenticated request extends the session by this.
    #[serde(with = "humantime_serde", default = "default_session_ttl")]
    pub ttl: Duration,
    /// Redis connection URL. When absent the gateway falls back to the
    /// in-process store, which breaks horizontal scaling and is only meant
    /// for development.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub secure_cookies: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            ttl: default_session_ttl(),
            redis_url: None,
            secure_cookies: false,
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub ttl: Duration,
    /// Path prefixes that are never cached: session state and liveness
    /// responses must not be served stale.
    #[serde(default = "default_cache_exclusions")]
    pub excluded_prefixes: Vec<String>,
    /// Bodies larger than this are streamed through and never captured.
    #[serde(default = "default_max_cacheable_body")]
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            excluded_prefixes: default_cache_exclusions(),
            max_body_bytes: default_max_cacheable_body(),
        }
    }
}

/// Bounded retry-with-backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
        }
    }
}

/// Per-route circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long an open circuit waits before allowing a trial call.
    #[serde(with = "humantime_serde", default = "default_open_wait")]
    pub open_to_half_open_wait: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_to_half_open_wait: default_open_wait(),
        }
    }
}

/// A single rate-limit tier: at most `limit` requests per `window`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitTier {
    pub name: String,
    pub limit: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// Tiered rate limiting; all tiers apply independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_tiers")]
    pub tiers: Vec<RateLimitTier>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}

/// Streaming proxy timeouts and logging granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Deadline for receiving the backend's response head.
    #[serde(with = "humantime_serde", default = "default_first_byte_timeout")]
    pub first_byte_timeout: Duration,
    /// Deadline between consecutive body chunks.
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    /// Transfer progress is logged once per this many bytes, not per chunk.
    #[serde(default = "default_log_every_bytes")]
    pub log_every_bytes: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            first_byte_timeout: default_first_byte_timeout(),
            idle_timeout: default_idle_timeout(),
            log_every_bytes: default_log_every_bytes(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_scope() -> String {
    "openid profile email".to_string()
}
fn default_post_logout() -> String {
    "/".to_string()
}
fn default_post_login() -> String {
    "/".to_string()
}
fn default_error_redirect() -> String {
    "/auth/error".to_string()
}
fn default_token_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_cookie_name() -> String {
    "gateway_session".to_string()
}
fn default_session_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_cache_ttl() -> Duration {
    Duration::from_secs(30)
}
fn default_cache_exclusions() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/metrics".to_string(),
        "/api/auth".to_string(),
        "/api/me".to_string(),
    ]
}
fn default_max_cacheable_body() -> usize {
    1024 * 1024
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> Duration {
    Duration::from_millis(3)
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_open_wait() -> Duration {
    Duration::from_secs(30)
}
fn default_tiers() -> Vec<RateLimitTier> {
    vec![
        RateLimitTier {
            name: "burst".to_string(),
            limit: 100,
            window: Duration::from_secs(10),
        },
        RateLimitTier {
            name: "sustained".to_string(),
            limit: 2000,
            window: Duration::from_secs(600),
        },
    ]
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_first_byte_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_log_every_bytes() -> u64 {
    50 * 1024 * 1024
}

impl GatewayConfig {
    /// Load configuration from a YAML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::config(format!(
                "cannot read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let mut config: Self = serde_yaml::from_str(&raw)?;
        config.apply_env_overrides(&env_vars());
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string (used by tests).
    pub fn from_yaml(raw: &str) -> GatewayResult<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, vars: &HashMap<String, String>) {
        if let Some(secret) = vars.get("GATEWAY_SECRET") {
            self.gateway_secret = secret.clone();
        }
        if let Some(secret) = vars.get("OIDC_CLIENT_SECRET") {
            self.oidc.client_secret = secret.clone();
        }
        if let Some(url) = vars.get("SESSION_REDIS_URL") {
            self.session.redis_url = Some(url.clone());
        }
        if let Some(url) = vars.get("BACKEND_URL") {
            self.backend_url = url.clone();
        }
    }

    /// Fail-fast validation of everything the pipeline depends on.
    pub fn validate(&self) -> GatewayResult<()> {
        url::Url::parse(&self.backend_url)
            .map_err(|e| GatewayError::config(format!("invalid backend_url: {e}")))?;
        url::Url::parse(&self.oidc.issuer)
            .map_err(|e| GatewayError::config(format!("invalid oidc.issuer: {e}")))?;
        url::Url::parse(&self.oidc.redirect_uri)
            .map_err(|e| GatewayError::config(format!("invalid oidc.redirect_uri: {e}")))?;
        if self.oidc.client_id.is_empty() {
            return Err(GatewayError::config("oidc.client_id must not be empty"));
        }
        if self.gateway_secret.is_empty() {
            return Err(GatewayError::config(
                "gateway_secret must be set (GATEWAY_SECRET env or config file)",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(GatewayError::config("retry.max_attempts must be >= 1"));
        }
        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
        {
            return Err(GatewayError::config(
                "circuit_breaker thresholds must be >= 1",
            ));
        }
        for tier in &self.rate_limit.tiers {
            if tier.limit == 0 || tier.window.is_zero() {
                return Err(GatewayError::config(format!(
                    "rate_limit tier '{}' must have a positive limit and window",
                    tier.name
                )));
            }
        }
        Ok(())
    }
}

fn env_vars() -> HashMap<String, String> {
    std::env::vars().collect()
}
