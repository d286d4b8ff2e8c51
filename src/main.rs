use std::sync::Arc;
use std::time::Duration;

use analytics_gateway::auth::{MemorySessionStore, OidcClient, RedisSessionStore, SessionStore};
use analytics_gateway::observability::init_logging;
use analytics_gateway::{build_router, AppState, GatewayConfig};

/// How often expired cache entries and rate-limit buckets are reaped.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GATEWAY_CONFIG").ok())
        .unwrap_or_else(|| "gateway.yaml".to_string());
    let config = GatewayConfig::load(&config_path)?;
    tracing::info!(config = %config_path, backend = %config.backend_url, "configuration loaded");

    // Discovery failure is fatal: a gateway that cannot log anyone in should
    // not come up.
    let oidc = OidcClient::discover(config.oidc.clone()).await?;

    let sessions: Arc<dyn SessionStore> = match &config.session.redis_url {
        Some(url) => {
            tracing::info!("using redis session store");
            Arc::new(RedisSessionStore::connect(url).await?)
        }
        None => {
            tracing::warn!("no session redis configured, using in-process store (single instance only)");
            Arc::new(MemorySessionStore::new())
        }
    };

    let state = AppState::new(config, oidc, sessions)?;

    let sweeper_cache = state.cache.clone();
    let sweeper_limiter = state.limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            sweeper_cache.sweep();
            sweeper_limiter.sweep();
        }
    });

    let listen_addr = state.config.listen_addr.clone();
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(%listen_addr, "gateway listening");
    axum::serve(listener, router).await?;
    Ok(())
}
