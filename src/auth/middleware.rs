//! Session resolution middleware.
//!
//! Runs after rate limiting and before authorization: reads the session
//! cookie, loads the session from the store, extends its rolling TTL and
//! attaches a [`SessionContext`] to the request extensions. Resolution is
//! deliberately infallible — a missing cookie, an expired session or a store
//! hiccup all just leave the request unauthenticated, and the guard decides
//! what that means for the route.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::CookieJar;
use std::time::Duration;

use crate::auth::oidc::Principal;
use crate::gateway::AppState;

/// Deadline for one session-store round-trip. A slow store must not hold the
/// whole request pipeline hostage.
const STORE_DEADLINE: Duration = Duration::from_secs(2);

/// The resolved session attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub principal: Principal,
}

/// Extractor handing handlers the session context when one was resolved.
pub struct CurrentSession(pub Option<SessionContext>);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentSession {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<SessionContext>().cloned()))
    }
}

/// Axum middleware: resolve the session cookie into a [`SessionContext`].
pub async fn resolve_session(
    State(state): State<AppState>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let cookie_name = state.config.session.cookie_name.clone();
    if let Some(cookie) = jar.get(&cookie_name) {
        let session_id = cookie.value().to_string();
        match tokio::time::timeout(STORE_DEADLINE, state.sessions.get(&session_id)).await {
            Ok(Ok(Some(session))) => {
                // Rolling expiry: each authenticated request extends the TTL.
                let _ = tokio::time::timeout(
                    STORE_DEADLINE,
                    state.sessions.touch(&session_id, state.config.session.ttl),
                )
                .await;
                request.extensions_mut().insert(SessionContext {
                    session_id,
                    principal: session.principal,
                });
            }
            Ok(Ok(None)) => {}
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "session lookup failed, continuing unauthenticated");
            }
            Err(_) => {
                tracing::warn!("session store timed out, continuing unauthenticated");
            }
        }
    }

    next.run(request).await
}
