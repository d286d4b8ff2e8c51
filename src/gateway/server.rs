//! Router and request pipeline.
//!
//! Pipeline order per inbound request: request log → rate limiter (outermost
//! functional layer) → session resolution → per-route authorization guard →
//! cache → resilience-wrapped streaming relay. Auth endpoints short-circuit
//! before the proxy; everything under `/api` except auth is relayed to the
//! analytics engine.

use axum::extract::{OriginalUri, Path, Query, Request, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::middleware::resolve_session;
use crate::auth::session::{clear_session_cookie, session_cookie};
use crate::auth::{authorize, CurrentSession, Session, SessionContext, ROLE_UPLOADER, ROLE_VIEWER};
use crate::caching::CachedResponse;
use crate::core::error::{GatewayError, GatewayResult};
use crate::gateway::AppState;
use crate::observability::request_log;
use crate::proxy::ForwardIdentity;
use crate::resilience::retry_with_backoff;

/// Short-lived cookie carrying the OIDC `state` parameter across the
/// redirect round-trip.
const OAUTH_STATE_COOKIE: &str = "gateway_oauth_state";

/// Build the complete gateway router.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/api/auth/login", get(login))
        .route("/api/auth/callback", get(callback))
        .route("/api/auth/session", get(session_info))
        .route("/api/auth/logout", get(logout))
        .route("/api/datasets", get(list_datasets))
        .route("/api/datasets/:dataset_id/channels", get(list_channels))
        .route("/api/channels/:channel_id/time_range", get(channel_time_range))
        .route("/api/window", get(data_window))
        .route("/api/get_window_filtered", get(filtered_window))
        .route("/api/constraints", get(api_constraints))
        .route("/api/ingest", post(ingest))
        // Innermost layer listed first; execution order is the reverse.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            resolve_session,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_rate_limit,
        ))
        .layer(middleware::from_fn(request_log));

    if let Some(origin) = state
        .config
        .cors_allowed_origin
        .as_ref()
        .and_then(|o| o.parse::<axum::http::HeaderValue>().ok())
    {
        router = router.layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(origin)
                .allow_credentials(true)
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers([CONTENT_TYPE, ACCEPT]),
        );
    }

    router.with_state(state)
}

/// Rate limiting runs before everything else in the pipeline, independent of
/// identity.
async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let key = client_key(request.headers());
    state.limiter.check(&key)?;
    Ok(next.run(request).await)
}

/// Limiter key: first hop in `X-Forwarded-For` when behind a load balancer,
/// otherwise one shared bucket for direct connections.
fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "direct".to_string())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Auth endpoints
// ---------------------------------------------------------------------------

async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
) -> GatewayResult<(CookieJar, Redirect)> {
    let state_token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    let url = state.oidc.build_login_redirect(&state_token)?;

    let jar = jar.add(
        Cookie::build((OAUTH_STATE_COOKIE, state_token))
            .http_only(true)
            .same_site(SameSite::Lax)
            .path("/api/auth")
            .max_age(time::Duration::minutes(5))
            .build(),
    );
    Ok((jar, Redirect::temporary(url.as_str())))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: String,
    state: String,
}

async fn callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Response {
    match complete_login(&state, jar, &params).await {
        Ok(response) => response,
        // The browser is mid-redirect here; an error envelope would dead-end
        // the login flow, so exchange and decode failures go to the error
        // page instead.
        Err(err @ (GatewayError::AuthExchange { .. } | GatewayError::TokenDecode { .. })) => {
            tracing::warn!(error = %err, "login callback failed");
            Redirect::temporary(&state.config.oidc.error_redirect).into_response()
        }
        Err(other) => other.into_response(),
    }
}

async fn complete_login(
    state: &AppState,
    jar: CookieJar,
    params: &CallbackParams,
) -> GatewayResult<Response> {
    let expected = jar
        .get(OAUTH_STATE_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or_else(|| GatewayError::auth_exchange("missing login state cookie"))?;
    if expected != params.state {
        return Err(GatewayError::auth_exchange("state parameter mismatch"));
    }

    let principal = state.oidc.handle_callback(&params.code).await?;
    let session = Session::new(principal, state.config.session.ttl);
    state
        .sessions
        .put(&session, state.config.session.ttl)
        .await?;

    let jar = jar
        .remove(Cookie::build((OAUTH_STATE_COOKIE, "")).path("/api/auth").build())
        .add(session_cookie(
            &state.config.session.cookie_name,
            &session.session_id,
            state.config.session.ttl,
            state.config.session.secure_cookies,
        ));

    Ok((
        jar,
        Redirect::temporary(&state.config.oidc.post_login_redirect),
    )
        .into_response())
}

/// Polled by the UI; side-effect-free and never fails. Any resolution
/// problem already degraded to "unauthenticated" in the session middleware.
async fn session_info(CurrentSession(session): CurrentSession) -> Json<serde_json::Value> {
    match session {
        Some(ctx) => Json(json!({
            "authenticated": true,
            "principal": {
                "subject": ctx.principal.subject,
                "email": ctx.principal.email,
                "roles": ctx.principal.roles,
            },
        })),
        None => Json(json!({ "authenticated": false })),
    }
}

async fn logout(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    jar: CookieJar,
) -> (CookieJar, Redirect) {
    let mut id_token = None;
    if let Some(ctx) = session {
        // Session destruction completes before any redirect is computed.
        if let Err(err) = state.sessions.delete(&ctx.session_id).await {
            tracing::error!(error = %err, "session destruction failed during logout");
        }
        id_token = ctx.principal.tokens.id_token;
    }

    let jar = jar.add(clear_session_cookie(&state.config.session.cookie_name));

    let target = state
        .oidc
        .end_session_url(id_token.as_deref())
        .map(|u| u.to_string())
        .unwrap_or_else(|| state.config.oidc.post_logout_redirect.clone());
    (jar, Redirect::temporary(&target))
}

// ---------------------------------------------------------------------------
// Proxied engine endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

impl PageParams {
    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        pairs
    }
}

/// Validated query object for the windowed-data endpoint. Absent values are
/// dropped on re-serialization; nothing is forwarded blindly.
#[derive(Debug, Deserialize)]
struct WindowParams {
    channel_id: String,
    start: Option<String>,
    end: Option<String>,
    start_sec: Option<f64>,
    end_sec: Option<f64>,
    relative: Option<bool>,
    points: Option<u32>,
    method: Option<String>,
}

fn validate_downsampling_method(method: Option<&str>) -> GatewayResult<()> {
    match method {
        None | Some("lttb") | Some("uniform") | Some("clickhouse") => Ok(()),
        Some(_) => Err(GatewayError::invalid_request(
            "method must be one of lttb|uniform|clickhouse",
        )),
    }
}

impl WindowParams {
    fn validate(&self) -> GatewayResult<()> {
        Uuid::parse_str(&self.channel_id)
            .map_err(|_| GatewayError::invalid_request("channel_id must be a UUID"))?;
        validate_downsampling_method(self.method.as_deref())
    }

    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("channel_id".to_string(), self.channel_id.clone())];
        if let Some(v) = &self.start {
            pairs.push(("start".to_string(), v.clone()));
        }
        if let Some(v) = &self.end {
            pairs.push(("end".to_string(), v.clone()));
        }
        if let Some(v) = self.start_sec {
            pairs.push(("start_sec".to_string(), v.to_string()));
        }
        if let Some(v) = self.end_sec {
            pairs.push(("end_sec".to_string(), v.to_string()));
        }
        if let Some(v) = self.relative {
            pairs.push(("relative".to_string(), v.to_string()));
        }
        if let Some(v) = self.points {
            pairs.push(("points".to_string(), v.to_string()));
        }
        if let Some(v) = &self.method {
            pairs.push(("method".to_string(), v.clone()));
        }
        pairs
    }
}

/// Query object for the cursor-paginated filtered window endpoint.
#[derive(Debug, Deserialize)]
struct FilteredWindowParams {
    channel_id: String,
    start_timestamp: Option<f64>,
    end_timestamp: Option<f64>,
    cursor: Option<f64>,
    limit: Option<u32>,
    points: Option<u32>,
    method: Option<String>,
}

impl FilteredWindowParams {
    fn validate(&self) -> GatewayResult<()> {
        Uuid::parse_str(&self.channel_id)
            .map_err(|_| GatewayError::invalid_request("channel_id must be a UUID"))?;
        validate_downsampling_method(self.method.as_deref())
    }

    fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("channel_id".to_string(), self.channel_id.clone())];
        if let Some(v) = self.start_timestamp {
            pairs.push(("start_timestamp".to_string(), v.to_string()));
        }
        if let Some(v) = self.end_timestamp {
            pairs.push(("end_timestamp".to_string(), v.to_string()));
        }
        if let Some(v) = self.cursor {
            pairs.push(("cursor".to_string(), v.to_string()));
        }
        if let Some(v) = self.limit {
            pairs.push(("limit".to_string(), v.to_string()));
        }
        if let Some(v) = self.points {
            pairs.push(("points".to_string(), v.to_string()));
        }
        if let Some(v) = &self.method {
            pairs.push(("method".to_string(), v.clone()));
        }
        pairs
    }
}

async fn list_datasets(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Query(params): Query<PageParams>,
) -> GatewayResult<Response> {
    relay_read(
        &state,
        session.as_ref(),
        "datasets",
        "/datasets",
        params.to_pairs(),
        &headers,
        &uri,
    )
    .await
}

async fn list_channels(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path(dataset_id): Path<String>,
) -> GatewayResult<Response> {
    Uuid::parse_str(&dataset_id)
        .map_err(|_| GatewayError::invalid_request("dataset_id must be a UUID"))?;
    relay_read(
        &state,
        session.as_ref(),
        "channels",
        &format!("/datasets/{dataset_id}/channels"),
        Vec::new(),
        &headers,
        &uri,
    )
    .await
}

async fn channel_time_range(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Path(channel_id): Path<String>,
) -> GatewayResult<Response> {
    Uuid::parse_str(&channel_id)
        .map_err(|_| GatewayError::invalid_request("channel_id must be a UUID"))?;
    relay_read(
        &state,
        session.as_ref(),
        "time_range",
        &format!("/channels/{channel_id}/time_range"),
        Vec::new(),
        &headers,
        &uri,
    )
    .await
}

async fn data_window(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Query(params): Query<WindowParams>,
) -> GatewayResult<Response> {
    params.validate()?;
    relay_read(
        &state,
        session.as_ref(),
        "window",
        "/window",
        params.to_pairs(),
        &headers,
        &uri,
    )
    .await
}

async fn filtered_window(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Query(params): Query<FilteredWindowParams>,
) -> GatewayResult<Response> {
    params.validate()?;
    relay_read(
        &state,
        session.as_ref(),
        "window_filtered",
        "/get_window_filtered",
        params.to_pairs(),
        &headers,
        &uri,
    )
    .await
}

/// Engine-declared limits (page sizes, point budgets) the dashboard uses to
/// build its requests.
async fn api_constraints(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> GatewayResult<Response> {
    relay_read(
        &state,
        session.as_ref(),
        "constraints",
        "/api/constraints",
        Vec::new(),
        &headers,
        &uri,
    )
    .await
}

/// Shared relay for idempotent GET reads: guard, cache, breaker-wrapped
/// retried call, then capture-or-stream.
async fn relay_read(
    state: &AppState,
    session: Option<&SessionContext>,
    route: &'static str,
    backend_path: &str,
    query: Vec<(String, String)>,
    headers: &HeaderMap,
    uri: &Uri,
) -> GatewayResult<Response> {
    authorize(session.map(|s| &s.principal), &[ROLE_VIEWER])?;
    // The guard just passed a role check, so a principal is present.
    let principal = &session.ok_or(GatewayError::Unauthenticated)?.principal;
    let identity = ForwardIdentity {
        subject: principal.subject.clone(),
        email: principal.email.clone(),
    };

    let accept = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let wants_arrow = accept
        .as_deref()
        .map(|a| a.to_ascii_lowercase().contains(crate::proxy::ARROW_MIME))
        .unwrap_or(false);

    let cache_key = uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let cacheable = !wants_arrow && state.cache.is_cacheable_path(uri.path());

    if cacheable {
        if let Some(entry) = state.cache.get(&cache_key) {
            tracing::debug!(route, key = %cache_key, "cache hit");
            return Ok(cached_to_response(&entry));
        }
    }

    let breaker = state.breakers.for_route(route);
    let upstream = breaker
        .call_with_fallback(
            retry_with_backoff(&state.retry, route, |_| {
                state
                    .proxy
                    .relay_get(backend_path, &query, accept.as_deref(), &identity)
            }),
            |rejection| {
                Err(GatewayError::unavailable(format!(
                    "analytics engine temporarily unavailable: {rejection}"
                )))
            },
        )
        .await?;

    // Bounded JSON bodies are captured for the cache; everything else —
    // Arrow streams in particular — is piped through untouched.
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let is_json = content_type
        .as_deref()
        .map(|c| c.starts_with("application/json"))
        .unwrap_or(false);
    let bounded = upstream
        .content_length()
        .map(|len| state.cache.is_capturable_size(len as usize))
        .unwrap_or(false);

    if cacheable && is_json && bounded {
        let status = upstream.status().as_u16();
        let body = upstream
            .bytes()
            .await
            .map_err(|e| GatewayError::bad_gateway(format!("body read failed: {e}")))?;
        let entry = CachedResponse::new(status, content_type, body, state.cache.ttl());
        state.cache.insert(cache_key, entry.clone());
        return Ok(cached_to_response(&entry));
    }

    Ok(state.proxy.into_streaming_response(route, upstream))
}

fn cached_to_response(entry: &CachedResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK));
    if let Some(content_type) = &entry.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(axum::body::Body::from(entry.body.clone()))
        .unwrap_or_else(|e| GatewayError::internal(format!("cannot build response: {e}")).into_response())
}

/// Streaming multipart upload. The body is piped into the engine as bytes
/// arrive; it cannot be replayed, so the circuit breaker applies but the
/// retry operator does not.
async fn ingest(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    request: Request,
) -> GatewayResult<Response> {
    authorize(
        session.as_ref().map(|s| &s.principal),
        &[ROLE_UPLOADER],
    )?;
    let principal = &session.as_ref().ok_or(GatewayError::Unauthenticated)?.principal;
    let identity = ForwardIdentity {
        subject: principal.subject.clone(),
        email: principal.email.clone(),
    };

    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart/form-data"))
        .unwrap_or(false);
    if !is_multipart {
        return Err(GatewayError::invalid_request(
            "ingestion requires a multipart/form-data body",
        ));
    }

    let inbound_headers = request.headers().clone();
    let body = request.into_body().into_data_stream();

    let breaker = state.breakers.for_route("ingest");
    let upstream = breaker
        .call_with_fallback(
            state
                .proxy
                .relay_upload("/ingest", &inbound_headers, &identity, body),
            |rejection| {
                Err(GatewayError::unavailable(format!(
                    "ingestion temporarily unavailable: {rejection}"
                )))
            },
        )
        .await?;

    Ok(state.proxy.into_streaming_response("ingest", upstream))
}
