//! Full-pipeline tests: real router, in-process session store, mock engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use analytics_gateway::auth::oidc::{ProviderMetadata, TokenSet};
use analytics_gateway::auth::{
    MemorySessionStore, OidcClient, Principal, Session, SessionStore,
};
use analytics_gateway::{build_router, AppState, GatewayConfig};

const SESSION_TTL: Duration = Duration::from_secs(1800);

fn test_config(backend_url: &str) -> GatewayConfig {
    let yaml = format!(
        r#"
backend_url: "{backend_url}"
gateway_secret: "s3cret"
oidc:
  issuer: "https://idp.example.com/realms/analytics"
  client_id: "dashboard"
  redirect_uri: "https://app.example.com/api/auth/callback"
retry:
  max_attempts: 3
  base_delay: "1ms"
rate_limit:
  tiers:
    - name: "burst"
      limit: 50
      window: "10s"
"#
    );
    GatewayConfig::from_yaml(&yaml).unwrap()
}

fn test_oidc(config: &GatewayConfig) -> OidcClient {
    OidcClient::with_metadata(
        config.oidc.clone(),
        ProviderMetadata {
            authorization_endpoint: "https://idp.example.com/auth".into(),
            token_endpoint: "https://idp.example.com/token".into(),
            end_session_endpoint: None,
        },
    )
}

fn principal(roles: &[&str]) -> Principal {
    Principal {
        subject: "user-1".into(),
        email: Some("user1@example.com".into()),
        roles: Some(roles.iter().map(|r| r.to_string()).collect::<HashSet<_>>()),
        tokens: TokenSet {
            access_token: "at".into(),
            refresh_token: None,
            id_token: None,
        },
    }
}

struct Harness {
    router: axum::Router,
    sessions: Arc<MemorySessionStore>,
    cookie_name: String,
}

impl Harness {
    async fn new(backend_url: &str) -> Self {
        Self::with_config(test_config(backend_url)).await
    }

    async fn with_config(config: GatewayConfig) -> Self {
        let oidc = test_oidc(&config);
        let sessions = Arc::new(MemorySessionStore::new());
        let cookie_name = config.session.cookie_name.clone();
        let state = AppState::new(config, oidc, sessions.clone()).unwrap();
        Self {
            router: build_router(state),
            sessions,
            cookie_name,
        }
    }

    /// Store a session directly and return the Cookie header value a browser
    /// holding it would send.
    async fn login_as(&self, roles: &[&str]) -> String {
        let session = Session::new(principal(roles), SESSION_TTL);
        self.sessions.put(&session, SESSION_TTL).await.unwrap();
        format!("{}={}", self.cookie_name, session.session_id)
    }

    async fn send(&self, request: Request<Body>) -> axum::response::Response {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let harness = Harness::new("http://127.0.0.1:1").await;
    let response = harness
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_reads_require_authentication() {
    let harness = Harness::new("http://127.0.0.1:1").await;
    let response = harness
        .send(Request::get("/api/datasets").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "unauthenticated");
}

#[tokio::test]
async fn test_reads_require_viewer_role() {
    let harness = Harness::new("http://127.0.0.1:1").await;
    let cookie = harness.login_as(&["some-unrelated-role"]).await;

    let response = harness
        .send(
            Request::get("/api/datasets")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_authenticated_read_relays_backend_body_and_identity() {
    let engine = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/datasets"))
        .and(wiremock::matchers::header("x-user-sub", "user-1"))
        .and(wiremock::matchers::header("x-gateway-secret", "s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(r#"[{"name":"run-1"}]"#, "application/json"))
        .mount(&engine)
        .await;

    let harness = Harness::new(&engine.uri()).await;
    let cookie = harness.login_as(&["analytics-viewer"]).await;

    let response = harness
        .send(
            Request::get("/api/datasets")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body[0]["name"], "run-1");
}

#[tokio::test]
async fn test_repeat_read_within_ttl_hits_backend_once() {
    let engine = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/datasets"))
        // set_body_raw keeps the declared content type; the JSON capture
        // branch of the cache depends on it.
        .respond_with(ResponseTemplate::new(200).set_body_raw("[]", "application/json"))
        .expect(1)
        .mount(&engine)
        .await;

    let harness = Harness::new(&engine.uri()).await;
    let cookie = harness.login_as(&["analytics-viewer"]).await;

    for _ in 0..3 {
        let response = harness
            .send(
                Request::get("/api/datasets")
                    .header(header::COOKIE, &cookie)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    // The mock's expect(1) verifies on drop.
}

#[tokio::test]
async fn test_persistent_503_is_retried_then_surfaces() {
    let engine = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/window"))
        .respond_with(ResponseTemplate::new(503).set_body_string("engine overloaded"))
        .expect(3)
        .mount(&engine)
        .await;

    let harness = Harness::new(&engine.uri()).await;
    let cookie = harness.login_as(&["analytics-viewer"]).await;

    let response = harness
        .send(
            Request::get("/api/window?channel_id=ab0e3c1e-9f5d-4c2a-8f4e-1db1c3f7a111")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_window_rejects_malformed_channel_id_before_backend() {
    let engine = MockServer::start().await;
    // No mock mounted: any backend call would 404 and fail the status check.
    let harness = Harness::new(&engine.uri()).await;
    let cookie = harness.login_as(&["analytics-viewer"]).await;

    let response = harness
        .send(
            Request::get("/api/window?channel_id=not-a-uuid")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(engine.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_filtered_window_forwards_cursor_pagination() {
    let engine = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/get_window_filtered"))
        .and(wiremock::matchers::query_param(
            "channel_id",
            "ab0e3c1e-9f5d-4c2a-8f4e-1db1c3f7a111",
        ))
        .and(wiremock::matchers::query_param("cursor", "42.5"))
        .and(wiremock::matchers::query_param("limit", "5000"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"{"data":[],"has_more":false}"#,
            "application/json",
        ))
        .mount(&engine)
        .await;

    let harness = Harness::new(&engine.uri()).await;
    let cookie = harness.login_as(&["analytics-viewer"]).await;

    let response = harness
        .send(
            Request::get(
                "/api/get_window_filtered?channel_id=ab0e3c1e-9f5d-4c2a-8f4e-1db1c3f7a111&cursor=42.5&limit=5000",
            )
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["has_more"], false);
}

#[tokio::test]
async fn test_constraints_are_proxied_to_engine() {
    let engine = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/constraints"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(r#"{"limit_max":10000}"#, "application/json"),
        )
        .mount(&engine)
        .await;

    let harness = Harness::new(&engine.uri()).await;

    // Constraints are guarded like every other read.
    let response = harness
        .send(Request::get("/api/constraints").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let cookie = harness.login_as(&["analytics-viewer"]).await;
    let response = harness
        .send(
            Request::get("/api/constraints")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["limit_max"], 10000);
}

#[tokio::test]
async fn test_failed_login_callback_redirects_to_error_page() {
    let harness = Harness::new("http://127.0.0.1:1").await;

    // State mismatch fails the exchange; the browser lands on the error
    // page instead of a JSON error body.
    let response = harness
        .send(
            Request::get("/api/auth/callback?code=abc&state=tampered")
                .header(header::COOKIE, "gateway_oauth_state=expected")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok()),
        Some("/auth/error")
    );
}

#[tokio::test]
async fn test_ingest_requires_uploader_role() {
    let harness = Harness::new("http://127.0.0.1:1").await;
    let cookie = harness.login_as(&["analytics-viewer"]).await;

    let response = harness
        .send(
            Request::post("/api/ingest")
                .header(header::COOKIE, &cookie)
                .header(
                    header::CONTENT_TYPE,
                    "multipart/form-data; boundary=boundary",
                )
                .body(Body::from("--boundary--"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_ingest_rejects_non_multipart() {
    let harness = Harness::new("http://127.0.0.1:1").await;
    let cookie = harness.login_as(&["analytics-uploader"]).await;

    let response = harness
        .send(
            Request::post("/api/ingest")
                .header(header::COOKIE, &cookie)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ingest_streams_multipart_to_engine() {
    let engine = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .and(wiremock::matchers::header("x-user-sub", "user-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_string(r#"{"status":"success"}"#),
        )
        .mount(&engine)
        .await;

    let harness = Harness::new(&engine.uri()).await;
    let cookie = harness.login_as(&["analytics-uploader"]).await;

    let payload = "--boundary\r\ncontent\r\n--boundary--";
    let response = harness
        .send(
            Request::post("/api/ingest")
                .header(header::COOKIE, &cookie)
                .header(
                    header::CONTENT_TYPE,
                    "multipart/form-data; boundary=boundary",
                )
                .body(Body::from(payload))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let requests = engine.received_requests().await.unwrap();
    assert_eq!(requests[0].body, payload.as_bytes().to_vec());
}

#[tokio::test]
async fn test_session_endpoint_reports_identity_without_tokens() {
    let harness = Harness::new("http://127.0.0.1:1").await;

    let anonymous = harness
        .send(Request::get("/api/auth/session").body(Body::empty()).unwrap())
        .await;
    assert_eq!(anonymous.status(), StatusCode::OK);
    assert_eq!(body_json(anonymous).await["authenticated"], false);

    let cookie = harness.login_as(&["analytics-viewer"]).await;
    let response = harness
        .send(
            Request::get("/api/auth/session")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let body = body_json(response).await;
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["principal"]["subject"], "user-1");
    // Tokens never leave the gateway.
    assert!(body["principal"].get("tokens").is_none());
}

#[tokio::test]
async fn test_login_redirects_to_provider_with_state_cookie() {
    let harness = Harness::new("http://127.0.0.1:1").await;

    let response = harness
        .send(Request::get("/api/auth/login").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(location.starts_with("https://idp.example.com/auth?"));
    assert!(location.contains("response_type=code"));
    assert!(location.contains("client_id=dashboard"));

    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(set_cookie.starts_with("gateway_oauth_state="));
    assert!(set_cookie.contains("HttpOnly"));
}

#[tokio::test]
async fn test_logout_destroys_session_and_clears_cookie() {
    let harness = Harness::new("http://127.0.0.1:1").await;
    let cookie = harness.login_as(&["analytics-viewer"]).await;
    let session_id = cookie.split('=').nth(1).unwrap().to_string();

    let response = harness
        .send(
            Request::get("/api/auth/logout")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    assert!(harness
        .sessions
        .get(&session_id)
        .await
        .unwrap()
        .is_none());

    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(set_cookie.starts_with("gateway_session="));
    assert!(set_cookie.contains("Max-Age=0"));
}

#[tokio::test]
async fn test_rate_limit_rejects_with_retry_after() {
    let mut config = test_config("http://127.0.0.1:1");
    config.rate_limit.tiers[0].limit = 2;
    let harness = Harness::with_config(config).await;

    for _ in 0..2 {
        let response = harness
            .send(Request::get("/health").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = harness
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());
}

#[tokio::test]
async fn test_rate_limit_keys_on_forwarded_for() {
    let mut config = test_config("http://127.0.0.1:1");
    config.rate_limit.tiers[0].limit = 1;
    let harness = Harness::with_config(config).await;

    for client in ["203.0.113.1", "203.0.113.2"] {
        let response = harness
            .send(
                Request::get("/health")
                    .header("x-forwarded-for", client)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK, "client {client}");
    }

    let response = harness
        .send(
            Request::get("/health")
                .header("x-forwarded-for", "203.0.113.1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}
