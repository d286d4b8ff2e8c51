//! Streaming proxy core: byte-level relay between the dashboard and the
//! analytics engine.
//!
//! Both directions are chunk-at-a-time pipes with backpressure — a slow
//! consumer pauses the upstream read; nothing accumulates a full payload.
//! Downloads can be JSON or an Arrow IPC stream depending on the client's
//! `Accept` header, which is forwarded verbatim so the engine picks the wire
//! format. Uploads pipe the inbound multipart body straight into the backend
//! connection as bytes arrive.
//!
//! Every proxied call carries the caller's identity (`X-User-Sub`,
//! `X-User-Email`) plus the shared gateway secret, so the engine can
//! authorize without re-validating the OIDC token.
//!
//! Failure classes map to distinct outward statuses: connect failure is 503,
//! an elapsed deadline is 504, and an error after bytes started flowing is
//! 502 — at that point response headers are already committed and the stream
//! is simply aborted.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::time::Duration;
use url::Url;

use crate::core::config::ProxyConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Content type of the binary columnar stream representation.
pub const ARROW_MIME: &str = "application/vnd.apache.arrow.stream";

/// Identity headers the engine trusts when the shared secret matches.
pub const HEADER_USER_SUB: &str = "x-user-sub";
pub const HEADER_USER_EMAIL: &str = "x-user-email";
pub const HEADER_GATEWAY_SECRET: &str = "x-gateway-secret";

/// Headers that must not be relayed in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Caller identity forwarded with every proxied request.
#[derive(Debug, Clone)]
pub struct ForwardIdentity {
    pub subject: String,
    pub email: Option<String>,
}

/// Outbound connection factory and relay logic for the analytics engine.
pub struct ProxyClient {
    http: reqwest::Client,
    backend_url: Url,
    gateway_secret: String,
    config: ProxyConfig,
}

impl ProxyClient {
    pub fn new(
        backend_url: &str,
        gateway_secret: String,
        config: ProxyConfig,
    ) -> GatewayResult<Self> {
        let backend_url = Url::parse(backend_url)
            .map_err(|e| GatewayError::config(format!("invalid backend url: {e}")))?;
        // Only a connect timeout on the client itself: a total-request
        // deadline would kill legitimate multi-gigabyte transfers. First-byte
        // and idle deadlines are applied per call.
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| GatewayError::config(format!("cannot build proxy client: {e}")))?;
        Ok(Self {
            http,
            backend_url,
            gateway_secret,
            config,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn backend_endpoint(&self, path: &str, query: &[(String, String)]) -> GatewayResult<Url> {
        let mut url = self
            .backend_url
            .join(path)
            .map_err(|e| GatewayError::internal(format!("bad backend path {path}: {e}")))?;
        if !query.is_empty() {
            // Re-serialized from the validated parameter object: absent
            // values were already dropped, encoding happens here.
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn identity_headers(&self, identity: &ForwardIdentity) -> GatewayResult<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            HEADER_USER_SUB,
            identity
                .subject
                .parse()
                .map_err(|_| GatewayError::internal("subject is not a valid header value"))?,
        );
        if let Some(email) = &identity.email {
            if let Ok(value) = email.parse() {
                headers.insert(HEADER_USER_EMAIL, value);
            }
        }
        headers.insert(
            HEADER_GATEWAY_SECRET,
            self.gateway_secret
                .parse()
                .map_err(|_| GatewayError::internal("gateway secret is not a valid header value"))?,
        );
        Ok(headers)
    }

    /// Streamed GET: send the request, await the response head within the
    /// first-byte deadline and classify the status. The body has not been
    /// touched when this returns — callers decide whether to stream or
    /// capture it.
    pub async fn relay_get(
        &self,
        path: &str,
        query: &[(String, String)],
        accept: Option<&str>,
        identity: &ForwardIdentity,
    ) -> GatewayResult<reqwest::Response> {
        let url = self.backend_endpoint(path, query)?;
        let mut request = self.http.get(url).headers(self.identity_headers(identity)?);
        if let Some(accept) = accept {
            // Forwarded unchanged: an Arrow accept value must reach the
            // engine so it can choose the wire format.
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        let response = self.send_with_first_byte_deadline(request).await?;
        classify_response(response).await
    }

    /// Streamed POST upload: pipe the inbound body into the backend
    /// connection as bytes arrive. A read error on the inbound side aborts
    /// the outbound connection rather than leaving it half-open.
    pub async fn relay_upload<S, E>(
        &self,
        path: &str,
        inbound_headers: &axum::http::HeaderMap,
        identity: &ForwardIdentity,
        body: S,
    ) -> GatewayResult<reqwest::Response>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::fmt::Display + Send + Sync + 'static,
    {
        let url = self.backend_endpoint(path, &[])?;

        let mut headers = self.identity_headers(identity)?;
        for (name, value) in inbound_headers {
            let name_str = name.as_str();
            if HOP_BY_HOP.contains(&name_str) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name_str.as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let instrumented = instrument_stream(
            "upload",
            body,
            self.config.idle_timeout,
            self.config.log_every_bytes,
        );
        let request = self
            .http
            .post(url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(instrumented));

        let response = self.send_with_first_byte_deadline(request).await?;
        classify_response(response).await
    }

    async fn send_with_first_byte_deadline(
        &self,
        request: reqwest::RequestBuilder,
    ) -> GatewayResult<reqwest::Response> {
        match tokio::time::timeout(self.config.first_byte_timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(GatewayError::Timeout {
                timeout_ms: self.config.first_byte_timeout.as_millis() as u64,
            }),
        }
    }

    /// Turn a backend response into an outbound streaming response: status
    /// and headers are copied verbatim before the first body byte, then
    /// chunks are piped through as they arrive. If the client disconnects,
    /// dropping the body drops the backend connection with it.
    pub fn into_streaming_response(&self, route: &str, upstream: reqwest::Response) -> Response {
        let status = axum::http::StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);

        let mut builder = Response::builder().status(status);
        if let Some(headers) = builder.headers_mut() {
            copy_response_headers(upstream.headers(), headers);
        }

        let body_stream = instrument_stream(
            route,
            upstream.bytes_stream(),
            self.config.idle_timeout,
            self.config.log_every_bytes,
        );

        builder
            .body(Body::from_stream(body_stream))
            .unwrap_or_else(|e| {
                GatewayError::internal(format!("cannot build response: {e}")).into_response()
            })
    }
}

/// Classify the backend's response head. Success passes through untouched;
/// any error status becomes `BackendRejected` carrying the engine's status
/// and (truncated) message, and retryability falls out of the status.
async fn classify_response(response: reqwest::Response) -> GatewayResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.text().await {
        Ok(body) => {
            let mut body = body;
            body.truncate(512);
            body
        }
        Err(_) => String::new(),
    };
    Err(GatewayError::BackendRejected {
        status: status.as_u16(),
        message,
    })
}

/// Copy backend response headers onto the outbound response, skipping
/// hop-by-hop headers. `Content-Type` and `Content-Disposition` pass through
/// so Arrow replies arrive with the right streaming content type and
/// attachment filename.
fn copy_response_headers(
    upstream: &reqwest::header::HeaderMap,
    outbound: &mut axum::http::HeaderMap,
) {
    for (name, value) in upstream {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name_str.as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            outbound.append(name, value);
        }
    }
}

/// Cumulative transfer accounting, logged at a coarse granularity so logging
/// never becomes the throughput bottleneck.
struct TransferProgress {
    route: String,
    total: u64,
    last_logged: u64,
    log_every: u64,
}

impl TransferProgress {
    fn new(route: &str, log_every: u64) -> Self {
        Self {
            route: route.to_string(),
            total: 0,
            last_logged: 0,
            log_every: log_every.max(1),
        }
    }

    fn record(&mut self, len: usize) {
        self.total += len as u64;
        if self.total - self.last_logged >= self.log_every {
            tracing::info!(
                route = %self.route,
                transferred_mb = self.total / (1024 * 1024),
                "transfer in progress"
            );
            self.last_logged = self.total;
        }
    }

    fn finish(&self) {
        tracing::debug!(
            route = %self.route,
            total_bytes = self.total,
            "transfer complete"
        );
    }
}

/// Wrap a byte stream with an idle-between-chunks deadline, coarse progress
/// logging and error mapping. Any upstream error or deadline becomes an
/// `io::Error`, which aborts the consuming connection.
fn instrument_stream<S, E>(
    route: &str,
    stream: S,
    idle_timeout: Duration,
    log_every: u64,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + Sync + 'static,
{
    let progress = TransferProgress::new(route, log_every);
    futures::stream::try_unfold(
        (Box::pin(stream), progress),
        move |(mut stream, mut progress)| async move {
            match tokio::time::timeout(idle_timeout, stream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    progress.record(chunk.len());
                    Ok(Some((chunk, (stream, progress))))
                }
                Ok(Some(Err(err))) => Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    format!("mid-stream failure: {err}"),
                )),
                Ok(None) => {
                    progress.finish();
                    Ok(None)
                }
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no data for {idle_timeout:?}, aborting stream"),
                )),
            }
        },
    )
}
