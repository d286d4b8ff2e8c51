//! Error taxonomy for the gateway.
//!
//! Every failure that can surface from the proxy pipeline is a variant of
//! [`GatewayError`], built with `thiserror`. The variants map one-to-one onto
//! the HTTP statuses the dashboard sees: authentication problems become 401,
//! authorization problems 403, resilience rejections 503, timeouts 504, and
//! mid-stream transport failures 502. `BackendRejected` is the exception: it
//! carries the engine's original status and message through unchanged.
//!
//! Retry classification lives here too ([`GatewayError::is_retryable`]) so the
//! retry operator and the circuit breaker agree on what counts as transient.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result alias used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// All failure modes of the gateway pipeline.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Invalid or missing configuration. Fatal at startup, never per-request.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The OIDC token endpoint rejected the authorization-code exchange.
    #[error("Authorization code exchange failed: {reason}")]
    AuthExchange { reason: String },

    /// The access token returned by the identity provider could not be decoded.
    #[error("Access token decode failed: {reason}")]
    TokenDecode { reason: String },

    /// No principal is attached to a request that requires one.
    #[error("Authentication required")]
    Unauthenticated,

    /// A principal exists but its session payload carries no roles collection.
    /// Distinct from an empty-but-valid roles set, which yields `Forbidden`.
    #[error("Session is corrupted: principal carries no roles collection")]
    CorruptedSession,

    /// The principal's roles do not intersect the route's required roles.
    #[error("Access denied: missing required role")]
    Forbidden,

    /// The engine answered with an HTTP error that is not worth retrying,
    /// or retries were exhausted on an HTTP-level failure. The original
    /// status and message propagate to the caller.
    #[error("Backend rejected the request ({status}): {message}")]
    BackendRejected { status: u16, message: String },

    /// The engine could not be reached at all (connect failure, retries
    /// exhausted on transport errors).
    #[error("Backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// The circuit breaker for this route is open; the engine was not called.
    #[error("Circuit open for route: {route}")]
    CircuitOpen { route: String },

    /// A connect, first-byte or store round-trip deadline elapsed.
    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The backend connection died mid-stream, after response headers were
    /// already committed or while relaying body bytes.
    #[error("Bad gateway: {reason}")]
    BadGateway { reason: String },

    /// A rate-limit tier rejected the request.
    #[error("Rate limit exceeded: {limit} requests per {window}")]
    RateLimited {
        limit: u32,
        window: String,
        retry_after_secs: u64,
    },

    /// Malformed inbound request (bad query parameter, missing multipart body).
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Catch-all for unexpected internal failures.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn auth_exchange<S: Into<String>>(reason: S) -> Self {
        Self::AuthExchange {
            reason: reason.into(),
        }
    }

    pub fn token_decode<S: Into<String>>(reason: S) -> Self {
        Self::TokenDecode {
            reason: reason.into(),
        }
    }

    pub fn unavailable<S: Into<String>>(reason: S) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    pub fn bad_gateway<S: Into<String>>(reason: S) -> Self {
        Self::BadGateway {
            reason: reason.into(),
        }
    }

    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status the client observes for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AuthExchange { .. } => StatusCode::BAD_GATEWAY,
            Self::TokenDecode { .. } => StatusCode::UNAUTHORIZED,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::CorruptedSession => StatusCode::FORBIDDEN,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BackendRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error type for API responses.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::AuthExchange { .. } => "auth_exchange_error",
            Self::TokenDecode { .. } => "token_decode_error",
            Self::Unauthenticated => "unauthenticated",
            Self::CorruptedSession => "corrupted_session",
            Self::Forbidden => "forbidden",
            Self::BackendRejected { .. } => "backend_rejected",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout { .. } => "timeout",
            Self::BadGateway { .. } => "bad_gateway",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Whether the retry operator may attempt this call again.
    ///
    /// Transport failures, timeouts and 5xx/429 responses are transient.
    /// Any other backend 4xx means the request itself is wrong and a retry
    /// cannot succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BackendUnavailable { .. } => true,
            Self::Timeout { .. } => true,
            Self::BadGateway { .. } => true,
            Self::BackendRejected { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            _ => false,
        }
    }

    /// Terminal translation applied after retries are exhausted: transport
    /// failures and timeouts collapse into `BackendUnavailable`, HTTP-level
    /// rejections keep the backend's status and message.
    pub fn into_terminal(self) -> Self {
        match self {
            Self::BadGateway { reason } => Self::BackendUnavailable { reason },
            Self::Timeout { timeout_ms } => Self::BackendUnavailable {
                reason: format!("backend timed out after {timeout_ms}ms on every attempt"),
            },
            other => other,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {err}"),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("YAML error: {err}"),
        }
    }
}

/// Maps a `reqwest` failure onto the taxonomy. Connect failures become
/// `BackendUnavailable`, elapsed deadlines become `Timeout`, anything that
/// happened after the connection was up becomes `BadGateway`.
impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { timeout_ms: 0 }
        } else if err.is_connect() {
            Self::BackendUnavailable {
                reason: err.to_string(),
            }
        } else {
            Self::BadGateway {
                reason: err.to_string(),
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited {
            retry_after_secs, ..
        } = self
        {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
