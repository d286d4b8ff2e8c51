//! OIDC authorization-code flow against the identity provider.
//!
//! The gateway consumes three provider endpoints, resolved once at startup
//! from the standard discovery document: `authorization_endpoint`,
//! `token_endpoint` and the optional `end_session_endpoint`. Discovery
//! failure is fatal — a gateway that cannot log anyone in should not come up.
//!
//! Role extraction is deliberately non-reflective: the two claim locations
//! Keycloak-style tokens use (`realm_access.roles` and every
//! `resource_access.<client>.roles`) are enumerated explicitly and unioned
//! into a deduplicated set. Roles are captured once at login and are not
//! refreshed for the lifetime of the session.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use url::Url;

use crate::core::config::OidcConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// The authenticated identity attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    #[serde(default)]
    pub email: Option<String>,
    /// `None` only for corrupted session payloads that predate the roles
    /// field or lost it in transit; the guard rejects those with a dedicated
    /// error. A healthy login always produces `Some`, possibly empty.
    #[serde(default)]
    pub roles: Option<HashSet<String>>,
    pub tokens: TokenSet,
}

/// Tokens returned by the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Subset of the discovery document the gateway consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Decoded access-token claims. Only the fields the gateway reads.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub realm_access: Option<RoleClaim>,
    #[serde(default)]
    pub resource_access: Option<HashMap<String, RoleClaim>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleClaim {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Union of realm-level and per-client roles, deduplicated.
pub fn extract_roles(claims: &AccessTokenClaims) -> HashSet<String> {
    let mut roles = HashSet::new();
    if let Some(realm) = &claims.realm_access {
        roles.extend(realm.roles.iter().cloned());
    }
    if let Some(clients) = &claims.resource_access {
        for claim in clients.values() {
            roles.extend(claim.roles.iter().cloned());
        }
    }
    roles
}

/// Decode the access token's claims without verifying the signature.
///
/// The gateway received this token over TLS directly from the token endpoint
/// it was configured with; it is not accepting tokens from clients. The
/// backend never sees the token at all — it trusts the identity headers plus
/// the shared secret.
pub fn decode_access_token(token: &str) -> GatewayResult<AccessTokenClaims> {
    let mut validation = jsonwebtoken::Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = Default::default();

    let data = jsonwebtoken::decode::<AccessTokenClaims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(&[]),
        &validation,
    )
    .map_err(|e| GatewayError::token_decode(e.to_string()))?;
    Ok(data.claims)
}

/// OIDC client bound to one provider and one registered client.
pub struct OidcClient {
    http: reqwest::Client,
    config: OidcConfig,
    metadata: ProviderMetadata,
}

impl OidcClient {
    /// Resolve provider endpoints from the discovery document. Called once at
    /// startup; any failure here is a `Configuration` error and the process
    /// must not start.
    pub async fn discover(config: OidcConfig) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.token_timeout)
            .build()
            .map_err(|e| GatewayError::config(format!("cannot build OIDC http client: {e}")))?;

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            config.issuer.trim_end_matches('/')
        );
        let metadata: ProviderMetadata = http
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| GatewayError::config(format!("OIDC discovery failed: {e}")))?
            .error_for_status()
            .map_err(|e| GatewayError::config(format!("OIDC discovery failed: {e}")))?
            .json()
            .await
            .map_err(|e| GatewayError::config(format!("invalid OIDC discovery document: {e}")))?;

        Ok(Self::with_metadata(config, metadata))
    }

    /// Build a client from already-known endpoints (tests, pinned setups).
    pub fn with_metadata(config: OidcConfig, metadata: ProviderMetadata) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.token_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            config,
            metadata,
        }
    }

    /// Authorization-server URL the browser is redirected to for login.
    pub fn build_login_redirect(&self, state: &str) -> GatewayResult<Url> {
        let mut url = Url::parse(&self.metadata.authorization_endpoint)
            .map_err(|e| GatewayError::config(format!("invalid authorization_endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scope)
            .append_pair("state", state);
        Ok(url)
    }

    /// Exchange an authorization code for tokens and build the `Principal`.
    pub async fn handle_callback(&self, code: &str) -> GatewayResult<Principal> {
        let tokens = self.exchange_code(code).await?;
        let claims = decode_access_token(&tokens.access_token)?;
        let roles = extract_roles(&claims);
        tracing::info!(
            subject = %claims.sub,
            role_count = roles.len(),
            "authorization code exchanged"
        );
        Ok(Principal {
            subject: claims.sub,
            email: claims.email,
            roles: Some(roles),
            tokens,
        })
    }

    async fn exchange_code(&self, code: &str) -> GatewayResult<TokenSet> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.metadata.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| GatewayError::auth_exchange(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::auth_exchange(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        response
            .json::<TokenSet>()
            .await
            .map_err(|e| GatewayError::auth_exchange(format!("invalid token response: {e}")))
    }

    /// Identity-provider logout URL when the provider advertises one.
    ///
    /// Returns `None` when the discovery document had no
    /// `end_session_endpoint`; the caller then falls back to the configured
    /// post-logout redirect.
    pub fn end_session_url(&self, id_token: Option<&str>) -> Option<Url> {
        let endpoint = self.metadata.end_session_endpoint.as_deref()?;
        let mut url = Url::parse(endpoint).ok()?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair(
                "post_logout_redirect_uri",
                &self.config.post_logout_redirect,
            );
            if let Some(token) = id_token {
                pairs.append_pair("id_token_hint", token);
            }
        }
        Some(url)
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }
}
