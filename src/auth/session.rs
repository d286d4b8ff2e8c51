//! Session state and the externally shared session store.
//!
//! A [`Session`] binds a random identifier to a [`Principal`] with a rolling
//! TTL: every authenticated request pushes `expires_at` forward. Expiry is
//! enforced store-side (Redis key TTL); the application never reaps sessions
//! itself. The [`SessionStore`] trait keeps the store swappable — Redis in
//! production so any gateway instance can serve any request, an in-process
//! map for development and tests.

use async_trait::async_trait;
use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::auth::oidc::Principal;
use crate::core::error::{GatewayError, GatewayResult};

/// One authenticated browser session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub principal: Principal,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session for a principal produced by the login callback.
    pub fn new(principal: Principal, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            principal,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        }
    }
}

/// Externally shared, TTL-based session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, session: &Session, ttl: Duration) -> GatewayResult<()>;
    async fn get(&self, session_id: &str) -> GatewayResult<Option<Session>>;
    /// Extend the session's TTL without rewriting the payload.
    async fn touch(&self, session_id: &str, ttl: Duration) -> GatewayResult<()>;
    async fn delete(&self, session_id: &str) -> GatewayResult<()>;
}

/// Redis-backed store. Keys carry the TTL; a crashed gateway leaves nothing
/// to clean up.
pub struct RedisSessionStore {
    manager: redis::aio::ConnectionManager,
    key_prefix: String,
}

impl RedisSessionStore {
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::config(format!("invalid session redis url: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| GatewayError::config(format!("cannot connect to session redis: {e}")))?;
        Ok(Self {
            manager,
            key_prefix: "session:".to_string(),
        })
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}{}", self.key_prefix, session_id)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn put(&self, session: &Session, ttl: Duration) -> GatewayResult<()> {
        let payload = serde_json::to_string(session)?;
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(self.key(&session.session_id), payload, ttl.as_secs())
            .await
            .map_err(|e| GatewayError::internal(format!("session store put: {e}")))
    }

    async fn get(&self, session_id: &str) -> GatewayResult<Option<Session>> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = conn
            .get(self.key(session_id))
            .await
            .map_err(|e| GatewayError::internal(format!("session store get: {e}")))?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn touch(&self, session_id: &str, ttl: Duration) -> GatewayResult<()> {
        let mut conn = self.manager.clone();
        conn.expire::<_, ()>(self.key(session_id), ttl.as_secs() as i64)
            .await
            .map_err(|e| GatewayError::internal(format!("session store touch: {e}")))
    }

    async fn delete(&self, session_id: &str) -> GatewayResult<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(self.key(session_id))
            .await
            .map_err(|e| GatewayError::internal(format!("session store delete: {e}")))
    }
}

/// In-process store for development and tests. Not shared across instances.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: DashMap<String, (Session, Instant)>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, session: &Session, ttl: Duration) -> GatewayResult<()> {
        self.entries.insert(
            session.session_id.clone(),
            (session.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn get(&self, session_id: &str) -> GatewayResult<Option<Session>> {
        if let Some(entry) = self.entries.get(session_id) {
            let (session, deadline) = entry.value();
            if Instant::now() < *deadline {
                return Ok(Some(session.clone()));
            }
        }
        // Expired entries are dropped lazily.
        self.entries
            .remove_if(session_id, |_, (_, deadline)| Instant::now() >= *deadline);
        Ok(None)
    }

    async fn touch(&self, session_id: &str, ttl: Duration) -> GatewayResult<()> {
        if let Some(mut entry) = self.entries.get_mut(session_id) {
            entry.value_mut().1 = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> GatewayResult<()> {
        self.entries.remove(session_id);
        Ok(())
    }
}

/// Session cookie: httpOnly, SameSite=Lax, rolling max-age.
pub fn session_cookie(
    name: &str,
    session_id: &str,
    ttl: Duration,
    secure: bool,
) -> Cookie<'static> {
    Cookie::build((name.to_string(), session_id.to_string()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(time::Duration::seconds(ttl.as_secs() as i64))
        .build()
}

/// Removal cookie used on logout.
pub fn clear_session_cookie(name: &str) -> Cookie<'static> {
    Cookie::build((name.to_string(), String::new()))
        .http_only(true)
        .path("/")
        .max_age(time::Duration::ZERO)
        .build()
}
