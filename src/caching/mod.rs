//! Short-TTL response cache for idempotent GET reads.
//!
//! Keyed by the full request URL including the query string. Exclusion is by
//! path prefix and unconditional: health, metrics and every auth/identity
//! endpoint must never be served stale, whatever the method. There is no
//! explicit invalidation — analytics reads tolerate brief staleness and
//! entries simply age out.
//!
//! Only bounded JSON bodies are captured; streamed Arrow payloads pass the
//! cache by entirely (capturing them would defeat the bounded-memory
//! contract of the proxy).

use bytes::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::core::config::CacheConfig;

/// One memoized response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    inserted_at: Instant,
    ttl: Duration,
}

impl CachedResponse {
    pub fn new(status: u16, content_type: Option<String>, body: Bytes, ttl: Duration) -> Self {
        Self {
            status,
            content_type,
            body,
            inserted_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// In-process response cache. Held in the application state as an explicit
/// keyed store so it can be swapped for a distributed one under horizontal
/// scaling.
pub struct ResponseCache {
    config: CacheConfig,
    entries: DashMap<String, CachedResponse>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Whether responses for this path may be cached at all.
    pub fn is_cacheable_path(&self, path: &str) -> bool {
        !self
            .config
            .excluded_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Whether a body of this size may be captured.
    pub fn is_capturable_size(&self, len: usize) -> bool {
        len <= self.config.max_body_bytes
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Look up by full URL (path + query). Expired entries are removed on
    /// read.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(entry.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        None
    }

    pub fn insert(&self, key: String, response: CachedResponse) {
        self.entries.insert(key, response);
    }

    /// Drop every expired entry. Run periodically so abandoned keys do not
    /// accumulate between reads.
    pub fn sweep(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
