//! Tiered fixed-window rate limiting.
//!
//! The outermost layer of the pipeline: runs before the cache, the guard and
//! the backend, and is independent of identity (keyed per client address).
//! Each tier keeps its own window counters and applies independently; a
//! request over the limit in any tier is rejected with a `Retry-After` hint
//! derived from the remaining window.

use dashmap::DashMap;
use std::time::Instant;

use crate::core::config::{RateLimitConfig, RateLimitTier};
use crate::core::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone)]
struct WindowBucket {
    window_start: Instant,
    count: u32,
}

struct Tier {
    spec: RateLimitTier,
    buckets: DashMap<String, WindowBucket>,
}

/// Multi-tier request-count limiter.
pub struct RateLimiter {
    tiers: Vec<Tier>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            tiers: config
                .tiers
                .into_iter()
                .map(|spec| Tier {
                    spec,
                    buckets: DashMap::new(),
                })
                .collect(),
        }
    }

    /// Count one request for `key` against every tier.
    ///
    /// All tiers are charged even when one rejects, so a client hammering a
    /// short window still burns through its long-window allowance.
    pub fn check(&self, key: &str) -> GatewayResult<()> {
        let now = Instant::now();
        let mut violation: Option<GatewayError> = None;

        for tier in &self.tiers {
            let mut bucket = tier
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| WindowBucket {
                    window_start: now,
                    count: 0,
                });

            if now.duration_since(bucket.window_start) >= tier.spec.window {
                bucket.window_start = now;
                bucket.count = 0;
            }
            bucket.count += 1;

            if bucket.count > tier.spec.limit && violation.is_none() {
                let elapsed = now.duration_since(bucket.window_start);
                let remaining = tier.spec.window.saturating_sub(elapsed);
                violation = Some(GatewayError::RateLimited {
                    limit: tier.spec.limit,
                    window: format!("{:?}", tier.spec.window),
                    retry_after_secs: remaining.as_secs().max(1),
                });
            }
        }

        match violation {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop buckets whose window lies entirely in the past.
    pub fn sweep(&self) {
        let now = Instant::now();
        for tier in &self.tiers {
            tier.buckets
                .retain(|_, bucket| now.duration_since(bucket.window_start) < tier.spec.window * 2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(tiers: Vec<(u32, Duration)>) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            tiers: tiers
                .into_iter()
                .enumerate()
                .map(|(i, (limit, window))| RateLimitTier {
                    name: format!("tier-{i}"),
                    limit,
                    window,
                })
                .collect(),
        })
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = limiter(vec![(3, Duration::from_secs(10))]);
        for _ in 0..3 {
            limiter.check("10.0.0.1").unwrap();
        }
        let err = limiter.check("10.0.0.1").unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { limit: 3, .. }));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(vec![(1, Duration::from_secs(10))]);
        limiter.check("10.0.0.1").unwrap();
        limiter.check("10.0.0.2").unwrap();
        assert!(limiter.check("10.0.0.1").is_err());
    }

    #[test]
    fn test_window_resets() {
        let limiter = limiter(vec![(1, Duration::from_millis(20))]);
        limiter.check("10.0.0.1").unwrap();
        assert!(limiter.check("10.0.0.1").is_err());

        std::thread::sleep(Duration::from_millis(30));
        limiter.check("10.0.0.1").unwrap();
    }

    #[test]
    fn test_any_tier_violation_rejects() {
        // Generous short window, tight long window.
        let limiter = limiter(vec![
            (100, Duration::from_millis(50)),
            (2, Duration::from_secs(60)),
        ]);
        limiter.check("10.0.0.1").unwrap();
        limiter.check("10.0.0.1").unwrap();
        let err = limiter.check("10.0.0.1").unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { limit: 2, .. }));
    }

    #[test]
    fn test_retry_after_is_positive() {
        let limiter = limiter(vec![(1, Duration::from_secs(10))]);
        limiter.check("10.0.0.1").unwrap();
        match limiter.check("10.0.0.1").unwrap_err() {
            GatewayError::RateLimited {
                retry_after_secs, ..
            } => assert!(retry_after_secs >= 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
