//! Per-route circuit breaker.
//!
//! One state machine exists per logical downstream route for the lifetime of
//! the process; all concurrent calls to the same route share it. State
//! transitions are read-modify-write under a per-route mutex — fine-grained
//! locking, never a global lock — and each transition completes within one
//! synchronous critical section.
//!
//! States: `Closed` passes calls through and counts consecutive failures;
//! at `failure_threshold` the breaker opens. `Open` rejects immediately with
//! `CircuitOpen` until `open_to_half_open_wait` elapses, then admits trial
//! calls (`HalfOpen`) one at a time — while a trial is outstanding every
//! other caller is rejected as if the circuit were still open. Consecutive
//! trial successes reaching `success_threshold` close the circuit; a trial
//! failure reopens it and resets the clock.
//!
//! The breaker records one outcome per logical call: the retry operator runs
//! inside it, so exhausted retries count as a single failure, not one per
//! attempt.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::core::config::CircuitBreakerConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Circuit breaker state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerState {
    /// Normal operation; counts consecutive failures.
    Closed { consecutive_failures: u32 },
    /// Rejecting calls; records when the circuit opened.
    Open { opened_at: Instant },
    /// Trial mode; counts consecutive trial successes and whether a trial
    /// call is currently outstanding.
    HalfOpen {
        consecutive_successes: u32,
        trial_in_flight: bool,
    },
}

/// Breaker guarding one logical downstream route.
pub struct CircuitBreaker {
    route: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(route: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            route: route.into(),
            config,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn state(&self) -> BreakerState {
        self.state.lock().clone()
    }

    /// Admission check. `Ok` passes the call through (possibly as the
    /// half-open trial); `Err` rejects without contacting the backend.
    /// Half-open admits one trial at a time: concurrent callers are rejected
    /// until the outstanding trial resolves.
    pub fn can_proceed(&self) -> GatewayResult<()> {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::HalfOpen {
                trial_in_flight: true,
                ..
            } => Err(GatewayError::CircuitOpen {
                route: self.route.clone(),
            }),
            BreakerState::HalfOpen {
                consecutive_successes,
                trial_in_flight: false,
            } => {
                *state = BreakerState::HalfOpen {
                    consecutive_successes,
                    trial_in_flight: true,
                };
                Ok(())
            }
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.open_to_half_open_wait {
                    // Wait elapsed: this call is the trial.
                    *state = BreakerState::HalfOpen {
                        consecutive_successes: 0,
                        trial_in_flight: true,
                    };
                    tracing::info!(route = %self.route, "circuit half-open, admitting trial call");
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen {
                        route: self.route.clone(),
                    })
                }
            }
        }
    }

    /// Record the outcome of one logical call (after retries).
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed { .. } => {
                *state = BreakerState::Closed {
                    consecutive_failures: 0,
                };
            }
            BreakerState::HalfOpen {
                consecutive_successes,
                ..
            } => {
                let successes = consecutive_successes + 1;
                if successes >= self.config.success_threshold {
                    *state = BreakerState::Closed {
                        consecutive_failures: 0,
                    };
                    tracing::info!(route = %self.route, "circuit closed after successful trials");
                } else {
                    // Trial resolved: the next caller becomes the next trial.
                    *state = BreakerState::HalfOpen {
                        consecutive_successes: successes,
                        trial_in_flight: false,
                    };
                }
            }
            // A success cannot arrive while open: can_proceed rejected the call.
            BreakerState::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        match *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    *state = BreakerState::Open {
                        opened_at: Instant::now(),
                    };
                    tracing::warn!(
                        route = %self.route,
                        failures,
                        "circuit opened"
                    );
                } else {
                    *state = BreakerState::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            BreakerState::HalfOpen { .. } => {
                // Trial failed: reopen and reset the clock.
                *state = BreakerState::Open {
                    opened_at: Instant::now(),
                };
                tracing::warn!(route = %self.route, "trial call failed, circuit reopened");
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Run one logical call through the breaker. Rejection yields
    /// `CircuitOpen` without touching the backend.
    pub async fn call<T, Fut>(&self, fut: Fut) -> GatewayResult<T>
    where
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.can_proceed()?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Like [`call`](Self::call), but a rejection runs `fallback` and the
    /// caller observes its result instead of the raw `CircuitOpen`.
    pub async fn call_with_fallback<T, Fut, F>(&self, fut: Fut, fallback: F) -> GatewayResult<T>
    where
        Fut: Future<Output = GatewayResult<T>>,
        F: FnOnce(GatewayError) -> GatewayResult<T>,
    {
        if let Err(rejection) = self.can_proceed() {
            return fallback(rejection);
        }
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}

/// Keyed store of breakers: route identity, not per-request. Held in the
/// application state so it could be swapped for a distributed store later.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Get the breaker for a route, creating it on first use.
    pub fn for_route(&self, route: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(route.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(route, self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_to_half_open_wait: Duration::from_millis(50),
        }
    }

    fn failure() -> GatewayError {
        GatewayError::unavailable("connection refused")
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("window", test_config());

        for i in 1..=3u32 {
            let result: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
            assert!(result.is_err());
            if i < 3 {
                assert!(matches!(
                    breaker.state(),
                    BreakerState::Closed {
                        consecutive_failures
                    } if consecutive_failures == i
                ));
            }
        }
        assert!(matches!(breaker.state(), BreakerState::Open { .. }));
    }

    #[tokio::test]
    async fn test_open_rejects_without_calling_backend() {
        let breaker = CircuitBreaker::new("window", test_config());
        for _ in 0..3 {
            let _: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
        }

        let mut backend_called = false;
        let result = breaker
            .call(async {
                backend_called = true;
                Ok::<_, GatewayError>(())
            })
            .await;

        assert!(matches!(
            result.unwrap_err(),
            GatewayError::CircuitOpen { .. }
        ));
        assert!(!backend_called);
    }

    #[tokio::test]
    async fn test_trial_after_wait_then_closes_on_success_threshold() {
        let breaker = CircuitBreaker::new("window", test_config());
        for _ in 0..3 {
            let _: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
        }

        tokio::time::sleep(Duration::from_millis(70)).await;

        // First trial succeeds but one success is below the threshold.
        breaker.call(async { Ok::<_, GatewayError>(()) }).await.unwrap();
        assert!(matches!(
            breaker.state(),
            BreakerState::HalfOpen {
                consecutive_successes: 1,
                trial_in_flight: false
            }
        ));

        breaker.call(async { Ok::<_, GatewayError>(()) }).await.unwrap();
        assert!(matches!(
            breaker.state(),
            BreakerState::Closed {
                consecutive_failures: 0
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("window", test_config());
        for _ in 0..3 {
            let _: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        let _: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
        assert!(matches!(breaker.state(), BreakerState::Open { .. }));

        // The reopened circuit rejects again until the wait elapses anew.
        let result: GatewayResult<()> = breaker.call(async { Ok(()) }).await;
        assert!(matches!(
            result.unwrap_err(),
            GatewayError::CircuitOpen { .. }
        ));
    }

    #[tokio::test]
    async fn test_half_open_rejects_second_caller_while_trial_outstanding() {
        let breaker = CircuitBreaker::new("window", test_config());
        for _ in 0..3 {
            let _: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        // First caller is admitted as the trial.
        breaker.can_proceed().unwrap();
        // A concurrent caller is rejected while the trial is outstanding.
        assert!(matches!(
            breaker.can_proceed(),
            Err(GatewayError::CircuitOpen { .. })
        ));

        // The resolved trial frees the slot for the next one.
        breaker.record_success();
        breaker.can_proceed().unwrap();
    }

    #[tokio::test]
    async fn test_half_open_admits_one_concurrent_trial() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let breaker = Arc::new(CircuitBreaker::new("window", test_config()));
        for _ in 0..3 {
            let _: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
        }
        tokio::time::sleep(Duration::from_millis(70)).await;

        let admitted = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let breaker = breaker.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                breaker
                    .call(async {
                        admitted.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, GatewayError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_runs_on_rejection() {
        let breaker = CircuitBreaker::new("window", test_config());
        for _ in 0..3 {
            let _: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
        }

        let result = breaker
            .call_with_fallback(async { Ok::<_, GatewayError>("live") }, |_| Ok("fallback"))
            .await;
        assert_eq!(result.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("window", test_config());
        let _: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
        let _: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
        breaker.call(async { Ok::<_, GatewayError>(()) }).await.unwrap();

        // Two more failures stay below the threshold after the reset.
        let _: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
        let _: GatewayResult<()> = breaker.call(async { Err(failure()) }).await;
        assert!(matches!(breaker.state(), BreakerState::Closed { .. }));
    }

    #[test]
    fn test_registry_returns_same_instance_per_route() {
        let registry = BreakerRegistry::new(test_config());
        let a = registry.for_route("window");
        let b = registry.for_route("window");
        let c = registry.for_route("datasets");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.route(), "datasets");
    }
}
