//! Per-key circuit breaker.
//!
//! Three-state guard (Closed/Open/HalfOpen) that short-circuits a key after
//! repeated failures. The Open→HalfOpen transition happens lazily inside
//! [`observe`](CircuitBreaker::observe): callers must tolerate state changes
//! from read-looking calls.

use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use crate::config::CircuitBreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Requests flow normally.
    Closed,
    /// Requests are short-circuited.
    Open,
    /// A limited number of probe requests is allowed through.
    HalfOpen,
    /// Breaker is configured off; never opens.
    Disabled,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    requests: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
    last_reset: Instant,
}

/// Circuit breaker guarding a single key.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let state = if config.enabled {
            BreakerState::Closed
        } else {
            BreakerState::Disabled
        };
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state,
                failures: 0,
                requests: 0,
                half_open_successes: 0,
                last_failure: None,
                last_reset: Instant::now(),
            }),
        }
    }

    /// Current state after applying any due lazy transition.
    ///
    /// An Open breaker whose recovery timeout has elapsed moves to HalfOpen
    /// here, as a side effect of observation.
    pub fn observe(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::Open
            && let Some(last_failure) = inner.last_failure
            && last_failure.elapsed() >= self.config.recovery_timeout
        {
            inner.state = BreakerState::HalfOpen;
            inner.half_open_successes = 0;
        }
        inner.state
    }

    /// Whether requests should currently be short-circuited.
    pub fn is_open(&self) -> bool {
        self.observe() == BreakerState::Open
    }

    /// Record a successful request through this key.
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.requests += 1;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_requests {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.half_open_successes = 0;
                    inner.last_reset = Instant::now();
                }
            }
            _ => {
                inner.state = BreakerState::Closed;
                inner.failures = 0;
            }
        }
    }

    /// Record a failed request through this key.
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.requests += 1;
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            // A probe failure sends the breaker straight back to Open.
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.half_open_successes = 0;
            }
            BreakerState::Closed if inner.failures >= self.config.failure_threshold => {
                inner.state = BreakerState::Open;
            }
            _ => {}
        }
    }

    /// Recorded consecutive failures.
    pub fn failures(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").failures
    }
}
