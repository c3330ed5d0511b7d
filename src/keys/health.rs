//! Per-key health tracking and backoff.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{BackoffConfig, KeyHealthConfig};
use crate::keys::breaker::CircuitBreaker;

/// Health state for a single key in a pool.
#[derive(Debug)]
pub struct KeyHealth {
    pub success_count: u64,
    /// Consecutive failures; reset to zero by any success.
    pub failure_count: u64,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub is_healthy: bool,
    pub backoff_until: Option<Instant>,
    pub request_count: u64,
    pub breaker: CircuitBreaker,
}

impl KeyHealth {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            last_success: None,
            last_failure: None,
            is_healthy: true,
            backoff_until: None,
            request_count: 0,
            breaker,
        }
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
        self.failure_count = 0;
        self.last_success = Some(Instant::now());
        self.is_healthy = true;
        self.backoff_until = None;
        self.request_count += 1;
        self.breaker.record_success();
    }

    pub fn record_failure(&mut self, config: &KeyHealthConfig) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());
        self.request_count += 1;
        let backoff = compute_backoff(self.failure_count, &config.backoff, config.enabled);
        self.backoff_until = if backoff.is_zero() {
            None
        } else {
            Some(Instant::now() + backoff)
        };
        if self.failure_count >= u64::from(config.failure_threshold) {
            self.is_healthy = false;
        }
        self.breaker.record_failure();
    }

    /// Failures as a fraction of requests seen.
    pub fn error_rate(&self) -> f64 {
        self.failure_count as f64 / (self.request_count.max(1)) as f64
    }

    /// Whether the key may be selected right now: out of backoff and the
    /// breaker is not open.
    pub fn is_available(&self) -> bool {
        let backoff_clear = match self.backoff_until {
            Some(until) => Instant::now() >= until,
            None => true,
        };
        backoff_clear && !self.breaker.is_open()
    }

    /// Selection weight for the weighted strategy. Zero for unhealthy keys;
    /// at least one for healthy ones so a struggling pool stays usable.
    pub fn weight(&self) -> u64 {
        if !self.is_healthy {
            return 0;
        }
        let raw = 10i64 - 2 * self.failure_count as i64 + self.success_count as i64;
        raw.max(1) as u64
    }
}

/// Exponential backoff for the given consecutive failure count.
///
/// `initial · multiplier^(f−1)` capped at `maximum`, plus a small uniform
/// jitter of up to 0.1% of the base when enabled. Zero when health tracking
/// is disabled or there are no failures.
pub fn compute_backoff(failures: u64, config: &BackoffConfig, enabled: bool) -> Duration {
    if !enabled || failures == 0 {
        return Duration::ZERO;
    }

    let initial = config.initial.as_secs_f64();
    let maximum = config.maximum.as_secs_f64();
    let exponent = (failures - 1).min(63) as i32;
    let base = (initial * config.multiplier.powi(exponent)).min(maximum);

    let jittered = if config.jitter {
        base + rand::thread_rng().gen_range(0.0..=base * 0.001)
    } else {
        base
    };
    Duration::from_secs_f64(jittered)
}
