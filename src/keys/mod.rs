//! Multi-key pool with health tracking, backoff, and failover.
//!
//! A [`KeyManager`] owns an ordered pool of interchangeable API keys for one
//! provider. Selection follows the configured strategy; per-key health feeds
//! backoff windows and a circuit breaker, and
//! [`execute_with_failover`](KeyManager::execute_with_failover) walks the
//! pool until an attempt succeeds or the pool is exhausted.

pub mod breaker;
pub mod health;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rand::Rng;
use rand::rngs::OsRng;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::{ApiKeyPoolConfig, SelectionStrategy, TokenMaskingConfig};
use crate::error::{AuthError, Result};
use crate::security::masking::mask_token;

pub use breaker::{BreakerState, CircuitBreaker};
pub use health::{KeyHealth, compute_backoff};

struct PoolState {
    /// Insertion order, unique.
    keys: Vec<String>,
    health: HashMap<String, KeyHealth>,
}

/// Manages a pool of API keys for a single provider.
pub struct KeyManager {
    provider: String,
    config: ApiKeyPoolConfig,
    masking: TokenMaskingConfig,
    state: RwLock<PoolState>,
    cursor: AtomicUsize,
}

/// Health snapshot for one key. Key text is masked.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub key: String,
    pub healthy: bool,
    pub available: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub request_count: u64,
    pub error_rate: f64,
    /// Milliseconds until the backoff window clears, when one is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_remaining_ms: Option<u64>,
    pub breaker: BreakerState,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub provider: String,
    pub strategy: SelectionStrategy,
    pub keys: Vec<KeyStatus>,
    pub healthy_keys: usize,
    pub unhealthy_keys: usize,
    pub is_healthy: bool,
}

impl KeyManager {
    /// Create a pool for `provider` with the given keys.
    ///
    /// Empty and duplicate keys are rejected.
    pub fn new(
        provider: impl Into<String>,
        keys: Vec<String>,
        config: ApiKeyPoolConfig,
        masking: TokenMaskingConfig,
    ) -> Result<Self> {
        let provider = provider.into();
        let mut state = PoolState {
            keys: Vec::with_capacity(keys.len()),
            health: HashMap::new(),
        };
        for key in keys {
            if key.is_empty() {
                return Err(AuthError::invalid_config("API key must not be empty"));
            }
            if state.keys.contains(&key) {
                return Err(AuthError::invalid_config("duplicate API key in pool"));
            }
            state.health.insert(
                key.clone(),
                KeyHealth::new(CircuitBreaker::new(config.failover.circuit_breaker.clone())),
            );
            state.keys.push(key);
        }

        Ok(Self {
            provider,
            config,
            masking,
            state: RwLock::new(state),
            cursor: AtomicUsize::new(0),
        })
    }

    /// The provider this pool belongs to.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.keys.is_empty()
    }

    /// The first currently-available key, or the first key in insertion
    /// order when none is available. Does not advance selection state.
    pub async fn current(&self) -> Result<String> {
        let state = self.state.read().await;
        if state.keys.is_empty() {
            return Err(AuthError::InvalidCredentials {
                provider: self.provider.clone(),
                reason: "no API keys configured".to_string(),
            });
        }
        let available = state
            .keys
            .iter()
            .find(|k| state.health.get(*k).is_none_or(|h| h.is_available()));
        Ok(available.unwrap_or(&state.keys[0]).clone())
    }

    /// Advance the pool by strategy and return an available key.
    pub async fn next(&self) -> Result<String> {
        let state = self.state.read().await;
        if state.keys.is_empty() {
            return Err(AuthError::InvalidCredentials {
                provider: self.provider.clone(),
                reason: "no API keys configured".to_string(),
            });
        }

        let selected = match self.config.strategy {
            SelectionStrategy::RoundRobin => self.select_round_robin(&state),
            SelectionStrategy::Random => self.select_random(&state),
            SelectionStrategy::Weighted => self.select_weighted(&state),
        };

        selected.ok_or_else(|| AuthError::AllKeysExhausted {
            provider: self.provider.clone(),
            attempts: 0,
            source: None,
        })
    }

    fn select_round_robin(&self, state: &PoolState) -> Option<String> {
        let n = state.keys.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let key = &state.keys[(start + offset) % n];
            if state.health.get(key).is_none_or(|h| h.is_available()) {
                return Some(key.clone());
            }
        }
        None
    }

    fn select_random(&self, state: &PoolState) -> Option<String> {
        let available: Vec<&String> = state
            .keys
            .iter()
            .filter(|k| state.health.get(*k).is_none_or(|h| h.is_available()))
            .collect();
        if available.is_empty() {
            return None;
        }
        let index = OsRng.gen_range(0..available.len());
        Some(available[index].clone())
    }

    fn select_weighted(&self, state: &PoolState) -> Option<String> {
        let weighted: Vec<(&String, u64)> = state
            .keys
            .iter()
            .filter(|k| state.health.get(*k).is_none_or(|h| h.is_available()))
            .map(|k| (k, state.health.get(k).map_or(10, |h| h.weight())))
            .filter(|(_, w)| *w > 0)
            .collect();
        let total: u64 = weighted.iter().map(|(_, w)| w).sum();
        if total == 0 {
            return None;
        }
        let mut pick = OsRng.gen_range(0..total);
        for (key, weight) in weighted {
            if pick < weight {
                return Some(key.clone());
            }
            pick -= weight;
        }
        None
    }

    /// Record a successful request with `key`.
    pub async fn report_success(&self, key: &str) {
        let mut state = self.state.write().await;
        if let Some(health) = state.health.get_mut(key) {
            health.record_success();
        }
    }

    /// Record a failed request with `key`.
    pub async fn report_failure(&self, key: &str, err: &AuthError) {
        let mut state = self.state.write().await;
        if let Some(health) = state.health.get_mut(key) {
            health.record_failure(&self.config.health);
            tracing::debug!(
                provider = %self.provider,
                key = %self.mask(key),
                failures = health.failure_count,
                healthy = health.is_healthy,
                error = %err,
                "Key failure recorded"
            );
        }
    }

    /// Run `op` against successive keys until one attempt succeeds.
    ///
    /// Selects via [`next`](Self::next) for each attempt, reports the
    /// outcome back into key health, and stops after `max_attempts`
    /// (default `min(pool size, 3)`). Dropping the returned future cancels
    /// the loop at the next attempt boundary.
    pub async fn execute_with_failover<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let pool_size = self.len().await as u32;
        let attempts = if self.config.failover.enabled {
            self.config
                .failover
                .max_attempts
                .unwrap_or_else(|| pool_size.min(3))
                .max(1)
        } else {
            1
        };

        let mut last_error: Option<AuthError> = None;
        for attempt in 0..attempts {
            let key = match self.next().await {
                Ok(key) => key,
                Err(err) => {
                    last_error.get_or_insert(err);
                    break;
                }
            };

            tracing::debug!(
                provider = %self.provider,
                key = %self.mask(&key),
                attempt = attempt + 1,
                "Attempting request"
            );

            match op(key.clone()).await {
                Ok(result) => {
                    self.report_success(&key).await;
                    return Ok(result);
                }
                Err(err) => {
                    tracing::warn!(
                        provider = %self.provider,
                        key = %self.mask(&key),
                        error = %err,
                        "Request failed, trying next key"
                    );
                    self.report_failure(&key, &err).await;
                    last_error = Some(err);
                }
            }
        }

        Err(AuthError::AllKeysExhausted {
            provider: self.provider.clone(),
            attempts,
            source: last_error.map(Box::new),
        })
    }

    /// Add a key to the pool. Rejects empty and duplicate keys.
    pub async fn add_key(&self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(AuthError::invalid_config("API key must not be empty"));
        }
        let mut state = self.state.write().await;
        if state.keys.contains(&key) {
            return Err(AuthError::invalid_config("key already present in pool"));
        }
        state.health.insert(
            key.clone(),
            KeyHealth::new(CircuitBreaker::new(
                self.config.failover.circuit_breaker.clone(),
            )),
        );
        state.keys.push(key);
        Ok(())
    }

    /// Remove a key, preserving the relative order of the rest.
    pub async fn remove_key(&self, key: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(position) = state.keys.iter().position(|k| k == key) else {
            return Err(AuthError::KeyRotationFailed {
                provider: self.provider.clone(),
                reason: "key not present in pool".to_string(),
            });
        };
        state.keys.remove(position);
        state.health.remove(key);
        Ok(())
    }

    /// Whether at least one key is healthy and currently available.
    pub async fn is_healthy(&self) -> bool {
        let state = self.state.read().await;
        state.keys.iter().any(|k| {
            state
                .health
                .get(k)
                .is_none_or(|h| h.is_healthy && h.is_available())
        })
    }

    /// Structured snapshot of per-key health and pool totals.
    pub async fn status(&self) -> PoolStatus {
        let state = self.state.read().await;
        let now = Instant::now();
        let mut keys = Vec::with_capacity(state.keys.len());
        let mut healthy_keys = 0;

        for key in &state.keys {
            let Some(health) = state.health.get(key) else {
                continue;
            };
            if health.is_healthy {
                healthy_keys += 1;
            }
            let backoff_remaining_ms = health
                .backoff_until
                .filter(|until| *until > now)
                .map(|until| until.duration_since(now).as_millis() as u64);
            keys.push(KeyStatus {
                key: self.mask(key),
                healthy: health.is_healthy,
                available: health.is_available(),
                success_count: health.success_count,
                failure_count: health.failure_count,
                request_count: health.request_count,
                error_rate: health.error_rate(),
                backoff_remaining_ms,
                breaker: health.breaker.observe(),
            });
        }

        let unhealthy_keys = state.keys.len() - healthy_keys;
        let is_healthy = state.keys.iter().any(|k| {
            state
                .health
                .get(k)
                .is_none_or(|h| h.is_healthy && h.is_available())
        });

        PoolStatus {
            provider: self.provider.clone(),
            strategy: self.config.strategy,
            keys,
            healthy_keys,
            unhealthy_keys,
            is_healthy,
        }
    }

    /// The keys in insertion order (unmasked; for pool management only).
    pub async fn keys(&self) -> Vec<String> {
        self.state.read().await.keys.clone()
    }

    fn mask(&self, key: &str) -> String {
        if !self.masking.enabled {
            return key.to_string();
        }
        mask_token(
            key,
            self.masking.prefix_length,
            self.masking.suffix_length,
            self.masking.mask_char,
        )
    }
}
