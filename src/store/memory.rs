//! In-memory token store.
//!
//! Capacity-capped map with its own cleanup ticker. Optionally snapshots
//! the entire token map to a JSON file on every mutation so a restart can
//! pick up where it left off.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::config::MemoryStorageConfig;
use crate::error::{AuthError, Result};
use crate::store::{OAuthToken, TokenMetadata, TokenStore, token_not_found, with_default_expiry};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    token: OAuthToken,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

/// Token store backed by a capacity-capped in-memory map.
pub struct MemoryTokenStore {
    tokens: Arc<RwLock<HashMap<String, StoredEntry>>>,
    config: MemoryStorageConfig,
    shutdown: Arc<Notify>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTokenStore {
    /// Create a store and start its cleanup ticker.
    ///
    /// When persistence is enabled and a snapshot file exists, the map is
    /// seeded from it.
    pub fn new(config: MemoryStorageConfig) -> Self {
        let initial = if config.enable_persistence {
            config
                .persistence_file
                .as_deref()
                .and_then(load_snapshot)
                .unwrap_or_default()
        } else {
            HashMap::new()
        };

        let tokens = Arc::new(RwLock::new(initial));
        let shutdown = Arc::new(Notify::new());

        let task = {
            let tokens = Arc::clone(&tokens);
            let shutdown = Arc::clone(&shutdown);
            let interval = config.cleanup_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick completes immediately; skip it.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let now = Utc::now();
                            let mut map = tokens.write().await;
                            let before = map.len();
                            map.retain(|_, entry| {
                                entry.token.expires_at.is_none_or(|at| now <= at)
                                    && entry.token.has_access_token()
                            });
                            let removed = before - map.len();
                            drop(map);
                            if removed > 0 {
                                tracing::debug!(removed, "Memory store cleanup tick");
                            }
                        }
                        _ = shutdown.notified() => break,
                    }
                }
            })
        };

        Self {
            tokens,
            config,
            shutdown,
            cleanup_task: Mutex::new(Some(task)),
        }
    }

    /// Snapshot the whole map to the persistence file, if configured.
    /// Failures are warn-logged; the in-memory state stays authoritative.
    async fn persist(&self, map: &HashMap<String, StoredEntry>) {
        if !self.config.enable_persistence {
            return;
        }
        let Some(path) = &self.config.persistence_file else {
            return;
        };
        if let Err(err) = write_snapshot(path, map) {
            tracing::warn!(path = %path.display(), error = %err, "Token snapshot write failed");
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn store(&self, key: &str, token: &OAuthToken) -> Result<()> {
        let token = with_default_expiry(token);
        let mut map = self.tokens.write().await;
        if !map.contains_key(key) && map.len() >= self.config.max_tokens {
            return Err(AuthError::storage(format!(
                "memory store is full ({} tokens)",
                self.config.max_tokens
            )));
        }
        let now = Utc::now();
        let created_at = map.get(key).map(|e| e.created_at).unwrap_or(now);
        map.insert(
            key.to_string(),
            StoredEntry {
                token,
                created_at,
                last_accessed: now,
            },
        );
        self.persist(&map).await;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<OAuthToken> {
        let (token, expired) = {
            let mut map = self.tokens.write().await;
            let entry = map.get_mut(key).ok_or_else(|| token_not_found(key))?;
            entry.last_accessed = Utc::now();
            let expired = entry
                .token
                .expires_at
                .is_some_and(|at| Utc::now() > at);
            (entry.token.clone(), expired)
        };
        // Acquisition dropped before the expiry delete retakes the lock.

        if expired {
            let mut map = self.tokens.write().await;
            map.remove(key);
            self.persist(&map).await;
            return Err(AuthError::TokenExpired {
                provider: key.to_string(),
            });
        }
        Ok(token)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.tokens.write().await;
        map.remove(key);
        self.persist(&map).await;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.tokens.read().await.keys().cloned().collect())
    }

    async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut map = self.tokens.write().await;
        let before = map.len();
        map.retain(|_, entry| {
            entry.token.expires_at.is_none_or(|at| now <= at) && entry.token.has_access_token()
        });
        let removed = before - map.len();
        if removed > 0 {
            self.persist(&map).await;
        }
        Ok(removed)
    }

    async fn info(&self, key: &str) -> Result<TokenMetadata> {
        let map = self.tokens.read().await;
        let entry = map.get(key).ok_or_else(|| token_not_found(key))?;
        Ok(TokenMetadata {
            provider: key.to_string(),
            created_at: entry.created_at,
            last_accessed: entry.last_accessed,
            expires_at: entry.token.expires_at,
            is_encrypted: false,
        })
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.notify_waiters();
        if let Some(task) = self.cleanup_task.lock().await.take() {
            // Wait out any in-flight cleanup tick.
            let _ = task.await;
        }
        let map = self.tokens.read().await;
        self.persist(&map).await;
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Option<HashMap<String, StoredEntry>> {
    let payload = std::fs::read(path).ok()?;
    match serde_json::from_slice(&payload) {
        Ok(map) => Some(map),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Ignoring corrupt token snapshot");
            None
        }
    }
}

fn write_snapshot(path: &Path, map: &HashMap<String, StoredEntry>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_vec(map)?;
    std::fs::write(path, payload)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    fn small_config() -> MemoryStorageConfig {
        MemoryStorageConfig {
            max_tokens: 2,
            cleanup_interval: Duration::from_secs(3600),
            enable_persistence: false,
            persistence_file: None,
        }
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let store = MemoryTokenStore::new(MemoryStorageConfig::default());
        store.store("p", &OAuthToken::new("v")).await.unwrap();
        let token = store.retrieve("p").await.unwrap();
        assert_eq!(token.access_token.expose_secret(), "v");
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_fail_on_full() {
        let store = MemoryTokenStore::new(small_config());
        store.store("a", &OAuthToken::new("1")).await.unwrap();
        store.store("b", &OAuthToken::new("2")).await.unwrap();

        let err = store.store("c", &OAuthToken::new("3")).await.unwrap_err();
        assert_eq!(err.code(), "storage_error");

        // Overwriting an existing key is not a capacity violation.
        store.store("a", &OAuthToken::new("1b")).await.unwrap();
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_token_purged_on_retrieve() {
        let store = MemoryTokenStore::new(MemoryStorageConfig::default());
        let mut token = OAuthToken::new("x");
        token.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.store("p", &token).await.unwrap();

        let err = store.retrieve("p").await.unwrap_err();
        assert_eq!(err.code(), "token_expired");
        assert!(store.list().await.unwrap().is_empty());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let store = MemoryTokenStore::new(MemoryStorageConfig::default());
        store.store("p", &OAuthToken::new("x")).await.unwrap();
        store.delete("p").await.unwrap();
        store.delete("p").await.unwrap();
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_expired_counts() {
        let store = MemoryTokenStore::new(MemoryStorageConfig::default());
        let mut stale = OAuthToken::new("x");
        stale.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));
        store.store("stale", &stale).await.unwrap();
        store.store("fresh", &OAuthToken::new("y")).await.unwrap();

        let removed = store.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list().await.unwrap(), vec!["fresh".to_string()]);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_info_tracks_access() {
        let store = MemoryTokenStore::new(MemoryStorageConfig::default());
        store.store("p", &OAuthToken::new("x")).await.unwrap();

        let before = store.info("p").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.retrieve("p").await.unwrap();
        let after = store.info("p").await.unwrap();
        assert!(after.last_accessed > before.last_accessed);
        assert_eq!(after.created_at, before.created_at);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_persistence_survives_restart() {
        let dir = TempDir::new().unwrap();
        let snapshot = dir.path().join("tokens.json");
        let config = MemoryStorageConfig {
            enable_persistence: true,
            persistence_file: Some(snapshot.clone()),
            ..MemoryStorageConfig::default()
        };

        let store = MemoryTokenStore::new(config.clone());
        store.store("p", &OAuthToken::new("persisted")).await.unwrap();
        store.close().await.unwrap();
        assert!(snapshot.exists());

        let reopened = MemoryTokenStore::new(config);
        let token = reopened.retrieve("p").await.unwrap();
        assert_eq!(token.access_token.expose_secret(), "persisted");
        reopened.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_snapshot_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let snapshot = dir.path().join("tokens.json");
        let config = MemoryStorageConfig {
            enable_persistence: true,
            persistence_file: Some(snapshot.clone()),
            ..MemoryStorageConfig::default()
        };
        let store = MemoryTokenStore::new(config);
        store.store("p", &OAuthToken::new("x")).await.unwrap();

        let mode = std::fs::metadata(&snapshot).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        store.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_ticker_runs() {
        let config = MemoryStorageConfig {
            cleanup_interval: Duration::from_millis(50),
            ..MemoryStorageConfig::default()
        };
        let store = MemoryTokenStore::new(config);
        let mut stale = OAuthToken::new("x");
        stale.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.store("stale", &stale).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.list().await.unwrap().is_empty());
        store.close().await.unwrap();
    }
}
