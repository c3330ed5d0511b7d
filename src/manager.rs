//! Orchestration across per-provider authenticators.
//!
//! The [`AuthManager`] owns the registry mapping provider names to
//! authenticators plus the shared token store, and runs the background
//! expiration sweeper. Registry reads snapshot under the lock and release
//! it before any network or file I/O.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::authenticator::{AuthMethod, Authenticator};
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::oauth::TokenInfo;
use crate::store::TokenStore;

/// Minimum sweeper interval; backup config cannot schedule tighter.
const MIN_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Per-provider authentication status.
#[derive(Debug, Clone, Serialize)]
pub struct AuthState {
    pub provider: String,
    pub authenticated: bool,
    pub method: AuthMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_auth: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub can_refresh: bool,
}

struct Sweeper {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Registry of per-provider authenticators with a shared token store.
pub struct AuthManager {
    config: AuthConfig,
    store: Arc<dyn TokenStore>,
    registry: RwLock<HashMap<String, Arc<dyn Authenticator>>>,
    last_auth: RwLock<HashMap<String, DateTime<Utc>>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl AuthManager {
    /// Create a manager over `store`. When backups are enabled, a sweeper
    /// task starts purging expired tokens on the configured interval.
    pub fn new(config: AuthConfig, store: Arc<dyn TokenStore>) -> Self {
        let sweeper = if config.token_storage.file.backup.enabled {
            Some(Self::spawn_sweeper(
                Arc::clone(&store),
                config.token_storage.file.backup.interval.max(MIN_SWEEP_INTERVAL),
            ))
        } else {
            None
        };

        Self {
            config,
            store,
            registry: RwLock::new(HashMap::new()),
            last_auth: RwLock::new(HashMap::new()),
            sweeper: Mutex::new(sweeper),
        }
    }

    fn spawn_sweeper(store: Arc<dyn TokenStore>, interval: std::time::Duration) -> Sweeper {
        let shutdown = Arc::new(Notify::new());
        let task = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match store.cleanup_expired().await {
                                Ok(removed) if removed > 0 => {
                                    tracing::info!(removed, "Expiration sweep removed tokens");
                                }
                                Ok(_) => {}
                                Err(err) => {
                                    tracing::warn!(error = %err, "Expiration sweep failed");
                                }
                            }
                        }
                        _ = shutdown.notified() => break,
                    }
                }
            })
        };
        Sweeper { shutdown, task }
    }

    /// The shared token store.
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Register an authenticator for `provider`. An existing registration
    /// is silently replaced.
    pub async fn register(&self, provider: &str, auth: Arc<dyn Authenticator>) -> Result<()> {
        if provider.is_empty() {
            return Err(AuthError::invalid_config("provider name must not be empty"));
        }
        let replaced = {
            let mut registry = self.registry.write().await;
            registry.insert(provider.to_string(), auth).is_some()
        };
        tracing::info!(provider, replaced, "Authenticator registered");
        Ok(())
    }

    /// Validate `input` against the provider catalog, build the
    /// authenticator, and register it in one step.
    pub async fn register_from_catalog(
        &self,
        provider: &str,
        input: crate::catalog::AuthInput,
    ) -> Result<Arc<dyn Authenticator>> {
        crate::catalog::validate_input(provider, &input)?;
        let auth = crate::catalog::build_authenticator(
            provider,
            input,
            &self.config,
            Arc::clone(&self.store),
        )?;
        self.register(provider, Arc::clone(&auth)).await?;
        Ok(auth)
    }

    /// The authenticator registered for `provider`.
    pub async fn get(&self, provider: &str) -> Result<Arc<dyn Authenticator>> {
        self.registry
            .read()
            .await
            .get(provider)
            .cloned()
            .ok_or_else(|| AuthError::ProviderUnavailable {
                provider: provider.to_string(),
            })
    }

    /// Authenticate against `provider`, recording the outcome.
    pub async fn authenticate(&self, provider: &str) -> Result<()> {
        let auth = self.get(provider).await?;
        match auth.authenticate().await {
            Ok(()) => {
                self.last_auth
                    .write()
                    .await
                    .insert(provider.to_string(), Utc::now());
                tracing::info!(provider, "Authentication succeeded");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(provider, error = %err, "Authentication failed");
                Err(err)
            }
        }
    }

    /// Whether `provider` currently holds a usable credential. Unregistered
    /// providers are simply not authenticated.
    pub async fn is_authenticated(&self, provider: &str) -> bool {
        match self.get(provider).await {
            Ok(auth) => auth.is_authenticated().await,
            Err(_) => false,
        }
    }

    /// Log out of `provider`. Errors surface to the caller.
    pub async fn logout(&self, provider: &str) -> Result<()> {
        let auth = self.get(provider).await?;
        auth.logout().await?;
        self.last_auth.write().await.remove(provider);
        tracing::info!(provider, "Logged out");
        Ok(())
    }

    /// Refresh every currently-authenticated provider. Individual failures
    /// are collected; the aggregate surfaces after every provider has been
    /// tried. The registry lock is not held across refresh I/O.
    pub async fn refresh_all(&self) -> Result<()> {
        let snapshot: Vec<(String, Arc<dyn Authenticator>)> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .map(|(name, auth)| (name.clone(), Arc::clone(auth)))
                .collect()
        };

        let mut failures: Vec<(String, AuthError)> = Vec::new();
        for (provider, auth) in snapshot {
            if !auth.is_authenticated().await {
                continue;
            }
            if let Err(err) = auth.refresh().await {
                tracing::warn!(provider = %provider, error = %err, "Token refresh failed");
                failures.push((provider, err));
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        let retryable = failures.iter().any(|(_, e)| e.is_retryable());
        let providers: Vec<&str> = failures.iter().map(|(p, _)| p.as_str()).collect();
        let reasons: Vec<String> = failures
            .iter()
            .map(|(p, e)| format!("{p}: {e}"))
            .collect();
        Err(AuthError::RefreshFailed {
            provider: providers.join(","),
            reason: reasons.join("; "),
            retryable,
        })
    }

    /// Names of providers that currently hold a usable credential.
    pub async fn authenticated(&self) -> Vec<String> {
        let snapshot: Vec<(String, Arc<dyn Authenticator>)> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .map(|(name, auth)| (name.clone(), Arc::clone(auth)))
                .collect()
        };
        let mut names = Vec::new();
        for (provider, auth) in snapshot {
            if auth.is_authenticated().await {
                names.push(provider);
            }
        }
        names
    }

    /// Per-provider status. OAuth providers report expiry and refresh
    /// capability from their token info.
    pub async fn status(&self) -> HashMap<String, AuthState> {
        let snapshot: Vec<(String, Arc<dyn Authenticator>)> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .map(|(name, auth)| (name.clone(), Arc::clone(auth)))
                .collect()
        };
        let last_auth = self.last_auth.read().await.clone();

        let mut status = HashMap::with_capacity(snapshot.len());
        for (provider, auth) in snapshot {
            let (expires_at, can_refresh) = match auth.as_oauth() {
                Some(oauth) => match oauth.token_info().await {
                    Ok(TokenInfo {
                        expires_at,
                        can_refresh,
                        ..
                    }) => (expires_at, can_refresh),
                    Err(_) => (None, false),
                },
                None => (None, false),
            };
            status.insert(
                provider.clone(),
                AuthState {
                    provider: provider.clone(),
                    authenticated: auth.is_authenticated().await,
                    method: auth.method(),
                    last_auth: last_auth.get(&provider).copied(),
                    expires_at,
                    can_refresh,
                },
            );
        }
        status
    }

    /// Purge invalid tokens from the store. The first delete error is
    /// remembered and returned after the full pass.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let keys = self.store.list().await?;
        let mut removed = 0;
        let mut first_error: Option<AuthError> = None;
        for key in keys {
            if self.store.is_valid(&key).await {
                continue;
            }
            match self.store.delete(&key).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!(key, error = %err, "Failed to delete expired token");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }

    /// Run `f` for each authenticated provider. The first error aborts the
    /// iteration and is returned with provider context attached.
    pub async fn for_each_authenticated<F, Fut>(&self, f: F) -> Result<()>
    where
        F: Fn(String, Arc<dyn Authenticator>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let snapshot: Vec<(String, Arc<dyn Authenticator>)> = {
            let registry = self.registry.read().await;
            registry
                .iter()
                .map(|(name, auth)| (name.clone(), Arc::clone(auth)))
                .collect()
        };

        for (provider, auth) in snapshot {
            if !auth.is_authenticated().await {
                continue;
            }
            if let Err(err) = f(provider.clone(), auth).await {
                return Err(with_provider_context(&provider, err));
            }
        }
        Ok(())
    }

    /// Token metadata for an OAuth-capable provider.
    pub async fn token_info(&self, provider: &str) -> Result<TokenInfo> {
        let auth = self.get(provider).await?;
        let oauth = auth
            .as_oauth()
            .ok_or_else(|| not_oauth_capable(provider))?;
        oauth.token_info().await
    }

    /// Begin an OAuth authorization flow for `provider`.
    pub async fn start_oauth_flow(&self, provider: &str, scopes: &[String]) -> Result<String> {
        let auth = self.get(provider).await?;
        let oauth = auth
            .as_oauth()
            .ok_or_else(|| not_oauth_capable(provider))?;
        oauth.start_auth_flow(scopes).await
    }

    /// Complete an OAuth flow with the callback code and state.
    pub async fn handle_oauth_callback(
        &self,
        provider: &str,
        code: &str,
        state: &str,
    ) -> Result<()> {
        let auth = self.get(provider).await?;
        let oauth = auth
            .as_oauth()
            .ok_or_else(|| not_oauth_capable(provider))?;
        oauth.handle_callback(code, state).await?;
        self.last_auth
            .write()
            .await
            .insert(provider.to_string(), Utc::now());
        Ok(())
    }

    /// Remove `provider` from the registry, logging out best-effort first.
    pub async fn remove(&self, provider: &str) -> Result<()> {
        let auth = {
            let mut registry = self.registry.write().await;
            registry.remove(provider)
        };
        let Some(auth) = auth else {
            return Err(AuthError::ProviderUnavailable {
                provider: provider.to_string(),
            });
        };
        if let Err(err) = auth.logout().await {
            tracing::warn!(provider, error = %err, "Logout during removal failed");
        }
        self.last_auth.write().await.remove(provider);
        Ok(())
    }

    /// Shut down: stop the sweeper (waiting out an in-flight sweep), log
    /// out of every provider best-effort, and close the store.
    pub async fn close(&self) -> Result<()> {
        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.shutdown.notify_waiters();
            let _ = sweeper.task.await;
        }

        let snapshot: Vec<(String, Arc<dyn Authenticator>)> = {
            let mut registry = self.registry.write().await;
            registry.drain().collect()
        };
        for (provider, auth) in snapshot {
            if let Err(err) = auth.logout().await {
                tracing::warn!(provider = %provider, error = %err, "Logout during close failed");
            }
        }

        self.store.close().await
    }
}

fn not_oauth_capable(provider: &str) -> AuthError {
    AuthError::invalid_config(format!(
        "provider {provider} is not configured for OAuth"
    ))
}

/// Attach provider context to errors that do not already carry it.
fn with_provider_context(provider: &str, err: AuthError) -> AuthError {
    if err.provider().is_some() {
        return err;
    }
    match err {
        AuthError::Storage { reason } => AuthError::Storage {
            reason: format!("{provider}: {reason}"),
        },
        AuthError::Encryption { reason } => AuthError::Encryption {
            reason: format!("{provider}: {reason}"),
        },
        AuthError::Network { reason, retryable } => AuthError::Network {
            reason: format!("{provider}: {reason}"),
            retryable,
        },
        AuthError::InvalidConfig { reason } => AuthError::InvalidConfig {
            reason: format!("{provider}: {reason}"),
        },
        other => other,
    }
}
