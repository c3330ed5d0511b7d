//! The uniform authenticator contract and its built-in variants.
//!
//! Every provider registered on the manager speaks [`Authenticator`]:
//! produce a credential on demand, report whether a session exists, refresh
//! and tear it down. API key and bearer variants are thin wrappers over
//! credential state; the OAuth variant delegates to
//! [`OAuthAuthenticator`]. OAuth-only operations are reached by narrowing
//! through [`as_oauth`](Authenticator::as_oauth) instead of runtime type
//! checks.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{AuthError, Result};
use crate::keys::KeyManager;
use crate::oauth::OAuthAuthenticator;

/// How an authenticator proves identity to its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// One or more API keys selected per request.
    ApiKey,
    /// A single static bearer token.
    BearerToken,
    /// OAuth 2.0 access/refresh token pair.
    OAuth,
    /// A caller-provided implementation.
    Custom,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey => write!(f, "api_key"),
            Self::BearerToken => write!(f, "bearer_token"),
            Self::OAuth => write!(f, "oauth"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

impl std::fmt::Debug for dyn Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Authenticator").finish()
    }
}

/// A component that produces a credential for one provider on demand.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Establish (or verify) a session with the provider.
    async fn authenticate(&self) -> Result<()>;

    /// Whether a usable credential is currently held.
    async fn is_authenticated(&self) -> bool;

    /// The credential to attach to the next request.
    async fn token(&self) -> Result<SecretString>;

    /// Refresh the credential if the method supports it. A no-op for
    /// static credentials.
    async fn refresh(&self) -> Result<()>;

    /// Tear down the session and forget credentials.
    async fn logout(&self) -> Result<()>;

    fn method(&self) -> AuthMethod;

    fn provider(&self) -> &str;

    /// Narrow to the OAuth implementation when this authenticator is
    /// OAuth-capable. Non-OAuth variants return `None`, which is how the
    /// manager rejects flow operations on them.
    fn as_oauth(&self) -> Option<&OAuthAuthenticator> {
        None
    }
}

/// Authenticator backed by a multi-key pool.
pub struct ApiKeyAuthenticator {
    manager: Arc<KeyManager>,
}

impl ApiKeyAuthenticator {
    pub fn new(manager: Arc<KeyManager>) -> Self {
        Self { manager }
    }

    /// The underlying pool, for failover execution and health reporting.
    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.manager
    }

    /// Advance to the next key by the configured strategy.
    pub async fn rotate_key(&self) -> Result<String> {
        self.manager.next().await.map_err(|err| match err {
            AuthError::AllKeysExhausted { provider, .. } => AuthError::KeyRotationFailed {
                provider,
                reason: "no available key to rotate to".to_string(),
            },
            other => other,
        })
    }

    pub async fn report_success(&self, key: &str) {
        self.manager.report_success(key).await;
    }

    pub async fn report_failure(&self, key: &str, err: &AuthError) {
        self.manager.report_failure(key, err).await;
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self) -> Result<()> {
        if self.manager.is_empty().await {
            return Err(AuthError::InvalidCredentials {
                provider: self.manager.provider().to_string(),
                reason: "no API keys configured".to_string(),
            });
        }
        Ok(())
    }

    async fn is_authenticated(&self) -> bool {
        !self.manager.is_empty().await
    }

    async fn token(&self) -> Result<SecretString> {
        self.manager.current().await.map(SecretString::from)
    }

    async fn refresh(&self) -> Result<()> {
        // Static credentials; nothing to refresh.
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        Ok(())
    }

    fn method(&self) -> AuthMethod {
        AuthMethod::ApiKey
    }

    fn provider(&self) -> &str {
        self.manager.provider()
    }
}

/// Authenticator wrapping a single static bearer token.
pub struct BearerAuthenticator {
    provider: String,
    token: RwLock<Option<SecretString>>,
}

impl BearerAuthenticator {
    pub fn new(provider: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            token: RwLock::new(Some(SecretString::from(token.into()))),
        }
    }
}

#[async_trait]
impl Authenticator for BearerAuthenticator {
    async fn authenticate(&self) -> Result<()> {
        if self.token.read().await.is_some() {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials {
                provider: self.provider.clone(),
                reason: "bearer token has been cleared".to_string(),
            })
        }
    }

    async fn is_authenticated(&self) -> bool {
        self.token.read().await.is_some()
    }

    async fn token(&self) -> Result<SecretString> {
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| AuthError::InvalidCredentials {
                provider: self.provider.clone(),
                reason: "bearer token has been cleared".to_string(),
            })
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        *self.token.write().await = None;
        Ok(())
    }

    fn method(&self) -> AuthMethod {
        AuthMethod::BearerToken
    }

    fn provider(&self) -> &str {
        &self.provider
    }
}

#[async_trait]
impl Authenticator for OAuthAuthenticator {
    async fn authenticate(&self) -> Result<()> {
        OAuthAuthenticator::authenticate(self).await
    }

    async fn is_authenticated(&self) -> bool {
        OAuthAuthenticator::is_authenticated(self).await
    }

    async fn token(&self) -> Result<SecretString> {
        self.access_token().await
    }

    async fn refresh(&self) -> Result<()> {
        self.refresh_token().await
    }

    async fn logout(&self) -> Result<()> {
        OAuthAuthenticator::logout(self).await
    }

    fn method(&self) -> AuthMethod {
        AuthMethod::OAuth
    }

    fn provider(&self) -> &str {
        OAuthAuthenticator::provider(self)
    }

    fn as_oauth(&self) -> Option<&OAuthAuthenticator> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use secrecy::ExposeSecret;

    use crate::config::{ApiKeyPoolConfig, TokenMaskingConfig};

    fn api_key_auth(keys: &[&str]) -> ApiKeyAuthenticator {
        let manager = KeyManager::new(
            "openai",
            keys.iter().map(|k| k.to_string()).collect(),
            ApiKeyPoolConfig::default(),
            TokenMaskingConfig::default(),
        )
        .unwrap();
        ApiKeyAuthenticator::new(Arc::new(manager))
    }

    #[tokio::test]
    async fn test_api_key_token_and_rotation() {
        let auth = api_key_auth(&["k1", "k2"]);
        auth.authenticate().await.unwrap();
        assert!(auth.is_authenticated().await);
        assert_eq!(auth.token().await.unwrap().expose_secret(), "k1");

        let rotated = auth.rotate_key().await.unwrap();
        assert!(rotated == "k1" || rotated == "k2");
    }

    #[tokio::test]
    async fn test_api_key_empty_pool_rejected() {
        let auth = api_key_auth(&["k1"]);
        auth.key_manager().remove_key("k1").await.unwrap();
        assert!(!auth.is_authenticated().await);
        let err = auth.authenticate().await.unwrap_err();
        assert_eq!(err.code(), "invalid_credentials");
    }

    #[tokio::test]
    async fn test_api_key_rotation_failure_maps_code() {
        let auth = api_key_auth(&["k1"]);
        let err = AuthError::Network {
            reason: "down".to_string(),
            retryable: true,
        };
        auth.report_failure("k1", &err).await;
        let err = auth.rotate_key().await.unwrap_err();
        assert_eq!(err.code(), "key_rotation_failed");
    }

    #[tokio::test]
    async fn test_api_key_method() {
        let auth = api_key_auth(&["k1"]);
        assert_eq!(auth.method(), AuthMethod::ApiKey);
        assert!(auth.as_oauth().is_none());
    }

    #[tokio::test]
    async fn test_bearer_lifecycle() {
        let auth = BearerAuthenticator::new("anthropic", "tok-123");
        auth.authenticate().await.unwrap();
        assert!(auth.is_authenticated().await);
        assert_eq!(auth.token().await.unwrap().expose_secret(), "tok-123");
        assert_eq!(auth.method(), AuthMethod::BearerToken);

        auth.logout().await.unwrap();
        assert!(!auth.is_authenticated().await);
        assert_eq!(auth.token().await.unwrap_err().code(), "invalid_credentials");
        assert_eq!(auth.authenticate().await.unwrap_err().code(), "invalid_credentials");
    }

    #[test]
    fn test_method_display() {
        assert_eq!(AuthMethod::ApiKey.to_string(), "api_key");
        assert_eq!(AuthMethod::BearerToken.to_string(), "bearer_token");
        assert_eq!(AuthMethod::OAuth.to_string(), "oauth");
        assert_eq!(AuthMethod::Custom.to_string(), "custom");
    }
}
