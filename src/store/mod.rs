//! Token persistence.
//!
//! [`OAuthToken`] is the unit of storage: the access/refresh token pair plus
//! the endpoint configuration it was minted against. Two backends implement
//! the [`TokenStore`] contract: a file-per-token store with optional AEAD
//! encryption and backups ([`file::FileTokenStore`]) and a capacity-capped
//! in-memory store ([`memory::MemoryTokenStore`]).

pub mod file;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{AuthError, Result};

pub use file::FileTokenStore;
pub use memory::MemoryTokenStore;

/// Default lifetime assigned when a stored token has an access token but no
/// recorded expiration.
pub(crate) const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

fn serialize_secret<S: Serializer>(secret: &SecretString, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(secret.expose_secret())
}

fn serialize_opt_secret<S: Serializer>(
    secret: &Option<SecretString>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match secret {
        Some(secret) => s.serialize_some(secret.expose_secret()),
        None => s.serialize_none(),
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// An OAuth 2.0 token set plus the client configuration it belongs to.
///
/// Secret material is wrapped in [`SecretString`] so it zeroes on drop and
/// renders redacted in `Debug` output. Serialization exposes the secrets;
/// it only ever happens on the way into a store, where the payload is
/// encrypted or written at restrictive file modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    #[serde(serialize_with = "serialize_secret")]
    pub access_token: SecretString,
    #[serde(default, serialize_with = "serialize_opt_secret")]
    pub refresh_token: Option<SecretString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub auth_url: String,
    #[serde(default)]
    pub token_url: String,
    #[serde(default)]
    pub redirect_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default, serialize_with = "serialize_opt_secret")]
    pub client_secret: Option<SecretString>,
}

impl OAuthToken {
    /// Create a token carrying only an access token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
            token_type: default_token_type(),
            auth_url: String::new(),
            token_url: String::new(),
            redirect_url: String::new(),
            client_id: String::new(),
            client_secret: None,
        }
    }

    /// Whether the access token is within `buffer` of its expiration (or
    /// past it). Tokens without a recorded expiration never expire.
    pub fn is_expired(&self, buffer: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::zero());
                Utc::now() > expires_at - buffer
            }
            None => false,
        }
    }

    /// Whether the access token field is non-empty.
    pub fn has_access_token(&self) -> bool {
        !self.access_token.expose_secret().is_empty()
    }

    /// Whether a refresh token is present.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

/// Metadata about a stored token. Derived from store state; the token body
/// stays authoritative for expiration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_encrypted: bool,
}

impl std::fmt::Debug for dyn TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn TokenStore").finish()
    }
}

/// Persistent token storage contract shared by all backends.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Store a token under `key`, overwriting any existing entry.
    ///
    /// A token with a non-empty access token and no recorded expiration is
    /// assigned a default one-hour lifetime before being written.
    async fn store(&self, key: &str, token: &OAuthToken) -> Result<()>;

    /// Retrieve the token stored under `key`.
    ///
    /// An expired token is deleted on the way out and the call fails with
    /// `token_expired`.
    async fn retrieve(&self, key: &str) -> Result<OAuthToken>;

    /// Delete the token stored under `key`. Idempotent: deleting a missing
    /// key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys currently present, in unspecified order.
    async fn list(&self) -> Result<Vec<String>>;

    /// Whether `key` holds a retrievable token with a non-empty access token.
    async fn is_valid(&self, key: &str) -> bool {
        match self.retrieve(key).await {
            Ok(token) => token.has_access_token(),
            Err(_) => false,
        }
    }

    /// Delete every token that is no longer valid. Returns how many entries
    /// were removed.
    async fn cleanup_expired(&self) -> Result<usize>;

    /// Metadata for the token stored under `key`.
    async fn info(&self, key: &str) -> Result<TokenMetadata>;

    /// Release background resources. Further calls may fail.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// The error used for missing keys across store backends.
pub(crate) fn token_not_found(key: &str) -> AuthError {
    AuthError::storage(format!("no token stored under key '{key}'"))
}

/// Apply the default TTL rule before a token is written.
pub(crate) fn with_default_expiry(token: &OAuthToken) -> OAuthToken {
    let mut token = token.clone();
    if token.has_access_token() && token.expires_at.is_none() {
        token.expires_at = Some(
            Utc::now()
                + chrono::Duration::from_std(DEFAULT_TOKEN_TTL)
                    .unwrap_or(chrono::Duration::zero()),
        );
    }
    token
}

/// Replace characters that are unsafe in filenames.
pub(crate) fn sanitize_stem(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}

/// Sanitized filename for a key: `<sanitized>.token`.
pub(crate) fn sanitize_key(key: &str) -> String {
    format!("{}.token", sanitize_stem(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_defaults() {
        let token = OAuthToken::new("abc");
        assert!(token.has_access_token());
        assert!(!token.can_refresh());
        assert_eq!(token.token_type, "Bearer");
        assert!(token.expires_at.is_none());
    }

    #[test]
    fn test_expiry_with_buffer() {
        let mut token = OAuthToken::new("abc");
        token.expires_at = Some(Utc::now() + chrono::Duration::minutes(10));
        assert!(!token.is_expired(Duration::from_secs(300)));
        // A 15-minute buffer reaches past the 10-minute expiry.
        assert!(token.is_expired(Duration::from_secs(900)));
    }

    #[test]
    fn test_no_expiry_never_expires() {
        let token = OAuthToken::new("abc");
        assert!(!token.is_expired(Duration::from_secs(300)));
    }

    #[test]
    fn test_serde_round_trip_preserves_secrets() {
        let mut token = OAuthToken::new("access-value");
        token.refresh_token = Some(SecretString::from("refresh-value".to_string()));
        token.scopes = vec!["read".to_string(), "write".to_string()];

        let json = serde_json::to_string(&token).unwrap();
        assert!(json.contains("access-value"));

        let back: OAuthToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back.access_token.expose_secret(), "access-value");
        assert_eq!(
            back.refresh_token.as_ref().unwrap().expose_secret(),
            "refresh-value"
        );
        assert_eq!(back.scopes, token.scopes);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let token = OAuthToken::new("super-secret-access");
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret-access"));
    }

    #[test]
    fn test_default_expiry_applied_only_when_unset() {
        let token = with_default_expiry(&OAuthToken::new("abc"));
        assert!(token.expires_at.is_some());

        let mut explicit = OAuthToken::new("abc");
        let stamp = Utc::now() + chrono::Duration::days(2);
        explicit.expires_at = Some(stamp);
        let kept = with_default_expiry(&explicit);
        assert_eq!(kept.expires_at, Some(stamp));

        // No access token means no implied lifetime.
        let empty = with_default_expiry(&OAuthToken::new(""));
        assert!(empty.expires_at.is_none());
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("openai"), "openai.token");
        assert_eq!(sanitize_key("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j.token");
        let sanitized = sanitize_key("weird:*key");
        for forbidden in ['/', '\\', ':', '*', '?', '"', '<', '>', '|'] {
            assert!(!sanitized.contains(forbidden));
        }
    }
}
