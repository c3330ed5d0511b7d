//! Credential and session management for clients of remote AI inference
//! services.
//!
//! The crate acquires, validates, refreshes, rotates, persists, and hands
//! out authentication material across many independent upstream providers,
//! and keeps routing traffic through healthy credentials in the face of
//! rate limits, expirations, revocations, and network faults.
//!
//! The pieces:
//! - [`manager::AuthManager`]: registry of per-provider authenticators,
//!   orchestration, and the background expiration sweeper.
//! - [`authenticator::Authenticator`]: the uniform per-provider contract,
//!   with API key, bearer token, and OAuth implementations.
//! - [`keys::KeyManager`]: multi-key pools with health tracking, backoff,
//!   circuit breaking, and failover execution.
//! - [`oauth::OAuthAuthenticator`]: authorization-code + PKCE flow and
//!   refresh-token rotation.
//! - [`store`]: encrypted file-backed and in-memory token stores.
//! - [`security`]: AEAD encryption, key derivation, masking, redaction.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use authkit::authenticator::Authenticator;
//! use authkit::catalog::AuthInput;
//! use authkit::config::AuthConfig;
//! use authkit::manager::AuthManager;
//! use authkit::store::MemoryTokenStore;
//!
//! # async fn example() -> authkit::error::Result<()> {
//! let config = AuthConfig::from_env();
//! let store = Arc::new(MemoryTokenStore::new(config.token_storage.memory.clone()));
//! let manager = AuthManager::new(config, store);
//!
//! manager
//!     .register_from_catalog(
//!         "openai",
//!         AuthInput::ApiKeys(vec!["sk-one".into(), "sk-two".into()]),
//!     )
//!     .await?;
//!
//! let auth = manager.get("openai").await?;
//! let credential = auth.token().await?;
//! # let _ = credential;
//! # Ok(())
//! # }
//! ```

pub mod authenticator;
pub mod catalog;
pub mod config;
pub mod error;
pub mod keys;
pub mod manager;
pub mod oauth;
pub mod security;
pub mod store;

pub use authenticator::{ApiKeyAuthenticator, AuthMethod, Authenticator, BearerAuthenticator};
pub use catalog::AuthInput;
pub use config::AuthConfig;
pub use error::{AuthError, Result};
pub use keys::KeyManager;
pub use manager::{AuthManager, AuthState};
pub use oauth::{OAuthAuthenticator, OAuthConfig};
pub use store::{FileTokenStore, MemoryTokenStore, OAuthToken, TokenStore};
