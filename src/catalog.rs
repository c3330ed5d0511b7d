//! Authenticator construction and the provider capability catalog.
//!
//! [`AuthInput`] makes the factory's accepted credential shapes explicit:
//! callers say exactly which kind of material they are handing over, and
//! invalid combinations fail with `invalid_config` instead of being
//! guessed at. The static catalog records what each known provider
//! supports so embedders can validate a configuration up front.

use std::sync::{Arc, LazyLock};

use crate::authenticator::{
    ApiKeyAuthenticator, AuthMethod, Authenticator, BearerAuthenticator,
};
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::keys::KeyManager;
use crate::oauth::{OAuthAuthenticator, OAuthConfig};
use crate::store::TokenStore;

/// Credential material handed to the factory.
pub enum AuthInput {
    /// A single API key.
    ApiKey(String),
    /// A pool of API keys sharing health and selection policy.
    ApiKeys(Vec<String>),
    /// A static bearer token.
    Bearer(String),
    /// OAuth 2.0 client configuration.
    OAuth(OAuthConfig),
    /// A caller-provided implementation, registered unchanged.
    Custom(Arc<dyn Authenticator>),
}

impl AuthInput {
    /// The method this input produces.
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::ApiKey(_) | Self::ApiKeys(_) => AuthMethod::ApiKey,
            Self::Bearer(_) => AuthMethod::BearerToken,
            Self::OAuth(_) => AuthMethod::OAuth,
            Self::Custom(_) => AuthMethod::Custom,
        }
    }
}

/// Build an authenticator for `provider` from explicit credential input.
pub fn build_authenticator(
    provider: &str,
    input: AuthInput,
    config: &AuthConfig,
    store: Arc<dyn TokenStore>,
) -> Result<Arc<dyn Authenticator>> {
    if provider.is_empty() {
        return Err(AuthError::invalid_config("provider name must not be empty"));
    }

    match input {
        AuthInput::ApiKey(key) => {
            if key.is_empty() {
                return Err(AuthError::invalid_config("API key must not be empty"));
            }
            let manager = KeyManager::new(
                provider,
                vec![key],
                config.api_key.clone(),
                config.security.token_masking.clone(),
            )?;
            Ok(Arc::new(ApiKeyAuthenticator::new(Arc::new(manager))))
        }
        AuthInput::ApiKeys(keys) => {
            if keys.is_empty() {
                return Err(AuthError::invalid_config(
                    "API key pool must contain at least one key",
                ));
            }
            let manager = KeyManager::new(
                provider,
                keys,
                config.api_key.clone(),
                config.security.token_masking.clone(),
            )?;
            Ok(Arc::new(ApiKeyAuthenticator::new(Arc::new(manager))))
        }
        AuthInput::Bearer(token) => {
            if token.is_empty() {
                return Err(AuthError::invalid_config("bearer token must not be empty"));
            }
            Ok(Arc::new(BearerAuthenticator::new(provider, token)))
        }
        AuthInput::OAuth(oauth_config) => {
            let authenticator =
                OAuthAuthenticator::new(provider, oauth_config, config.oauth.clone(), store)?;
            Ok(Arc::new(authenticator))
        }
        AuthInput::Custom(authenticator) => Ok(authenticator),
    }
}

/// Feature flags for a cataloged provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderFeatures {
    pub supports_oauth: bool,
    pub supports_api_key: bool,
    pub supports_multi_key: bool,
    pub requires_pkce: bool,
    pub token_refresh: bool,
}

/// A known provider and its authentication capabilities.
#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub name: &'static str,
    pub method: AuthMethod,
    pub display_name: &'static str,
    pub description: &'static str,
    pub oauth_url: Option<&'static str>,
    pub required_scopes: &'static [&'static str],
    pub optional_scopes: &'static [&'static str],
    pub features: ProviderFeatures,
}

const API_KEY_ONLY: ProviderFeatures = ProviderFeatures {
    supports_oauth: false,
    supports_api_key: true,
    supports_multi_key: true,
    requires_pkce: false,
    token_refresh: false,
};

static CATALOG: LazyLock<Vec<ProviderEntry>> = LazyLock::new(|| {
    vec![
        ProviderEntry {
            name: "anthropic",
            method: AuthMethod::ApiKey,
            display_name: "Anthropic",
            description: "Claude family of models",
            oauth_url: None,
            required_scopes: &[],
            optional_scopes: &[],
            features: API_KEY_ONLY,
        },
        ProviderEntry {
            name: "openai",
            method: AuthMethod::ApiKey,
            display_name: "OpenAI",
            description: "GPT family of models",
            oauth_url: None,
            required_scopes: &[],
            optional_scopes: &[],
            features: API_KEY_ONLY,
        },
        ProviderEntry {
            name: "google",
            method: AuthMethod::OAuth,
            display_name: "Google AI",
            description: "Gemini models via Google Cloud OAuth",
            oauth_url: Some("https://accounts.google.com/o/oauth2/v2/auth"),
            required_scopes: &["https://www.googleapis.com/auth/generative-language"],
            optional_scopes: &["https://www.googleapis.com/auth/cloud-platform"],
            features: ProviderFeatures {
                supports_oauth: true,
                supports_api_key: true,
                supports_multi_key: false,
                requires_pkce: true,
                token_refresh: true,
            },
        },
        ProviderEntry {
            name: "openrouter",
            method: AuthMethod::ApiKey,
            display_name: "OpenRouter",
            description: "Unified gateway across many model vendors",
            oauth_url: None,
            required_scopes: &[],
            optional_scopes: &[],
            features: API_KEY_ONLY,
        },
        ProviderEntry {
            name: "mistral",
            method: AuthMethod::ApiKey,
            display_name: "Mistral AI",
            description: "Mistral and Codestral models",
            oauth_url: None,
            required_scopes: &[],
            optional_scopes: &[],
            features: API_KEY_ONLY,
        },
        ProviderEntry {
            name: "github-copilot",
            method: AuthMethod::OAuth,
            display_name: "GitHub Copilot",
            description: "Copilot completions via GitHub OAuth",
            oauth_url: Some("https://github.com/login/oauth/authorize"),
            required_scopes: &["read:user"],
            optional_scopes: &[],
            features: ProviderFeatures {
                supports_oauth: true,
                supports_api_key: false,
                supports_multi_key: false,
                requires_pkce: true,
                token_refresh: true,
            },
        },
    ]
});

/// Look up a provider by name.
pub fn lookup(name: &str) -> Option<&'static ProviderEntry> {
    CATALOG.iter().find(|entry| entry.name == name)
}

/// All cataloged providers.
pub fn list() -> &'static [ProviderEntry] {
    &CATALOG
}

/// Cataloged providers whose primary method matches.
pub fn by_method(method: AuthMethod) -> Vec<&'static ProviderEntry> {
    CATALOG.iter().filter(|e| e.method == method).collect()
}

/// Validate `input` against the catalog entry for `provider`, when one
/// exists. Unknown providers pass through unvalidated.
pub fn validate_input(provider: &str, input: &AuthInput) -> Result<()> {
    let Some(entry) = lookup(provider) else {
        return Ok(());
    };
    let supported = match input.method() {
        AuthMethod::ApiKey => entry.features.supports_api_key,
        AuthMethod::OAuth => entry.features.supports_oauth,
        // Static bearer tokens ride the API key capability; custom
        // implementations are the caller's responsibility.
        AuthMethod::BearerToken => entry.features.supports_api_key,
        AuthMethod::Custom => true,
    };
    if !supported {
        return Err(AuthError::invalid_config(format!(
            "provider {provider} does not support {} authentication",
            input.method()
        )));
    }
    if matches!(input, AuthInput::ApiKeys(keys) if keys.len() > 1)
        && !entry.features.supports_multi_key
    {
        return Err(AuthError::invalid_config(format!(
            "provider {provider} does not support multi-key pools"
        )));
    }
    Ok(())
}
