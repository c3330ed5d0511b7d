//! Error types for the auth core.

/// Top-level error type for authentication operations.
///
/// Every variant maps to a stable machine-readable code via [`code`](Self::code),
/// and transient conditions report `true` from [`is_retryable`](Self::is_retryable)
/// so callers can decide whether a retry is worthwhile.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials for provider {provider}: {reason}")]
    InvalidCredentials { provider: String, reason: String },

    #[error("Token for provider {provider} has expired")]
    TokenExpired { provider: String },

    #[error("Token refresh failed for provider {provider}: {reason}")]
    RefreshFailed {
        provider: String,
        reason: String,
        retryable: bool,
    },

    #[error("OAuth flow failed for provider {provider}: {reason}")]
    OAuthFlowFailed {
        provider: String,
        reason: String,
        retryable: bool,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Network error: {reason}")]
    Network { reason: String, retryable: bool },

    #[error("No authenticator registered for provider {provider}")]
    ProviderUnavailable { provider: String },

    #[error("Insufficient scopes for provider {provider}: missing {missing:?}")]
    ScopeInsufficient {
        provider: String,
        missing: Vec<String>,
    },

    #[error("Key rotation failed for provider {provider}: {reason}")]
    KeyRotationFailed { provider: String, reason: String },

    #[error("All keys exhausted for provider {provider} after {attempts} attempts")]
    AllKeysExhausted {
        provider: String,
        attempts: u32,
        #[source]
        source: Option<Box<AuthError>>,
    },

    #[error("Storage error: {reason}")]
    Storage { reason: String },

    #[error("Encryption error: {reason}")]
    Encryption { reason: String },
}

impl AuthError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials { .. } => "invalid_credentials",
            Self::TokenExpired { .. } => "token_expired",
            Self::RefreshFailed { .. } => "refresh_failed",
            Self::OAuthFlowFailed { .. } => "oauth_flow_failed",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::Network { .. } => "network_error",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ScopeInsufficient { .. } => "scope_insufficient",
            Self::KeyRotationFailed { .. } => "key_rotation_failed",
            Self::AllKeysExhausted { .. } => "all_keys_exhausted",
            Self::Storage { .. } => "storage_error",
            Self::Encryption { .. } => "encryption_error",
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Advisory only. Set for transient HTTP/network conditions and 5xx
    /// responses from token endpoints.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RefreshFailed { retryable, .. }
            | Self::OAuthFlowFailed { retryable, .. }
            | Self::Network { retryable, .. } => *retryable,
            // Surfaced when refresh itself failed but a new auth flow can
            // still recover the session.
            Self::TokenExpired { .. } => true,
            _ => false,
        }
    }

    /// The provider this error is scoped to, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::InvalidCredentials { provider, .. }
            | Self::TokenExpired { provider }
            | Self::RefreshFailed { provider, .. }
            | Self::OAuthFlowFailed { provider, .. }
            | Self::ProviderUnavailable { provider }
            | Self::ScopeInsufficient { provider, .. }
            | Self::KeyRotationFailed { provider, .. }
            | Self::AllKeysExhausted { provider, .. } => Some(provider),
            _ => None,
        }
    }

    pub(crate) fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    pub(crate) fn encryption(reason: impl Into<String>) -> Self {
        Self::Encryption {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        // Builder errors are programming mistakes; everything else on the
        // wire is worth retrying.
        let retryable = !err.is_builder();
        Self::Network {
            reason: err.to_string(),
            retryable,
        }
    }
}

impl From<std::io::Error> for AuthError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage {
            reason: format!("serialization failed: {err}"),
        }
    }
}

/// Result type alias for the auth core.
pub type Result<T> = std::result::Result<T, AuthError>;
