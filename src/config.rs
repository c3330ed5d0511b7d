//! Configuration for the auth core.
//!
//! A nested configuration tree with sensible defaults for token storage,
//! OAuth flows, API key pools, security, and retry behavior. Environment
//! variables prefixed with `AUTH_` override the most commonly tuned knobs;
//! everything else is set programmatically or deserialized from a config
//! file by the embedding application.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Which token store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Persistent file-per-token store under a directory.
    #[default]
    File,
    /// In-memory store, optionally snapshotted to disk.
    Memory,
    /// A caller-provided store implementation.
    Custom,
}

/// Key selection strategy for multi-key pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Rotate through keys in insertion order.
    #[default]
    RoundRobin,
    /// Pick uniformly at random among available keys.
    Random,
    /// Sample proportionally to per-key health weight.
    Weighted,
}

impl std::str::FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "weighted" => Ok(Self::Weighted),
            other => Err(format!("unknown selection strategy: {other}")),
        }
    }
}

/// PKCE code challenge method (RFC 7636).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PkceMethod {
    /// SHA-256 of the verifier, base64url-encoded.
    #[default]
    #[serde(rename = "S256")]
    S256,
    /// The verifier itself. Only for providers that cannot hash.
    #[serde(rename = "plain")]
    Plain,
}

impl PkceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S256 => "S256",
            Self::Plain => "plain",
        }
    }
}

/// Top-level configuration for the auth core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub token_storage: TokenStorageConfig,
    pub oauth: OAuthDefaults,
    pub api_key: ApiKeyPoolConfig,
    pub security: SecurityConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
}

impl AuthConfig {
    /// Build a config from defaults plus `AUTH_*` environment overrides.
    ///
    /// Loads a `.env` file first if one is present. Unparseable values are
    /// ignored in favor of the default.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(backend) = std::env::var("AUTH_STORAGE_TYPE") {
            match backend.as_str() {
                "file" => config.token_storage.backend = StorageBackend::File,
                "memory" => config.token_storage.backend = StorageBackend::Memory,
                "custom" => config.token_storage.backend = StorageBackend::Custom,
                other => tracing::warn!(value = other, "Unknown AUTH_STORAGE_TYPE, ignoring"),
            }
        }
        if let Ok(dir) = std::env::var("AUTH_STORAGE_DIRECTORY") {
            config.token_storage.file.directory = PathBuf::from(dir);
        }
        if let Ok(enabled) = std::env::var("AUTH_ENCRYPTION_ENABLED") {
            config.token_storage.encryption.enabled = enabled == "true" || enabled == "1";
        }
        if let Ok(key) = std::env::var("AUTH_ENCRYPTION_KEY") {
            config.token_storage.encryption.key = Some(SecretString::from(key));
        }
        if let Ok(len) = std::env::var("AUTH_OAUTH_STATE_LENGTH")
            && let Ok(len) = len.parse()
        {
            config.oauth.state.length = len;
        }
        if let Ok(enabled) = std::env::var("AUTH_OAUTH_PKCE_ENABLED") {
            config.oauth.pkce.enabled = enabled == "true" || enabled == "1";
        }
        if let Ok(buffer) = std::env::var("AUTH_OAUTH_REFRESH_BUFFER")
            && let Ok(secs) = buffer.parse()
        {
            config.oauth.refresh.buffer = Duration::from_secs(secs);
        }
        if let Ok(strategy) = std::env::var("AUTH_APIKEY_STRATEGY")
            && let Ok(strategy) = strategy.parse()
        {
            config.api_key.strategy = strategy;
        }
        if let Ok(threshold) = std::env::var("AUTH_APIKEY_FAILURE_THRESHOLD")
            && let Ok(threshold) = threshold.parse()
        {
            config.api_key.health.failure_threshold = threshold;
        }
        if let Ok(attempts) = std::env::var("AUTH_APIKEY_MAX_ATTEMPTS")
            && let Ok(attempts) = attempts.parse()
        {
            config.api_key.failover.max_attempts = Some(attempts);
        }

        config
    }
}

/// Token storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TokenStorageConfig {
    #[serde(rename = "type")]
    pub backend: StorageBackend,
    pub file: FileStorageConfig,
    pub memory: MemoryStorageConfig,
    pub encryption: EncryptionConfig,
}

/// File-backed store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStorageConfig {
    /// Directory holding one `.token` file per key.
    pub directory: PathBuf,
    /// Mode bits for token files (unix only).
    pub file_permissions: u32,
    /// Mode bits for the token directory (unix only).
    pub directory_permissions: u32,
    pub backup: BackupConfig,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            directory: default_token_directory(),
            file_permissions: 0o600,
            directory_permissions: 0o700,
            backup: BackupConfig::default(),
        }
    }
}

fn default_token_directory() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("authkit")
        .join("tokens")
}

/// Timestamped token backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    /// Defaults to `<storage directory>/backups` when unset.
    pub directory: Option<PathBuf>,
    /// How often the expiration sweeper runs. Clamped to at least 1 hour.
    pub interval: Duration,
    /// Most-recent backups retained per key.
    pub max_files: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            interval: Duration::from_secs(3600),
            max_files: 5,
        }
    }
}

/// In-memory store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStorageConfig {
    /// Store fails with a storage error once this many tokens are held.
    pub max_tokens: usize,
    pub cleanup_interval: Duration,
    /// Snapshot the token map to `persistence_file` on writes.
    pub enable_persistence: bool,
    pub persistence_file: Option<PathBuf>,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            cleanup_interval: Duration::from_secs(3600),
            enable_persistence: false,
            persistence_file: None,
        }
    }
}

/// At-rest encryption for the file store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// Raw key material; at least 32 bytes when set.
    #[serde(skip_serializing)]
    pub key: Option<SecretString>,
    /// Read the key from this file instead.
    pub key_file: Option<PathBuf>,
    pub algorithm: String,
    pub key_derivation: KeyDerivationConfig,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key: None,
            key_file: None,
            algorithm: "aes-256-gcm".to_string(),
            key_derivation: KeyDerivationConfig::default(),
        }
    }
}

/// Password-based key derivation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyDerivationConfig {
    pub function: String,
    pub salt: String,
    pub iterations: u32,
    pub key_length: usize,
}

impl Default for KeyDerivationConfig {
    fn default() -> Self {
        Self {
            function: "pbkdf2".to_string(),
            salt: "authkit-token-store".to_string(),
            iterations: 100_000,
            key_length: 32,
        }
    }
}

/// Crate-wide OAuth flow defaults. Per-provider endpoints live in
/// [`OAuthConfig`](crate::oauth::OAuthConfig).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OAuthDefaults {
    pub default_scopes: Vec<String>,
    pub state: StateConfig,
    pub pkce: PkceConfig,
    pub refresh: RefreshConfig,
    pub http: OAuthHttpConfig,
}

/// CSRF state parameter generation and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Random bytes in the state value before encoding.
    pub length: usize,
    /// Pending flows older than this are rejected.
    pub expiration: Duration,
    pub enable_validation: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            length: 32,
            expiration: Duration::from_secs(600),
            enable_validation: true,
        }
    }
}

/// PKCE configuration (RFC 7636).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkceConfig {
    pub enabled: bool,
    pub method: PkceMethod,
    /// Random bytes in the code verifier before encoding.
    pub verifier_length: usize,
}

impl Default for PkceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: PkceMethod::S256,
            verifier_length: 128,
        }
    }
}

/// Proactive token refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub enabled: bool,
    /// Refresh this long before the recorded expiration.
    pub buffer: Duration,
    pub max_retries: u32,
    /// Attempt a refresh when a request fails with an auth error.
    pub refresh_on_failure: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer: Duration::from_secs(300),
            max_retries: 3,
            refresh_on_failure: true,
        }
    }
}

/// HTTP client settings for token endpoint requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthHttpConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for OAuthHttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("authkit/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// Multi-key pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ApiKeyPoolConfig {
    pub strategy: SelectionStrategy,
    pub health: KeyHealthConfig,
    pub failover: FailoverConfig,
    pub rotation: RotationConfig,
}

/// Per-key health tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyHealthConfig {
    pub enabled: bool,
    /// Consecutive failures before a key is marked unhealthy.
    pub failure_threshold: u32,
    /// Successes required before an unhealthy key is trusted again.
    pub success_threshold: u32,
    pub backoff: BackoffConfig,
    pub check_interval: Duration,
}

impl Default for KeyHealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            success_threshold: 1,
            backoff: BackoffConfig::default(),
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff applied to failing keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub maximum: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            maximum: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Failover across keys in a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,
    /// Defaults to `min(pool size, 3)` when unset.
    pub max_attempts: Option<u32>,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: None,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Per-key circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub recovery_timeout: Duration,
    /// Successes in the half-open window required to close.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

/// Scheduled key rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub strategy: SelectionStrategy,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(24 * 3600),
            strategy: SelectionStrategy::RoundRobin,
        }
    }
}

/// Security and observability settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Emit an audit event for each auth lifecycle operation.
    pub audit_logging: bool,
    pub token_masking: TokenMaskingConfig,
    pub rate_limiting: RateLimitingConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            audit_logging: false,
            token_masking: TokenMaskingConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
        }
    }
}

/// Masking applied before credentials reach logs or status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenMaskingConfig {
    pub enabled: bool,
    pub prefix_length: usize,
    pub suffix_length: usize,
    pub mask_char: char,
}

impl Default for TokenMaskingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix_length: 4,
            suffix_length: 4,
            mask_char: '*',
        }
    }
}

/// Client-side rate limiting hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: 60,
            burst: 10,
        }
    }
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Operation deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub auth: Duration,
    pub token_refresh: Duration,
    pub oauth_flow: Duration,
    pub storage: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            auth: Duration::from_secs(30),
            token_refresh: Duration::from_secs(30),
            oauth_flow: Duration::from_secs(300),
            storage: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuthConfig::default();
        assert_eq!(config.token_storage.backend, StorageBackend::File);
        assert_eq!(config.oauth.state.length, 32);
        assert_eq!(config.oauth.pkce.verifier_length, 128);
        assert_eq!(config.oauth.refresh.buffer, Duration::from_secs(300));
        assert_eq!(config.api_key.strategy, SelectionStrategy::RoundRobin);
        assert_eq!(config.api_key.health.failure_threshold, 3);
        assert_eq!(config.security.token_masking.prefix_length, 4);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "round_robin".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::RoundRobin
        );
        assert_eq!(
            "weighted".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::Weighted
        );
        assert!("fastest".parse::<SelectionStrategy>().is_err());
    }

    #[test]
    fn test_pkce_method_serde_names() {
        let s256 = serde_json::to_string(&PkceMethod::S256).unwrap();
        assert_eq!(s256, "\"S256\"");
        let plain = serde_json::to_string(&PkceMethod::Plain).unwrap();
        assert_eq!(plain, "\"plain\"");
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let json = r#"{"api_key": {"strategy": "weighted"}}"#;
        let config: AuthConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.api_key.strategy, SelectionStrategy::Weighted);
        // Untouched sections keep their defaults.
        assert_eq!(config.api_key.health.failure_threshold, 3);
        assert!(config.oauth.pkce.enabled);
    }

    #[test]
    fn test_storage_backend_rename() {
        let json = r#"{"token_storage": {"type": "memory"}}"#;
        let config: AuthConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.token_storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_backup_defaults() {
        let backup = BackupConfig::default();
        assert!(!backup.enabled);
        assert_eq!(backup.interval, Duration::from_secs(3600));
        assert_eq!(backup.max_files, 5);
    }
}
