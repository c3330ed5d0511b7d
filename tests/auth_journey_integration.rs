//! Integration tests from an embedding client's perspective.
//!
//! These tests exercise the end-to-end credential journeys without any real
//! upstream provider: multi-key failover under partial outage, circuit
//! breaker recovery, the full OAuth authorization-code flow against a stub
//! token endpoint, proactive refresh short-circuiting, expired-token
//! purging, and encrypted persistence.
//!
//! Run: `cargo test --test auth_journey_integration`

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axum::Form;
use axum::Json;
use axum::Router;
use axum::routing::post;
use serde_json::{Value, json};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Spawn a stub OAuth token endpoint on an ephemeral port.
///
/// Answers `authorization_code` grants with a fixed token pair and
/// `refresh_token` grants with a rotated access token. Counts requests so
/// tests can assert on network traffic.
async fn spawn_token_endpoint(hits: Arc<AtomicU32>) -> String {
    init_tracing();
    async fn handler(
        hits: Arc<AtomicU32>,
        Form(params): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        hits.fetch_add(1, Ordering::SeqCst);
        match params.get("grant_type").map(String::as_str) {
            Some("refresh_token") => Json(json!({
                "access_token": "a-refreshed",
                "token_type": "Bearer",
                "expires_in": 3600,
            })),
            _ => Json(json!({
                "access_token": "a",
                "refresh_token": "r",
                "token_type": "Bearer",
                "expires_in": 3600,
            })),
        }
    }

    let app = Router::new().route(
        "/token",
        post(move |form| handler(Arc::clone(&hits), form)),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/token")
}

// ============================================================================
// 1. Multi-key failover under partial outage
// ============================================================================
mod key_failover {
    use super::*;

    use authkit::config::{ApiKeyPoolConfig, AuthConfig, BackoffConfig, KeyHealthConfig};
    use authkit::keys::KeyManager;
    use authkit::{AuthError, AuthInput, AuthManager, MemoryTokenStore};

    fn pool(keys: &[&str]) -> KeyManager {
        let config = ApiKeyPoolConfig {
            health: KeyHealthConfig {
                failure_threshold: 3,
                backoff: BackoffConfig {
                    jitter: false,
                    ..BackoffConfig::default()
                },
                ..KeyHealthConfig::default()
            },
            ..ApiKeyPoolConfig::default()
        };
        KeyManager::new(
            "openai",
            keys.iter().map(|k| k.to_string()).collect(),
            config,
            Default::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_failover_routes_around_bad_key() {
        let manager = pool(&["k1", "k2", "k3"]);

        let result = manager
            .execute_with_failover(|key| async move {
                if key == "k1" {
                    Err(AuthError::Network {
                        reason: "429 too many requests".to_string(),
                        retryable: true,
                    })
                } else {
                    Ok(key)
                }
            })
            .await
            .unwrap();

        assert!(result == "k2" || result == "k3", "got {result}");

        let status = manager.status().await;
        let by_failures: Vec<u64> = status.keys.iter().map(|k| k.failure_count).collect();
        assert_eq!(by_failures.iter().sum::<u64>(), 1);
        assert_eq!(status.keys[0].failure_count, 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_reports_wrapped_error() {
        let manager = pool(&["k1", "k2"]);
        let err = manager
            .execute_with_failover(|_key| async move {
                Err::<(), _>(AuthError::InvalidCredentials {
                    provider: "openai".to_string(),
                    reason: "401 unauthorized".to_string(),
                })
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "all_keys_exhausted");
        // Both keys are in backoff after their failures.
        assert!(!manager.is_healthy().await);
    }

    #[tokio::test]
    async fn test_failover_via_manager_registration() {
        let store = Arc::new(MemoryTokenStore::new(Default::default()));
        let manager = AuthManager::new(AuthConfig::default(), store);
        let auth = manager
            .register_from_catalog(
                "openai",
                AuthInput::ApiKeys(vec!["k1".to_string(), "k2".to_string()]),
            )
            .await
            .unwrap();

        assert!(manager.is_authenticated("openai").await);
        let oauth_err = manager.start_oauth_flow("openai", &[]).await.unwrap_err();
        assert_eq!(oauth_err.code(), "invalid_config");
        drop(auth);
        manager.close().await.unwrap();
    }
}

// ============================================================================
// 2. Circuit breaker opens and recovers
// ============================================================================
mod breaker_recovery {
    use std::time::Duration;

    use authkit::config::{
        ApiKeyPoolConfig, BackoffConfig, CircuitBreakerConfig, FailoverConfig, KeyHealthConfig,
    };
    use authkit::keys::{BreakerState, KeyManager};
    use authkit::AuthError;

    #[tokio::test]
    async fn test_breaker_trips_then_half_opens() {
        let config = ApiKeyPoolConfig {
            health: KeyHealthConfig {
                failure_threshold: 2,
                backoff: BackoffConfig {
                    initial: Duration::from_millis(1),
                    jitter: false,
                    ..BackoffConfig::default()
                },
                ..KeyHealthConfig::default()
            },
            failover: FailoverConfig {
                circuit_breaker: CircuitBreakerConfig {
                    enabled: true,
                    failure_threshold: 2,
                    recovery_timeout: Duration::from_millis(100),
                    half_open_max_requests: 1,
                },
                ..FailoverConfig::default()
            },
            ..ApiKeyPoolConfig::default()
        };
        let manager = KeyManager::new(
            "openai",
            vec!["k1".to_string(), "k2".to_string()],
            config,
            Default::default(),
        )
        .unwrap();

        let err = AuthError::Network {
            reason: "503".to_string(),
            retryable: true,
        };
        manager.report_failure("k1", &err).await;
        manager.report_failure("k1", &err).await;

        // Open: selection skips k1 once its (tiny) backoff has cleared.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = manager.status().await;
        assert_eq!(status.keys[0].breaker, BreakerState::Open);
        for _ in 0..4 {
            assert_eq!(manager.next().await.unwrap(), "k2");
        }

        // Past the recovery timeout the breaker half-opens and k1 comes
        // back into rotation.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let status = manager.status().await;
        assert_eq!(status.keys[0].breaker, BreakerState::HalfOpen);

        let mut seen_k1 = false;
        for _ in 0..4 {
            if manager.next().await.unwrap() == "k1" {
                seen_k1 = true;
            }
        }
        assert!(seen_k1);

        // A probe success closes it for good.
        manager.report_success("k1").await;
        let status = manager.status().await;
        assert_eq!(status.keys[0].breaker, BreakerState::Closed);
        assert_eq!(status.keys[0].failure_count, 0);
    }
}

// ============================================================================
// 3. OAuth authorization-code flow with CSRF guard
// ============================================================================
mod oauth_flow {
    use super::*;

    use authkit::config::OAuthDefaults;
    use authkit::oauth::{OAuthAuthenticator, OAuthConfig};
    use authkit::store::{MemoryTokenStore, TokenStore};
    use secrecy::{ExposeSecret, SecretString};

    fn oauth_config(token_url: &str) -> OAuthConfig {
        OAuthConfig {
            client_id: "client-1".to_string(),
            client_secret: Some(SecretString::from("shh".to_string())),
            auth_url: "https://provider.example/authorize".to_string(),
            token_url: token_url.to_string(),
            redirect_url: "http://localhost:8484/callback".to_string(),
            scopes: vec!["inference".to_string()],
        }
    }

    fn state_param(url: &str) -> String {
        url.split("state=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_state_mismatch_rejected_then_valid_callback_succeeds() {
        let hits = Arc::new(AtomicU32::new(0));
        let token_url = spawn_token_endpoint(Arc::clone(&hits)).await;

        let store = Arc::new(MemoryTokenStore::new(Default::default()));
        let auth = OAuthAuthenticator::new(
            "example",
            oauth_config(&token_url),
            OAuthDefaults::default(),
            Arc::clone(&store) as Arc<dyn TokenStore>,
        )
        .unwrap();

        let url = auth.start_auth_flow(&[]).await.unwrap();
        assert!(url.contains("state="));

        // Forged state: rejected before any network traffic.
        let err = auth.handle_callback("c", "forged-state").await.unwrap_err();
        assert_eq!(err.code(), "oauth_flow_failed");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // The pending flow was consumed by the forged attempt; start over.
        let url = auth.start_auth_flow(&[]).await.unwrap();
        let state = state_param(&url);
        auth.handle_callback("c", &state).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(auth.is_authenticated().await);
        assert_eq!(auth.access_token().await.unwrap().expose_secret(), "a");

        // The token landed in the shared store.
        let stored = store.retrieve("example").await.unwrap();
        assert_eq!(stored.access_token.expose_secret(), "a");
        assert_eq!(
            stored.refresh_token.as_ref().unwrap().expose_secret(),
            "r"
        );
    }

    #[tokio::test]
    async fn test_refresh_rotates_access_token_and_keeps_refresh_token() {
        let hits = Arc::new(AtomicU32::new(0));
        let token_url = spawn_token_endpoint(Arc::clone(&hits)).await;

        let store = Arc::new(MemoryTokenStore::new(Default::default()));

        // Seed a token that is already inside the refresh buffer.
        let mut stale = authkit::OAuthToken::new("a-old");
        stale.refresh_token = Some(SecretString::from("r".to_string()));
        stale.expires_at = Some(chrono::Utc::now() + chrono::Duration::seconds(60));
        store.store("example", &stale).await.unwrap();

        let auth = OAuthAuthenticator::new(
            "example",
            oauth_config(&token_url),
            OAuthDefaults::default(),
            Arc::clone(&store) as Arc<dyn TokenStore>,
        )
        .unwrap();

        // authenticate loads the stored token and refreshes it.
        auth.authenticate().await.unwrap();
        assert_eq!(
            auth.access_token().await.unwrap().expose_secret(),
            "a-refreshed"
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The refresh response carried no refresh_token; the old one is kept.
        let stored = store.retrieve("example").await.unwrap();
        assert_eq!(stored.refresh_token.as_ref().unwrap().expose_secret(), "r");
    }
}

// ============================================================================
// 4. Refresh inside the buffer performs no network I/O
// ============================================================================
mod refresh_short_circuit {
    use super::*;

    use authkit::config::OAuthDefaults;
    use authkit::oauth::{OAuthAuthenticator, OAuthConfig};
    use authkit::store::{MemoryTokenStore, TokenStore};
    use secrecy::{ExposeSecret, SecretString};

    #[tokio::test]
    async fn test_fresh_token_skips_refresh_request() {
        let hits = Arc::new(AtomicU32::new(0));
        let token_url = spawn_token_endpoint(Arc::clone(&hits)).await;

        let store = Arc::new(MemoryTokenStore::new(Default::default()));
        let mut token = authkit::OAuthToken::new("a-fresh");
        token.refresh_token = Some(SecretString::from("r".to_string()));
        // Ten minutes out, against a five-minute buffer.
        token.expires_at = Some(chrono::Utc::now() + chrono::Duration::minutes(10));
        store.store("example", &token).await.unwrap();

        let auth = OAuthAuthenticator::new(
            "example",
            OAuthConfig {
                client_id: "c".to_string(),
                client_secret: Some(SecretString::from("s".to_string())),
                auth_url: "https://provider.example/authorize".to_string(),
                token_url,
                redirect_url: "http://localhost:1/cb".to_string(),
                scopes: vec![],
            },
            OAuthDefaults::default(),
            Arc::clone(&store) as Arc<dyn TokenStore>,
        )
        .unwrap();

        auth.authenticate().await.unwrap();
        auth.refresh_token().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0, "no HTTP request expected");
        assert_eq!(
            auth.access_token().await.unwrap().expose_secret(),
            "a-fresh"
        );
    }
}

// ============================================================================
// 5. Expired tokens are purged on retrieve
// ============================================================================
mod expiry_purge {
    use authkit::store::{MemoryTokenStore, TokenStore};
    use authkit::OAuthToken;

    #[tokio::test]
    async fn test_expired_token_purged_and_absent_from_list() {
        let store = MemoryTokenStore::new(Default::default());

        let mut token = OAuthToken::new("x");
        token.expires_at = Some(chrono::Utc::now() - chrono::Duration::hours(1));
        store.store("p", &token).await.unwrap();

        let err = store.retrieve("p").await.unwrap_err();
        assert_eq!(err.code(), "token_expired");
        assert!(!store.list().await.unwrap().contains(&"p".to_string()));

        // A second retrieve reports plain not-found.
        let err = store.retrieve("p").await.unwrap_err();
        assert_eq!(err.code(), "storage_error");
        store.close().await.unwrap();
    }
}

// ============================================================================
// 6. Encrypted file store round-trip
// ============================================================================
mod encrypted_persistence {
    use authkit::config::{EncryptionConfig, FileStorageConfig};
    use authkit::store::{FileTokenStore, TokenStore};
    use authkit::OAuthToken;
    use secrecy::{ExposeSecret, SecretString};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_on_disk_bytes_are_opaque() {
        let dir = TempDir::new().unwrap();
        let config = FileStorageConfig {
            directory: dir.path().join("tokens"),
            ..FileStorageConfig::default()
        };
        let encryption = EncryptionConfig {
            enabled: true,
            key: Some(SecretString::from(
                "my-32-byte-encryption-key-12345!".to_string(),
            )),
            ..EncryptionConfig::default()
        };
        let store = FileTokenStore::new(&config, &encryption).unwrap();

        store.store("p", &OAuthToken::new("secret")).await.unwrap();

        let raw = std::fs::read(dir.path().join("tokens").join("p.token")).unwrap();
        let needle = b"secret";
        assert!(
            !raw.windows(needle.len()).any(|w| w == needle),
            "plaintext leaked to disk"
        );

        let token = store.retrieve("p").await.unwrap();
        assert_eq!(token.access_token.expose_secret(), "secret");
    }

    #[tokio::test]
    async fn test_reopened_store_reads_existing_tokens() {
        let dir = TempDir::new().unwrap();
        let config = FileStorageConfig {
            directory: dir.path().join("tokens"),
            ..FileStorageConfig::default()
        };
        let encryption = EncryptionConfig {
            enabled: true,
            key: Some(SecretString::from(
                "my-32-byte-encryption-key-12345!".to_string(),
            )),
            ..EncryptionConfig::default()
        };

        {
            let store = FileTokenStore::new(&config, &encryption).unwrap();
            store.store("p", &OAuthToken::new("durable")).await.unwrap();
        }

        let reopened = FileTokenStore::new(&config, &encryption).unwrap();
        let token = reopened.retrieve("p").await.unwrap();
        assert_eq!(token.access_token.expose_secret(), "durable");
    }
}

// ============================================================================
// 7. Manager lifecycle end to end
// ============================================================================
mod manager_lifecycle {
    use super::*;

    use authkit::config::AuthConfig;
    use authkit::{AuthInput, AuthManager, AuthMethod, MemoryTokenStore};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_register_status_refresh_close() -> anyhow::Result<()> {
        super::init_tracing();
        let store = Arc::new(MemoryTokenStore::new(Default::default()));
        let manager = AuthManager::new(AuthConfig::default(), store);

        manager
            .register_from_catalog("openai", AuthInput::ApiKey("sk-123".to_string()))
            .await?;
        manager
            .register_from_catalog("anthropic", AuthInput::Bearer("tok".to_string()))
            .await?;

        manager.authenticate("openai").await?;
        manager.authenticate("anthropic").await?;

        let status = manager.status().await;
        assert_eq!(status.len(), 2);
        assert_eq!(status["openai"].method, AuthMethod::ApiKey);
        assert_eq!(status["anthropic"].method, AuthMethod::BearerToken);
        assert!(status["openai"].authenticated);

        manager.refresh_all().await?;

        let mut authenticated = manager.authenticated().await;
        authenticated.sort();
        assert_eq!(authenticated, vec!["anthropic", "openai"]);

        manager.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_catalog_rejects_unsupported_method() {
        let store = Arc::new(MemoryTokenStore::new(Default::default()));
        let manager = AuthManager::new(AuthConfig::default(), store);

        let err = manager
            .register_from_catalog(
                "anthropic",
                AuthInput::OAuth(authkit::OAuthConfig {
                    client_id: "c".to_string(),
                    client_secret: None,
                    auth_url: "https://x/auth".to_string(),
                    token_url: "https://x/token".to_string(),
                    redirect_url: "http://localhost/cb".to_string(),
                    scopes: vec![],
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_config");
        manager.close().await.unwrap();
    }
}
