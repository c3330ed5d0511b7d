//! OAuth 2.0 authorization-code flow with PKCE and refresh.
//!
//! One [`OAuthAuthenticator`] per provider. The flow is:
//! 1. [`start_auth_flow`](OAuthAuthenticator::start_auth_flow) builds the
//!    authorization URL (no network I/O) and pins a CSRF state value plus a
//!    PKCE verifier on the authenticator.
//! 2. [`handle_callback`](OAuthAuthenticator::handle_callback) validates the
//!    returned state in constant time and exchanges the code for tokens.
//! 3. [`refresh_token`](OAuthAuthenticator::refresh_token) rotates the access
//!    token ahead of expiry, keeping the old refresh token when the provider
//!    does not issue a new one.
//!
//! Tokens persist through the shared [`TokenStore`]. No lock is held across
//! any HTTP request: state is snapshotted, the guard dropped, and results
//! committed afterwards.

use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::config::{OAuthDefaults, PkceMethod};
use crate::error::{AuthError, Result};
use crate::security::crypto::generate_secure_token;
use crate::security::masking::constant_time_eq;
use crate::store::{OAuthToken, TokenStore};

/// Per-provider OAuth 2.0 client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    /// Optional for public clients using PKCE.
    #[serde(default, skip_serializing)]
    pub client_secret: Option<SecretString>,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthConfig {
    /// Whether the fields required to run an authorization flow are present.
    pub fn is_complete(&self) -> bool {
        !self.client_id.is_empty()
            && !self.auth_url.is_empty()
            && !self.token_url.is_empty()
            && !self.redirect_url.is_empty()
    }
}

/// Lifecycle of the OAuth authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// No client configuration present.
    Unconfigured,
    /// Configured but holding no usable token.
    Configured,
    /// An authorization URL has been issued; waiting for the callback.
    Authorizing,
    /// Holding a usable access token.
    Authorized,
}

/// Everything the caller may learn about the current token without touching
/// the secret material.
#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub expires_at: Option<DateTime<Utc>>,
    pub can_refresh: bool,
    pub scopes: Vec<String>,
}

/// A pending authorization flow: the state value and PKCE verifier issued by
/// `start_auth_flow`, waiting for the provider callback.
#[derive(Debug)]
struct PendingFlow {
    state: String,
    pkce_verifier: Option<String>,
    started_at: Instant,
}

#[derive(Debug)]
struct FlowData {
    state: FlowState,
    pending: Option<PendingFlow>,
    token: Option<OAuthToken>,
}

/// Wire shape of a token endpoint response (RFC 6749 §5.1).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// OAuth 2.0 authenticator for a single provider.
#[derive(Debug)]
pub struct OAuthAuthenticator {
    provider: String,
    config: OAuthConfig,
    defaults: OAuthDefaults,
    store: Arc<dyn TokenStore>,
    client: reqwest::Client,
    flow: RwLock<FlowData>,
}

impl OAuthAuthenticator {
    pub fn new(
        provider: impl Into<String>,
        config: OAuthConfig,
        defaults: OAuthDefaults,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self> {
        if !config.is_complete() {
            return Err(AuthError::invalid_config(
                "OAuth config requires client_id, auth_url, token_url, and redirect_url",
            ));
        }
        for (name, value) in [
            ("auth_url", &config.auth_url),
            ("token_url", &config.token_url),
            ("redirect_url", &config.redirect_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| AuthError::invalid_config(format!("invalid {name}: {e}")))?;
        }

        let mut builder = reqwest::Client::builder().timeout(defaults.http.timeout);
        if let Some(user_agent) = &defaults.http.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().unwrap_or_else(|_| reqwest::Client::new());

        Ok(Self {
            provider: provider.into(),
            config,
            defaults,
            store,
            client,
            flow: RwLock::new(FlowData {
                state: FlowState::Configured,
                pending: None,
                token: None,
            }),
        })
    }

    /// The provider this authenticator serves.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Whether this provider is fully configured for confidential-client
    /// OAuth: client id and secret plus both endpoints.
    pub fn is_oauth_enabled(&self) -> bool {
        !self.config.client_id.is_empty()
            && self.config.client_secret.is_some()
            && !self.config.auth_url.is_empty()
            && !self.config.token_url.is_empty()
    }

    /// Begin an authorization-code flow and return the URL the user must
    /// visit. Performs no network I/O.
    pub async fn start_auth_flow(&self, scopes: &[String]) -> Result<String> {
        let scopes: Vec<String> = if !scopes.is_empty() {
            scopes.to_vec()
        } else if !self.config.scopes.is_empty() {
            self.config.scopes.clone()
        } else {
            self.defaults.default_scopes.clone()
        };

        let state = generate_secure_token(self.defaults.state.length);

        let (pkce_verifier, pkce_challenge) = if self.defaults.pkce.enabled {
            let verifier = generate_secure_token(self.defaults.pkce.verifier_length);
            let challenge = match self.defaults.pkce.method {
                PkceMethod::S256 => {
                    let digest = Sha256::digest(verifier.as_bytes());
                    URL_SAFE_NO_PAD.encode(digest)
                }
                PkceMethod::Plain => verifier.clone(),
            };
            (Some(verifier), Some(challenge))
        } else {
            (None, None)
        };

        let mut params = vec![
            ("response_type", "code".to_string()),
            ("client_id", self.config.client_id.clone()),
            ("redirect_uri", self.config.redirect_url.clone()),
            ("scope", scopes.join(" ")),
            ("state", state.clone()),
        ];
        if let Some(challenge) = &pkce_challenge {
            params.push(("code_challenge", challenge.clone()));
            params.push((
                "code_challenge_method",
                self.defaults.pkce.method.as_str().to_string(),
            ));
        }

        let url = format!(
            "{}?{}",
            self.config.auth_url,
            params
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&")
        );

        let mut flow = self.flow.write().await;
        flow.pending = Some(PendingFlow {
            state,
            pkce_verifier,
            started_at: Instant::now(),
        });
        if flow.state != FlowState::Authorized {
            flow.state = FlowState::Authorizing;
        }

        tracing::info!(provider = %self.provider, "OAuth flow started");
        Ok(url)
    }

    /// Exchange the authorization code delivered to the redirect URL.
    pub async fn handle_callback(&self, code: &str, state: &str) -> Result<()> {
        // Snapshot and consume the pending flow before any network I/O.
        let pending = {
            let mut flow = self.flow.write().await;
            flow.pending.take()
        };

        let verifier = if self.defaults.state.enable_validation {
            let Some(pending) = pending else {
                return Err(self.flow_failed("no authorization flow in progress", false));
            };
            if pending.started_at.elapsed() > self.defaults.state.expiration {
                return Err(self.flow_failed("authorization flow expired", false));
            }
            if !constant_time_eq(pending.state.as_bytes(), state.as_bytes()) {
                return Err(self.flow_failed("state parameter mismatch", false));
            }
            pending.pkce_verifier
        } else {
            pending.and_then(|p| p.pkce_verifier)
        };

        let mut params = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.config.redirect_url.clone()),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.expose_secret().to_string()));
        }
        if let Some(verifier) = &verifier {
            params.push(("code_verifier", verifier.clone()));
        }

        let response = self.post_token_endpoint(&params).await?;
        let token = self.token_from_response(response, None);

        self.store.store(&self.provider, &token).await?;

        let mut flow = self.flow.write().await;
        flow.token = Some(token);
        flow.state = FlowState::Authorized;
        drop(flow);

        tracing::info!(provider = %self.provider, "OAuth tokens obtained");
        Ok(())
    }

    /// Refresh the access token if it is inside the configured buffer of
    /// its expiration. A comfortably-valid token short-circuits without any
    /// network I/O.
    pub async fn refresh_token(&self) -> Result<()> {
        if !self.defaults.refresh.enabled {
            return Err(AuthError::RefreshFailed {
                provider: self.provider.clone(),
                reason: "token refresh is disabled".to_string(),
                retryable: false,
            });
        }

        let (refresh_token, needs_refresh, current) = {
            let flow = self.flow.read().await;
            let Some(token) = &flow.token else {
                return Err(AuthError::RefreshFailed {
                    provider: self.provider.clone(),
                    reason: "no token to refresh".to_string(),
                    retryable: false,
                });
            };
            (
                token
                    .refresh_token
                    .as_ref()
                    .map(|t| t.expose_secret().to_string()),
                token.is_expired(self.defaults.refresh.buffer),
                token.clone(),
            )
        };
        // Guard released before any network I/O below.

        if !needs_refresh {
            return Ok(());
        }
        let Some(refresh_token) = refresh_token else {
            return Err(AuthError::RefreshFailed {
                provider: self.provider.clone(),
                reason: "no refresh token available".to_string(),
                retryable: false,
            });
        };

        let mut params = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.clone()),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.expose_secret().to_string()));
        }

        let response = self
            .post_token_endpoint(&params)
            .await
            .map_err(|err| match err {
                AuthError::OAuthFlowFailed {
                    provider,
                    reason,
                    retryable,
                } => AuthError::RefreshFailed {
                    provider,
                    reason,
                    retryable,
                },
                other => other,
            })?;

        let token = self.token_from_response(response, Some(current));
        self.store.store(&self.provider, &token).await?;

        let mut flow = self.flow.write().await;
        flow.token = Some(token);
        flow.state = FlowState::Authorized;
        drop(flow);

        tracing::info!(provider = %self.provider, "OAuth tokens refreshed");
        Ok(())
    }

    /// Lazily establish a session: load a stored token, refresh it if it is
    /// stale, or report `token_expired` so the caller can start a new flow.
    pub async fn authenticate(&self) -> Result<()> {
        let loaded = {
            let flow = self.flow.read().await;
            flow.token.clone()
        };

        let token = match loaded {
            Some(token) => Some(token),
            None => match self.store.retrieve(&self.provider).await {
                Ok(token) => Some(token),
                Err(err) => {
                    tracing::debug!(provider = %self.provider, error = %err, "No stored token");
                    None
                }
            },
        };

        if let Some(token) = token {
            let fresh = !token.is_expired(self.defaults.refresh.buffer);
            let mut flow = self.flow.write().await;
            flow.token = Some(token);
            if fresh {
                flow.state = FlowState::Authorized;
                return Ok(());
            }
            drop(flow);

            // Stale but present: a refresh may still save the session.
            return match self.refresh_token().await {
                Ok(()) => Ok(()),
                Err(err) => {
                    tracing::debug!(provider = %self.provider, error = %err, "Refresh failed");
                    Err(AuthError::TokenExpired {
                        provider: self.provider.clone(),
                    })
                }
            };
        }

        Err(AuthError::TokenExpired {
            provider: self.provider.clone(),
        })
    }

    /// Whether a usable access token is currently held.
    pub async fn is_authenticated(&self) -> bool {
        let flow = self.flow.read().await;
        flow.state == FlowState::Authorized
            && flow
                .token
                .as_ref()
                .is_some_and(|t| !t.is_expired(self.defaults.refresh.buffer))
    }

    /// The current access token. Refreshes first when inside the expiry
    /// buffer; fails with `token_expired` when no usable token exists.
    pub async fn access_token(&self) -> Result<SecretString> {
        let (state, token) = {
            let flow = self.flow.read().await;
            (flow.state, flow.token.clone())
        };

        if state != FlowState::Authorized {
            return Err(AuthError::TokenExpired {
                provider: self.provider.clone(),
            });
        }
        let Some(token) = token else {
            return Err(AuthError::TokenExpired {
                provider: self.provider.clone(),
            });
        };

        if token.is_expired(self.defaults.refresh.buffer) {
            self.refresh_token().await?;
            let flow = self.flow.read().await;
            return flow
                .token
                .as_ref()
                .map(|t| t.access_token.clone())
                .ok_or_else(|| AuthError::TokenExpired {
                    provider: self.provider.clone(),
                });
        }

        Ok(token.access_token)
    }

    /// Drop the session: delete the stored token and clear in-memory state.
    pub async fn logout(&self) -> Result<()> {
        self.store.delete(&self.provider).await?;
        let mut flow = self.flow.write().await;
        flow.token = None;
        flow.pending = None;
        flow.state = FlowState::Configured;
        drop(flow);
        tracing::info!(provider = %self.provider, "OAuth session cleared");
        Ok(())
    }

    /// Expiry and refresh capability of the current token.
    pub async fn token_info(&self) -> Result<TokenInfo> {
        let token = {
            let flow = self.flow.read().await;
            flow.token.clone()
        };
        let token = match token {
            Some(token) => token,
            None => self.store.retrieve(&self.provider).await?,
        };
        Ok(TokenInfo {
            expires_at: token.expires_at,
            can_refresh: token.can_refresh() && self.defaults.refresh.enabled,
            scopes: token.scopes.clone(),
        })
    }

    /// Current state machine position (for status reporting).
    pub async fn flow_state(&self) -> FlowState {
        self.flow.read().await.state
    }

    fn flow_failed(&self, reason: &str, retryable: bool) -> AuthError {
        AuthError::OAuthFlowFailed {
            provider: self.provider.clone(),
            reason: reason.to_string(),
            retryable,
        }
    }

    /// POST to the token endpoint and parse the response. 5xx responses are
    /// flagged retryable; 4xx are not.
    async fn post_token_endpoint(&self, params: &[(&str, String)]) -> Result<TokenResponse> {
        let response = self
            .client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = parse_error_body(&body)
                .unwrap_or_else(|| format!("token endpoint returned HTTP {status}"));
            return Err(self.flow_failed(&reason, status.is_server_error()));
        }

        let body = response.text().await.unwrap_or_default();
        serde_json::from_str(&body)
            .map_err(|e| self.flow_failed(&format!("invalid token response: {e}"), false))
    }

    /// Fold a token endpoint response into a full token, carrying endpoint
    /// config and, on refresh, the previous refresh token when the
    /// provider omits a new one.
    fn token_from_response(
        &self,
        response: TokenResponse,
        previous: Option<OAuthToken>,
    ) -> OAuthToken {
        let expires_at = response
            .expires_in
            .filter(|s| *s > 0)
            .map(|s| Utc::now() + chrono::Duration::seconds(s));

        let refresh_token = response
            .refresh_token
            .map(SecretString::from)
            .or_else(|| previous.and_then(|p| p.refresh_token));

        let scopes = response
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| self.config.scopes.clone());

        OAuthToken {
            access_token: SecretString::from(response.access_token),
            refresh_token,
            expires_at,
            scopes,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            auth_url: self.config.auth_url.clone(),
            token_url: self.config.token_url.clone(),
            redirect_url: self.config.redirect_url.clone(),
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.clone(),
        }
    }
}

/// Pull `error_description` / `error` out of an RFC 6749 error body.
fn parse_error_body(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
        #[serde(default)]
        error_description: Option<String>,
    }
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    Some(match parsed.error_description {
        Some(description) => format!("{}: {description}", parsed.error),
        None => parsed.error,
    })
}
