//! Refreshing access-token credential
//!
//! Tokens come from the host's managed-identity endpoint. A background task
//! owns the only writer of a `watch` cell holding the current token and
//! re-fetches shortly before expiry; every outgoing request reads the cell.
//! Refresh failures are logged, counted and published on the cell, and the
//! task keeps retrying until it is cancelled.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::errors::{GatewayError, Result};
use crate::metrics::TOKEN_REFRESHES;

/// Well-known instance metadata identity endpoint
pub const DEFAULT_MSI_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const MSI_API_VERSION: &str = "2018-02-01";
/// Audience for blob data-plane tokens
pub const STORAGE_RESOURCE: &str = "https://storage.azure.com/";

/// Bearer token plus its expiry instant
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            secret: secret.into(),
            expires_on,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_on(&self) -> DateTime<Utc> {
        self.expires_on
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Something that can mint a fresh access token
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<AccessToken>;
}

/// Managed identity token source (system or user-assigned identity)
pub struct ManagedIdentitySource {
    client: reqwest::Client,
    endpoint: Url,
    client_id: Option<String>,
}

impl ManagedIdentitySource {
    /// `endpoint` overrides the metadata address; `client_id` selects a
    /// user-assigned identity instead of the system identity.
    pub fn new(endpoint: Option<&str>, client_id: Option<String>) -> Result<Self> {
        let raw = endpoint.unwrap_or(DEFAULT_MSI_ENDPOINT);
        let endpoint = Url::parse(raw).map_err(|e| {
            GatewayError::Credential(format!("invalid identity endpoint {}: {}", raw, e))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Credential(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            client_id,
        })
    }

    fn token_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("api-version", MSI_API_VERSION);
            query.append_pair("resource", STORAGE_RESOURCE);
            if let Some(client_id) = &self.client_id {
                query.append_pair("client_id", client_id);
            }
        }
        url
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_on: NumberOrString,
}

// The identity endpoint encodes numbers as JSON strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    String(String),
}

impl NumberOrString {
    fn as_i64(&self) -> Option<i64> {
        match self {
            NumberOrString::Number(n) => Some(*n),
            NumberOrString::String(s) => s.trim().parse().ok(),
        }
    }
}

#[async_trait]
impl TokenSource for ManagedIdentitySource {
    async fn fetch(&self) -> Result<AccessToken> {
        let response = self
            .client
            .get(self.token_url())
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|e| GatewayError::Credential(format!("identity endpoint unreachable: {}", e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Credential(format!("failed to read token response: {}", e)))?;

        if !status.is_success() {
            return Err(GatewayError::Credential(format!(
                "token request rejected: HTTP {} - {}",
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Credential(format!("malformed token response: {}", e)))?;
        let expires_on = parsed
            .expires_on
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| {
                GatewayError::Credential("token response has an invalid expires_on".to_string())
            })?;

        Ok(AccessToken::new(parsed.access_token, expires_on))
    }
}

/// Refresh scheduling knobs
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    /// How long before expiry to refresh
    pub lead: Duration,
    /// Delay before retrying after a failed refresh
    pub retry_backoff: Duration,
    /// Lower bound on the delay between refreshes
    pub min_delay: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            lead: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(30),
            min_delay: Duration::from_secs(1),
        }
    }
}

impl RefreshPolicy {
    /// Delay until the refresh for a token expiring at `expires_on`
    pub fn next_delay(&self, expires_on: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let until_expiry = (expires_on - now).to_std().unwrap_or(Duration::ZERO);
        until_expiry.saturating_sub(self.lead).max(self.min_delay)
    }
}

/// Value published by the refresh task
#[derive(Debug, Clone)]
pub struct TokenState {
    pub token: AccessToken,
    /// Failed refreshes since the last success
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Access token kept fresh by a background task
pub struct RefreshingToken {
    state: watch::Receiver<TokenState>,
    cancel: CancellationToken,
}

impl RefreshingToken {
    /// Fetch a token, force one refresh to confirm the source is live, then
    /// start the background refresh.
    pub async fn start(source: Arc<dyn TokenSource>, policy: RefreshPolicy) -> Result<Self> {
        let initial = source.fetch().await?;
        debug!(expires_on = %initial.expires_on(), "Initial access token fetched");

        let token = source.fetch().await?;
        info!(expires_on = %token.expires_on(), "Access token confirmed");

        let (tx, rx) = watch::channel(TokenState {
            token,
            consecutive_failures: 0,
            last_error: None,
        });
        let cancel = CancellationToken::new();
        tokio::spawn(run_refresh(source, tx, policy, cancel.clone()));

        Ok(Self { state: rx, cancel })
    }

    /// Current bearer token
    pub fn token(&self) -> String {
        self.state.borrow().token.secret().to_string()
    }

    pub fn expires_on(&self) -> DateTime<Utc> {
        self.state.borrow().token.expires_on()
    }

    /// Watch refresh outcomes, including failures
    pub fn subscribe(&self) -> watch::Receiver<TokenState> {
        self.state.clone()
    }

    /// Stop the background refresh
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RefreshingToken {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for RefreshingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("RefreshingToken")
            .field("expires_on", &state.token.expires_on())
            .field("consecutive_failures", &state.consecutive_failures)
            .finish()
    }
}

async fn run_refresh(
    source: Arc<dyn TokenSource>,
    tx: watch::Sender<TokenState>,
    policy: RefreshPolicy,
    cancel: CancellationToken,
) {
    let mut delay = policy.next_delay(tx.borrow().token.expires_on(), Utc::now());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Token refresh stopped");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match source.fetch().await {
            Ok(token) => {
                TOKEN_REFRESHES.with_label_values(&["success"]).inc();
                delay = policy.next_delay(token.expires_on(), Utc::now());
                debug!(
                    expires_on = %token.expires_on(),
                    next_refresh_secs = delay.as_secs(),
                    "Access token refreshed"
                );
                tx.send_modify(|state| {
                    state.token = token;
                    state.consecutive_failures = 0;
                    state.last_error = None;
                });
            }
            Err(e) => {
                TOKEN_REFRESHES.with_label_values(&["failure"]).inc();
                delay = policy.retry_backoff;
                let message = e.to_string();
                tx.send_modify(|state| {
                    state.consecutive_failures += 1;
                    state.last_error = Some(message);
                });
                error!(
                    error = %e,
                    consecutive_failures = tx.borrow().consecutive_failures,
                    retry_in_secs = delay.as_secs(),
                    "Access token refresh failed"
                );
            }
        }
    }
}
