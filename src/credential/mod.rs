//! Credential selection
//!
//! Two mutually exclusive strategies:
//! - Shared Key: the storage account key signs every request
//! - Refreshing token: a managed-identity bearer token, kept fresh in the
//!   background
//!
//! The shared key wins whenever its secret is present, even if identity
//! settings are also configured.

mod shared_key;
mod token;

use std::sync::Arc;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use tracing::{debug, info};

use crate::config::{PluginConfig, CLIENT_ID_VAR, MSI_ENDPOINT_VAR};
use crate::errors::{GatewayError, Result};
use crate::secrets::Secrets;

pub use shared_key::SharedKeyCredential;
pub use token::{
    AccessToken, ManagedIdentitySource, RefreshPolicy, RefreshingToken, TokenSource, TokenState,
    DEFAULT_MSI_ENDPOINT, STORAGE_RESOURCE,
};

/// Authentication used for every blob call
#[derive(Debug)]
pub enum Credential {
    SharedKey(SharedKeyCredential),
    Token(RefreshingToken),
}

impl Credential {
    /// Attach authorization to a fully built request
    pub fn authorize(&self, request: &mut reqwest::Request) -> Result<()> {
        match self {
            Credential::SharedKey(key) => key.authorize(request),
            Credential::Token(token) => {
                let value = HeaderValue::from_str(&format!("Bearer {}", token.token()))
                    .map_err(|e| GatewayError::Credential(format!("invalid access token: {}", e)))?;
                request.headers_mut().insert(AUTHORIZATION, value);
                Ok(())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Credential::SharedKey(_) => "shared-key",
            Credential::Token(_) => "token",
        }
    }

    /// Stop background work owned by the credential
    pub fn shutdown(&self) {
        if let Credential::Token(token) = self {
            token.stop();
        }
    }
}

/// Builds the credential from configuration and resolved secrets
pub struct CredentialFactory<'a> {
    config: &'a PluginConfig,
    secrets: &'a Secrets,
    policy: RefreshPolicy,
}

impl<'a> CredentialFactory<'a> {
    pub fn new(config: &'a PluginConfig, secrets: &'a Secrets) -> Self {
        Self {
            config,
            secrets,
            policy: RefreshPolicy::default(),
        }
    }

    pub fn with_refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Whether the shared-key branch applies
    ///
    /// A key variable named explicitly in the configuration must exist.
    pub fn uses_shared_key(&self) -> Result<bool> {
        let var = self.config.account_key_var();
        if self.secrets.contains(var) {
            return Ok(true);
        }
        if self.config.account_key_var.is_some() {
            return Err(GatewayError::SecretsResolution(format!(
                "required secret {} not set",
                var
            )));
        }
        Ok(false)
    }

    /// Build the credential, contacting the identity endpoint if needed
    pub async fn build(&self) -> Result<Credential> {
        if self.uses_shared_key()? {
            return self.build_shared_key();
        }

        let source = ManagedIdentitySource::new(
            self.secrets.get_non_empty(MSI_ENDPOINT_VAR),
            self.client_id(),
        )?;
        self.build_token(Arc::new(source)).await
    }

    fn build_shared_key(&self) -> Result<Credential> {
        debug!("Building shared key credential");
        let key = self.secrets.require(self.config.account_key_var())?;
        let credential = SharedKeyCredential::new(&self.config.storage_account, key)?;
        info!(account = %credential.account(), "Using shared key credential");
        Ok(Credential::SharedKey(credential))
    }

    /// Token branch with an explicit token source
    pub async fn build_token(&self, source: Arc<dyn TokenSource>) -> Result<Credential> {
        debug!(
            user_assigned = self.client_id().is_some(),
            "Building managed identity credential"
        );
        let token = RefreshingToken::start(source, self.policy).await?;
        info!(expires_on = %token.expires_on(), "Using managed identity credential");
        Ok(Credential::Token(token))
    }

    fn client_id(&self) -> Option<String> {
        self.secrets.get_non_empty(CLIENT_ID_VAR).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigMap, ACCOUNT_ACCESS_KEY_VAR, ACCOUNT_KEY_VAR_KEY, STORAGE_ACCOUNT_KEY};

    const KEY: &str = "a2V5LWZvci10ZXN0aW5nLW9ubHk=";

    fn config(pairs: &[(&str, &str)]) -> PluginConfig {
        let map: ConfigMap = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        PluginConfig::from_map(&map).unwrap()
    }

    #[tokio::test]
    async fn test_shared_key_wins_over_identity_settings() {
        let config = config(&[(STORAGE_ACCOUNT_KEY, "backupacct")]);
        let secrets: Secrets = [
            (ACCOUNT_ACCESS_KEY_VAR, KEY),
            (CLIENT_ID_VAR, "00000000-1111-2222-3333-444444444444"),
            // unreachable on purpose: must never be contacted
            (MSI_ENDPOINT_VAR, "http://127.0.0.1:9/token"),
        ]
        .into_iter()
        .collect();

        let credential = CredentialFactory::new(&config, &secrets).build().await.unwrap();
        assert!(matches!(credential, Credential::SharedKey(ref k) if k.account() == "backupacct"));
    }

    #[tokio::test]
    async fn test_malformed_shared_key() {
        let config = config(&[(STORAGE_ACCOUNT_KEY, "backupacct")]);
        let secrets: Secrets = [(ACCOUNT_ACCESS_KEY_VAR, "%%%")].into_iter().collect();
        let err = CredentialFactory::new(&config, &secrets).build().await.unwrap_err();
        assert!(matches!(err, GatewayError::Credential(_)));
    }

    #[tokio::test]
    async fn test_custom_key_var() {
        let config = config(&[
            (STORAGE_ACCOUNT_KEY, "backupacct"),
            (ACCOUNT_KEY_VAR_KEY, "BACKUP_ACCOUNT_KEY"),
        ]);

        let secrets: Secrets = [("BACKUP_ACCOUNT_KEY", KEY)].into_iter().collect();
        let credential = CredentialFactory::new(&config, &secrets).build().await.unwrap();
        assert_eq!(credential.kind(), "shared-key");

        let missing = Secrets::default();
        let err = CredentialFactory::new(&config, &missing).build().await.unwrap_err();
        assert!(matches!(err, GatewayError::SecretsResolution(_)));
    }

    #[tokio::test]
    async fn test_token_branch_without_shared_key() {
        let mut server = mockito::Server::new_async().await;
        let expires_on = (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp();
        let mock = server
            .mock("GET", "/token")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(format!(r#"{{"access_token":"msi-token","expires_on":"{}"}}"#, expires_on))
            .expect(2)
            .create_async()
            .await;

        let config = config(&[(STORAGE_ACCOUNT_KEY, "backupacct")]);
        let endpoint = format!("{}/token", server.url());
        let secrets: Secrets = [(MSI_ENDPOINT_VAR, endpoint.as_str())].into_iter().collect();

        let credential = CredentialFactory::new(&config, &secrets).build().await.unwrap();
        mock.assert_async().await;
        assert_eq!(credential.kind(), "token");

        let mut request = reqwest::Request::new(
            reqwest::Method::GET,
            url::Url::parse("https://backupacct.blob.core.windows.net/c/k").unwrap(),
        );
        credential.authorize(&mut request).unwrap();
        assert_eq!(request.headers().get(AUTHORIZATION).unwrap(), "Bearer msi-token");
        credential.shutdown();
    }

    #[tokio::test]
    async fn test_token_branch_unreachable_endpoint() {
        let config = config(&[(STORAGE_ACCOUNT_KEY, "backupacct")]);
        let secrets: Secrets = [(MSI_ENDPOINT_VAR, "http://127.0.0.1:9/token")]
            .into_iter()
            .collect();
        let err = CredentialFactory::new(&config, &secrets).build().await.unwrap_err();
        assert!(matches!(err, GatewayError::Credential(_)));
    }
}
