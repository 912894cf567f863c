//! Blob service endpoint

use url::Url;

use crate::config::{BLOB_DOMAIN_VAR, BLOB_ENDPOINT_VAR};
use crate::errors::{GatewayError, Result};
use crate::secrets::Secrets;

use super::ObjectDescriptor;

pub const DEFAULT_BLOB_DOMAIN: &str = "blob.core.windows.net";

/// Account name plus service base URL, fixed for the gateway's lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    account: String,
    url: Url,
}

impl Endpoint {
    /// `https://{account}.{domain}`, the domain defaulting to the public cloud
    pub fn for_account(account: &str, domain: Option<&str>) -> Result<Self> {
        let domain = domain
            .map(normalize_domain)
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_BLOB_DOMAIN.to_string());
        Self::custom(account, &format!("https://{}.{}", account, domain))
    }

    /// Explicit base URL, e.g. a storage emulator
    pub fn custom(account: &str, base: &str) -> Result<Self> {
        let url = Url::parse(base).map_err(|e| {
            GatewayError::ConfigValidation(format!("invalid blob endpoint {}: {}", base, e))
        })?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(GatewayError::ConfigValidation(format!(
                "invalid blob endpoint {}",
                base
            )));
        }
        Ok(Self {
            account: account.to_string(),
            url,
        })
    }

    /// Resolve from the secrets context: a full endpoint override wins over
    /// a domain override
    pub fn from_secrets(account: &str, secrets: &Secrets) -> Result<Self> {
        match secrets.get_non_empty(BLOB_ENDPOINT_VAR) {
            Some(base) => Self::custom(account, base.trim()),
            None => Self::for_account(account, secrets.get_non_empty(BLOB_DOMAIN_VAR)),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn container_url(&self, container: &str) -> Url {
        self.join(std::iter::once(container))
    }

    /// Blob URL; `/` in the key is kept as a path separator
    pub fn blob_url(&self, object: &ObjectDescriptor) -> Result<Url> {
        object.validate()?;
        Ok(self.join(std::iter::once(object.container.as_str()).chain(object.key.split('/'))))
    }

    fn join<'a>(&self, segments: impl Iterator<Item = &'a str>) -> Url {
        let mut url = self.url.clone();
        url.set_query(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

/// Lowercase, trim whitespace and surrounding dots
pub fn normalize_domain(raw: &str) -> String {
    raw.trim().to_lowercase().trim_matches('.').to_string()
}
