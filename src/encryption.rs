//! Customer-provided encryption keys
//!
//! When both the key and its SHA-256 hash are configured, every blob
//! read, write and metadata call carries them so the service encrypts at
//! rest with a key it does not manage. Otherwise nothing is attached and
//! the account's default encryption applies.

use std::fmt;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::config::{ENCRYPTION_HASH_VAR, ENCRYPTION_KEY_VAR, ENCRYPTION_SCOPE_VAR};
use crate::secrets::Secrets;

const ENCRYPTION_KEY_HEADER: &str = "x-ms-encryption-key";
const ENCRYPTION_KEY_SHA256_HEADER: &str = "x-ms-encryption-key-sha256";
const ENCRYPTION_ALGORITHM_HEADER: &str = "x-ms-encryption-algorithm";
const ENCRYPTION_SCOPE_HEADER: &str = "x-ms-encryption-scope";
const ENCRYPTION_ALGORITHM: &str = "AES256";

/// Optional customer-provided key triple
#[derive(Clone, Default, PartialEq, Eq)]
pub struct EncryptionOptions {
    cpk: Option<CustomerProvidedKey>,
}

#[derive(Clone, PartialEq, Eq)]
struct CustomerProvidedKey {
    key: String,
    key_sha256: String,
    scope: Option<String>,
}

impl EncryptionOptions {
    /// No customer-provided key; server-managed encryption only
    pub fn unset() -> Self {
        Self::default()
    }

    pub fn new(key: impl Into<String>, key_sha256: impl Into<String>, scope: Option<String>) -> Self {
        Self {
            cpk: Some(CustomerProvidedKey {
                key: key.into(),
                key_sha256: key_sha256.into(),
                scope: scope.filter(|s| !s.trim().is_empty()),
            }),
        }
    }

    /// Build from the resolved secrets
    pub fn from_secrets(secrets: &Secrets) -> Self {
        let key = secrets.get_non_empty(ENCRYPTION_KEY_VAR);
        let hash = secrets.get_non_empty(ENCRYPTION_HASH_VAR);
        let scope = secrets.get_non_empty(ENCRYPTION_SCOPE_VAR).map(str::to_string);

        match (key, hash) {
            (Some(key), Some(hash)) => Self::new(key, hash, scope),
            (None, None) => Self::unset(),
            _ => {
                warn!(
                    "Only one of {} and {} is set; customer-provided key encryption is disabled",
                    ENCRYPTION_KEY_VAR, ENCRYPTION_HASH_VAR
                );
                Self::unset()
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.cpk.is_some()
    }

    pub fn scope(&self) -> Option<&str> {
        self.cpk.as_ref().and_then(|c| c.scope.as_deref())
    }

    /// Header name/value pairs to attach, empty when unset
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let Some(cpk) = &self.cpk else {
            return Vec::new();
        };

        let mut pairs = vec![
            (ENCRYPTION_KEY_HEADER, cpk.key.clone()),
            (ENCRYPTION_KEY_SHA256_HEADER, cpk.key_sha256.clone()),
            (ENCRYPTION_ALGORITHM_HEADER, ENCRYPTION_ALGORITHM.to_string()),
        ];
        if let Some(scope) = &cpk.scope {
            pairs.push((ENCRYPTION_SCOPE_HEADER, scope.clone()));
        }
        pairs
    }

    /// Attach the encryption headers to an outgoing request
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), String> {
        for (name, value) in self.header_pairs() {
            let value = HeaderValue::from_str(&value)
                .map_err(|_| format!("{} is not a valid header value", name))?;
            headers.insert(HeaderName::from_static(name), value);
        }
        Ok(())
    }
}

impl fmt::Debug for EncryptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionOptions")
            .field("customer_provided_key", &self.is_set())
            .field("scope", &self.scope())
            .finish()
    }
}
