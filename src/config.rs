//! Configuration management for the object-store gateway
//!
//! The host hands the gateway a flat string map. `PluginConfig::from_map`
//! checks it against the recognized keys and parses the typed values.
//!
//! The standalone binary assembles that map from:
//! - Optional TOML config file (a flat table)
//! - Environment variables (`AZURE_OBJECTSTORE_<KEY>`)
//!
//! Environment variables take precedence over config file values.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::{GatewayError, Result};

/// Configuration map as handed over by the host
pub type ConfigMap = HashMap<String, String>;

pub const STORAGE_ACCOUNT_KEY: &str = "storageAccount";
pub const SUBSCRIPTION_ID_KEY: &str = "subscriptionId";
pub const RESOURCE_GROUP_KEY: &str = "resourceGroup";
pub const CREDENTIALS_FILE_KEY: &str = "credentialsFile";
pub const BLOCK_SIZE_KEY: &str = "blockSizeInBytes";
pub const ACCOUNT_KEY_VAR_KEY: &str = "storageAccountKeyEnvVar";

/// Keys this backend understands
pub const RECOGNIZED_KEYS: [&str; 6] = [
    STORAGE_ACCOUNT_KEY,
    SUBSCRIPTION_ID_KEY,
    RESOURCE_GROUP_KEY,
    CREDENTIALS_FILE_KEY,
    BLOCK_SIZE_KEY,
    ACCOUNT_KEY_VAR_KEY,
];

/// Keys the host adds to every object-store config; accepted and ignored
const HOST_RESERVED_KEYS: [&str; 3] = ["bucket", "prefix", "caCert"];

// Secret variable names, looked up in the secrets context
pub const ACCOUNT_ACCESS_KEY_VAR: &str = "AZURE_STORAGE_ACCOUNT_ACCESS_KEY";
pub const ENCRYPTION_KEY_VAR: &str = "AZURE_STORAGE_ACCOUNT_ENCRYPTION_KEY";
pub const ENCRYPTION_HASH_VAR: &str = "AZURE_STORAGE_ACCOUNT_ENCRYPTION_HASH";
pub const ENCRYPTION_SCOPE_VAR: &str = "AZURE_STORAGE_ACCOUNT_ENCRYPTION_SCOPE";
pub const CREDENTIALS_FILE_VAR: &str = "AZURE_CREDENTIALS_FILE";
pub const CLIENT_ID_VAR: &str = "AZURE_CLIENT_ID";
pub const BLOB_DOMAIN_VAR: &str = "AZURE_BLOB_DOMAIN_NAME";
pub const BLOB_ENDPOINT_VAR: &str = "AZURE_BLOB_ENDPOINT";
pub const MSI_ENDPOINT_VAR: &str = "AZURE_MSI_ENDPOINT";

/// See https://learn.microsoft.com/en-us/rest/api/storageservices/put-block#uri-parameters
pub const MAX_BLOCK_SIZE: usize = 100 * 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: usize = MAX_BLOCK_SIZE;

/// Validated plugin configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    /// Storage account name, the first label of the endpoint host
    pub storage_account: String,

    /// Subscription holding the account (informational)
    pub subscription_id: Option<String>,

    /// Resource group holding the account (informational)
    pub resource_group: Option<String>,

    /// Explicit secrets file path
    pub credentials_file: Option<PathBuf>,

    /// Upload block size in bytes (default: 100 MiB)
    pub block_size: usize,

    /// Name of the secret holding the shared key, when overridden
    pub account_key_var: Option<String>,
}

impl PluginConfig {
    /// Validate a host configuration map
    ///
    /// Unknown keys are rejected so that typos surface at Init instead of
    /// being silently ignored.
    pub fn from_map(map: &ConfigMap) -> Result<Self> {
        let mut unknown: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|k| !RECOGNIZED_KEYS.contains(k) && !HOST_RESERVED_KEYS.contains(k))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            return Err(GatewayError::ConfigValidation(format!(
                "unrecognized configuration keys: {}; valid keys are: {}",
                unknown.join(", "),
                RECOGNIZED_KEYS.join(", ")
            )));
        }

        let storage_account = non_empty(map, STORAGE_ACCOUNT_KEY).ok_or_else(|| {
            GatewayError::ConfigValidation(format!("{} is required", STORAGE_ACCOUNT_KEY))
        })?;

        let block_size = match non_empty(map, BLOCK_SIZE_KEY) {
            Some(raw) => parse_block_size(&raw)?,
            None => DEFAULT_BLOCK_SIZE,
        };

        Ok(Self {
            storage_account,
            subscription_id: non_empty(map, SUBSCRIPTION_ID_KEY),
            resource_group: non_empty(map, RESOURCE_GROUP_KEY),
            credentials_file: non_empty(map, CREDENTIALS_FILE_KEY).map(PathBuf::from),
            block_size,
            account_key_var: non_empty(map, ACCOUNT_KEY_VAR_KEY),
        })
    }

    /// Name of the secret that selects shared-key authentication
    pub fn account_key_var(&self) -> &str {
        self.account_key_var.as_deref().unwrap_or(ACCOUNT_ACCESS_KEY_VAR)
    }
}

fn non_empty(map: &ConfigMap, key: &str) -> Option<String> {
    map.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_block_size(raw: &str) -> Result<usize> {
    let size: usize = raw.parse().map_err(|_| {
        GatewayError::ConfigValidation(format!("{} must be an integer, got {:?}", BLOCK_SIZE_KEY, raw))
    })?;
    if size == 0 || size > MAX_BLOCK_SIZE {
        return Err(GatewayError::ConfigValidation(format!(
            "{} must be between 1 and {}, got {}",
            BLOCK_SIZE_KEY, MAX_BLOCK_SIZE, size
        )));
    }
    Ok(size)
}

/// Load the configuration map for the standalone binary
///
/// Environment variables:
/// - AZURE_OBJECTSTORE_CONFIG_FILE: optional path to a TOML config file
/// - AZURE_OBJECTSTORE_<KEY>: per-key override, e.g. AZURE_OBJECTSTORE_STORAGEACCOUNT
pub fn load_config_map() -> std::result::Result<ConfigMap, Box<dyn std::error::Error>> {
    let mut map = match std::env::var("AZURE_OBJECTSTORE_CONFIG_FILE") {
        Ok(path) => from_file(&path)?,
        Err(_) => ConfigMap::new(),
    };

    for key in RECOGNIZED_KEYS {
        if let Ok(value) = std::env::var(override_var(key)) {
            map.insert(key.to_string(), value);
        }
    }

    Ok(map)
}

fn override_var(key: &str) -> String {
    format!("AZURE_OBJECTSTORE_{}", key.to_uppercase())
}

/// Load a configuration map from a flat TOML table
///
/// Non-string scalars (e.g. `blockSizeInBytes = 4194304`) are kept in
/// their TOML text form.
pub fn from_file(path: &str) -> std::result::Result<ConfigMap, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    parse_toml(&content)
}

fn parse_toml(content: &str) -> std::result::Result<ConfigMap, Box<dyn std::error::Error>> {
    let table: HashMap<String, toml::Value> = toml::from_str(content)?;
    Ok(table
        .into_iter()
        .map(|(k, v)| match v {
            toml::Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}
