//! Secret resolution
//!
//! Secrets come from a snapshot of the process environment, overlaid with
//! the entries of an optional secrets file (`NAME=VALUE` per line). The
//! result is an explicit [`Secrets`] context handed to the credential and
//! encryption builders; the process environment itself is never modified.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::CREDENTIALS_FILE_VAR;
use crate::errors::{GatewayError, Result};

/// Name/value secrets namespace shared by the environment and secrets files
#[derive(Clone, Default)]
pub struct Secrets {
    values: HashMap<String, String>,
}

impl Secrets {
    /// Snapshot the current process environment
    pub fn from_env() -> Self {
        Self::from_os_vars(std::env::vars_os())
    }

    /// Entries whose name or value is not UTF-8 are skipped
    fn from_os_vars(vars: impl IntoIterator<Item = (OsString, OsString)>) -> Self {
        Self {
            values: vars
                .into_iter()
                .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Like [`Secrets::get`], treating blank values as absent
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.trim().is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Look up a secret that must be present
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| {
            GatewayError::SecretsResolution(format!("required secret {} not set", name))
        })
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Secrets {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

// Names only; values are secret.
impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.values.keys().collect();
        names.sort();
        f.debug_struct("Secrets").field("names", &names).finish()
    }
}

/// Locate the secrets file
///
/// An explicit path wins when it exists on disk; otherwise the path named by
/// `AZURE_CREDENTIALS_FILE` is used. `None` means no file is configured,
/// which is fine when the secrets are already in the environment.
pub fn resolve(explicit: Option<&Path>, secrets: &Secrets) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        debug!(path = %path.display(), "Configured secrets file not found, checking override");
    }

    secrets
        .get_non_empty(CREDENTIALS_FILE_VAR)
        .map(|p| PathBuf::from(p.trim()))
}

/// Read a secrets file into `secrets`
///
/// Returns the number of entries applied. Lines without `=` or with an
/// invalid name are skipped.
pub async fn load(path: &Path, secrets: &mut Secrets) -> Result<usize> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        GatewayError::SecretsResolution(format!("failed to open {}: {}", path.display(), e))
    })?;

    let applied = apply(&content, secrets);
    debug!(path = %path.display(), applied, "Secrets file loaded");
    Ok(applied)
}

/// Apply `NAME=VALUE` lines to `secrets`, later lines overriding earlier ones
pub fn apply(content: &str, secrets: &mut Secrets) -> usize {
    let mut applied = 0;
    for (name, value) in content.lines().filter_map(parse_line) {
        secrets.set(name, value);
        applied += 1;
    }
    applied
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (name, value) = line.split_once('=')?;
    is_valid_name(name).then_some((name, value))
}

/// True iff `name` is non-empty and made only of `A-Z` and `_`
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_uppercase() || c == '_')
}
