//! Azure Blob Storage object-store backend
//!
//! A [`BlobGateway`] exposes the small contract a backup orchestrator needs
//! from an object store (put, exists, get, list, list common prefixes,
//! delete, signed URLs) on top of one Azure storage account. Authentication
//! uses the account's shared key when it is configured and a managed
//! identity token, refreshed in the background, otherwise.

pub mod config;
pub mod credential;
pub mod encryption;
pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod secrets;
pub mod storage;

pub use config::{ConfigMap, PluginConfig};
pub use credential::{Credential, CredentialFactory};
pub use encryption::EncryptionOptions;
pub use errors::{GatewayError, Result};
pub use gateway::{BlobGateway, Listing, ObjectReader, ReaderOptions};
pub use secrets::Secrets;
pub use storage::{Endpoint, ObjectDescriptor};
