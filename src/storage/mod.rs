//! Blob transport abstraction layer
//!
//! The gateway talks to the blob service through the [`BlobTransport`]
//! trait: one method per REST primitive (stage block, commit block list,
//! properties, download, list segment, delete). The production
//! implementation speaks the Azure Blob REST API over `reqwest`; tests
//! plug in an in-memory store.

mod azure;
mod endpoint;
#[cfg(test)]
pub(crate) mod memory;
pub mod sas;
mod xml;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::credential::Credential;
use crate::encryption::EncryptionOptions;
use crate::errors::{GatewayError, Result};

pub use azure::{AzureBlobTransport, AzureConnector, API_VERSION};
pub use endpoint::{normalize_domain, Endpoint, DEFAULT_BLOB_DOMAIN};

/// A blob inside a container
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectDescriptor {
    pub container: String,
    pub key: String,
}

impl ObjectDescriptor {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }

    /// Like [`ObjectDescriptor::new`], rejecting names that do not map to a
    /// single blob path
    pub fn checked(container: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let object = Self::new(container, key);
        object.validate()?;
        Ok(object)
    }

    /// URL path normalization would drop `.` and `..` segments and address a
    /// different blob, so they are refused
    pub fn validate(&self) -> Result<()> {
        let is_dot = |segment: &str| segment == "." || segment == "..";
        if is_dot(&self.container) || self.key.split('/').any(is_dot) {
            return Err(GatewayError::InvalidObjectKey(format!("{}/{}", self.container, self.key)));
        }
        Ok(())
    }
}

/// Parameters for one List Blobs call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub prefix: Option<String>,
    /// Roll names up to the next occurrence of this delimiter
    pub delimiter: Option<String>,
    /// Continuation marker returned by the previous page
    pub marker: Option<String>,
    pub max_results: Option<u32>,
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSegment {
    pub blobs: Vec<String>,
    pub prefixes: Vec<String>,
    /// Absent or empty when the listing is exhausted
    pub next_marker: Option<String>,
}

/// Blob metadata returned by a properties call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobProperties {
    pub content_length: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Parameters for a (possibly resumed) download
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadRequest {
    /// First byte to read
    pub offset: u64,
    /// Fail instead of reading a blob that changed since the first read
    pub if_match: Option<String>,
}

/// Open download body
pub struct Download {
    pub body: BoxStream<'static, Result<Bytes>>,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
}

/// Blob service primitives used by the gateway
///
/// Errors are `GatewayError::StorageService` carrying the object key (the
/// container for listings).
#[async_trait]
pub trait BlobTransport: Send + Sync {
    /// Stage one block of a block blob
    async fn put_block(
        &self,
        object: &ObjectDescriptor,
        block_id: &str,
        data: Bytes,
        encryption: &EncryptionOptions,
    ) -> Result<()>;

    /// Commit staged blocks, in order, as the blob's content
    async fn put_block_list(
        &self,
        object: &ObjectDescriptor,
        block_ids: &[String],
        encryption: &EncryptionOptions,
    ) -> Result<()>;

    /// Get blob properties (HEAD)
    async fn get_properties(
        &self,
        object: &ObjectDescriptor,
        encryption: &EncryptionOptions,
    ) -> Result<BlobProperties>;

    /// Open a streaming read starting at `request.offset`
    async fn download(
        &self,
        object: &ObjectDescriptor,
        request: &DownloadRequest,
        encryption: &EncryptionOptions,
    ) -> Result<Download>;

    /// Fetch one page of a listing
    async fn list_segment(&self, container: &str, request: &ListRequest) -> Result<ListSegment>;

    /// Delete a blob together with its snapshots
    async fn delete(&self, object: &ObjectDescriptor) -> Result<()>;
}

/// Builds the transport once endpoint and credential are known
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint, credential: Arc<Credential>) -> Result<Arc<dyn BlobTransport>>;
}
