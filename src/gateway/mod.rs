//! Blob gateway
//!
//! Ties configuration, secrets, encryption, credential and endpoint together
//! behind the host-facing operations: put, exists, get, list, list common
//! prefixes, delete and signed URLs.

mod listing;
mod reader;

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use futures::stream::TryStreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::config::{ConfigMap, PluginConfig, DEFAULT_BLOCK_SIZE};
use crate::credential::{Credential, CredentialFactory, RefreshPolicy};
use crate::encryption::EncryptionOptions;
use crate::errors::{GatewayError, Result};
use crate::metrics;
use crate::secrets::{self, Secrets};
use crate::storage::sas::{self, SasWindow};
use crate::storage::{AzureConnector, BlobTransport, Connector, Endpoint, ObjectDescriptor};

pub use listing::Listing;
pub use reader::{ObjectReader, ReaderOptions};

/// Everything built by a successful `init`
struct GatewayState {
    endpoint: Endpoint,
    credential: Arc<Credential>,
    encryption: EncryptionOptions,
    transport: Arc<dyn BlobTransport>,
    block_size: usize,
}

/// Object-store gateway over one storage account
pub struct BlobGateway {
    connector: Arc<dyn Connector>,
    /// Fixed secrets context; the process environment is read at `init` when absent
    environment: Option<Secrets>,
    refresh_policy: RefreshPolicy,
    reader_options: ReaderOptions,
    state: Option<GatewayState>,
}

impl Default for BlobGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobGateway {
    /// Uninitialized gateway talking to the real blob service
    pub fn new() -> Self {
        Self {
            connector: Arc::new(AzureConnector::new()),
            environment: None,
            refresh_policy: RefreshPolicy::default(),
            reader_options: ReaderOptions::default(),
            state: None,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Use `secrets` instead of the process environment
    pub fn with_environment(mut self, secrets: Secrets) -> Self {
        self.environment = Some(secrets);
        self
    }

    pub fn with_refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    pub fn with_reader_options(mut self, options: ReaderOptions) -> Self {
        self.reader_options = options;
        self
    }

    /// Gateway over an already built endpoint, credential and encryption context
    pub fn from_parts(
        connector: Arc<dyn Connector>,
        endpoint: Endpoint,
        credential: Credential,
        encryption: EncryptionOptions,
    ) -> Result<Self> {
        let credential = Arc::new(credential);
        let transport = connector.connect(&endpoint, credential.clone())?;
        Ok(Self {
            connector,
            environment: None,
            refresh_policy: RefreshPolicy::default(),
            reader_options: ReaderOptions::default(),
            state: Some(GatewayState {
                endpoint,
                credential,
                encryption,
                transport,
                block_size: DEFAULT_BLOCK_SIZE,
            }),
        })
    }

    /// Validate `config`, resolve secrets and build the connection
    ///
    /// May be called again; the previous state is replaced only once the new
    /// one is fully built, and its refresh task is stopped.
    #[instrument(skip(self, config))]
    pub async fn init(&mut self, config: &ConfigMap) -> Result<()> {
        let config = PluginConfig::from_map(config)?;
        info!(account = %config.storage_account, "Initializing blob gateway");

        let mut secrets = match &self.environment {
            Some(secrets) => secrets.clone(),
            None => Secrets::from_env(),
        };
        match secrets::resolve(config.credentials_file.as_deref(), &secrets) {
            Some(path) => {
                secrets::load(&path, &mut secrets).await?;
            }
            None => info!("No secrets file configured, using environment only"),
        }

        let encryption = EncryptionOptions::from_secrets(&secrets);
        let credential = CredentialFactory::new(&config, &secrets)
            .with_refresh_policy(self.refresh_policy)
            .build()
            .await?;
        let credential = Arc::new(credential);
        let endpoint = Endpoint::from_secrets(&config.storage_account, &secrets)?;
        let transport = self.connector.connect(&endpoint, credential.clone())?;

        info!(
            endpoint = %endpoint.url(),
            credential = credential.kind(),
            customer_provided_key = encryption.is_set(),
            block_size = config.block_size,
            "Blob gateway initialized"
        );

        let previous = self.state.replace(GatewayState {
            endpoint,
            credential,
            encryption,
            transport,
            block_size: config.block_size,
        });
        if let Some(previous) = previous {
            previous.credential.shutdown();
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.state.as_ref().map(|s| &s.endpoint)
    }

    /// Shared credential in use, for inspection and token subscriptions
    pub fn credential(&self) -> Option<&Arc<Credential>> {
        self.state.as_ref().map(|s| &s.credential)
    }

    fn state(&self) -> Result<&GatewayState> {
        self.state.as_ref().ok_or(GatewayError::NotInitialized)
    }

    fn target(&self, container: &str, key: &str) -> Result<(&GatewayState, ObjectDescriptor)> {
        Ok((self.state()?, ObjectDescriptor::checked(container, key)?))
    }

    /// Upload `body` in blocks and commit them as one blob; returns the bytes written
    #[instrument(skip(self, body))]
    pub async fn put_object<R>(&self, container: &str, key: &str, body: R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        info!(container = %container, key = %key, "PutObject request");
        let started = Instant::now();
        let result = self.upload(container, key, body).await;
        metrics::observe("put_object", started, &result);

        match &result {
            Ok(size) => info!(container = %container, key = %key, size, "Object uploaded"),
            Err(e) => error!(error = %e, "Upload failed"),
        }
        result
    }

    async fn upload<R>(&self, container: &str, key: &str, mut body: R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (state, object) = self.target(container, key)?;
        let upload_id = Uuid::new_v4().simple().to_string();

        let mut block_ids = Vec::new();
        let mut total = 0u64;
        loop {
            let mut block = Vec::new();
            let read = (&mut body)
                .take(state.block_size as u64)
                .read_to_end(&mut block)
                .await
                .map_err(|e| GatewayError::transport(key, format!("reading upload body: {}", e)))?;
            if read == 0 {
                break;
            }

            let block_id = block_id(&upload_id, block_ids.len());
            state
                .transport
                .put_block(&object, &block_id, Bytes::from(block), &state.encryption)
                .await?;
            block_ids.push(block_id);
            total += read as u64;

            if read < state.block_size {
                break;
            }
        }

        state
            .transport
            .put_block_list(&object, &block_ids, &state.encryption)
            .await?;
        Ok(total)
    }

    /// `Ok(false)` only when the service reports the blob as not found
    #[instrument(skip(self))]
    pub async fn object_exists(&self, container: &str, key: &str) -> Result<bool> {
        info!(container = %container, key = %key, "ObjectExists request");
        let started = Instant::now();
        let result = self.exists(container, key).await;
        metrics::observe("object_exists", started, &result);

        if let Err(e) = &result {
            error!(error = %e, "Storage exists check failed");
        }
        result
    }

    async fn exists(&self, container: &str, key: &str) -> Result<bool> {
        let (state, object) = self.target(container, key)?;
        match state.transport.get_properties(&object, &state.encryption).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Open a streaming reader; a missing blob is an error here
    #[instrument(skip(self))]
    pub async fn get_object(&self, container: &str, key: &str) -> Result<ObjectReader> {
        info!(container = %container, key = %key, "GetObject request");
        let started = Instant::now();
        let result = match self.target(container, key) {
            Ok((state, object)) => {
                ObjectReader::open(
                    state.transport.clone(),
                    object,
                    state.encryption.clone(),
                    self.reader_options,
                )
                .await
            }
            Err(e) => Err(e),
        };
        metrics::observe("get_object", started, &result);

        if let Err(e) = &result {
            error!(error = %e, "Storage get failed");
        }
        result
    }

    /// Lazy listing of blob names under `prefix`
    pub fn objects(&self, container: &str, prefix: Option<&str>) -> Result<Listing> {
        let state = self.state()?;
        Ok(Listing::new(state.transport.clone(), container, prefix, None))
    }

    /// All blob names under `prefix`, in server order
    #[instrument(skip(self))]
    pub async fn list_objects(&self, container: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        info!(container = %container, prefix = ?prefix, "ListObjects request");
        let started = Instant::now();
        let result = match self.objects(container, prefix) {
            Ok(listing) => listing.objects().try_collect::<Vec<_>>().await,
            Err(e) => Err(e),
        };
        metrics::observe("list_objects", started, &result);

        if let Err(e) = &result {
            error!(error = %e, "Storage list failed");
        }
        result
    }

    /// Distinct prefixes one `delimiter` level below `prefix`
    ///
    /// Deployments that do not support delimiter listings yield an empty list.
    #[instrument(skip(self))]
    pub async fn list_common_prefixes(
        &self,
        container: &str,
        prefix: Option<&str>,
        delimiter: &str,
    ) -> Result<Vec<String>> {
        info!(container = %container, prefix = ?prefix, delimiter = %delimiter, "ListCommonPrefixes request");
        let started = Instant::now();
        let result = match self.state() {
            Ok(state) => {
                let listing = Listing::new(state.transport.clone(), container, prefix, Some(delimiter));
                match listing.prefixes().try_collect::<Vec<_>>().await {
                    Err(e) if e.is_unsupported() => {
                        warn!(error = %e, "Delimiter listing unsupported, reporting no prefixes");
                        Ok(Vec::new())
                    }
                    other => other,
                }
            }
            Err(e) => Err(e),
        };
        metrics::observe("list_common_prefixes", started, &result);

        if let Err(e) = &result {
            error!(error = %e, "Storage prefix list failed");
        }
        result
    }

    /// Delete a blob and its snapshots
    #[instrument(skip(self))]
    pub async fn delete_object(&self, container: &str, key: &str) -> Result<()> {
        info!(container = %container, key = %key, "DeleteObject request");
        let started = Instant::now();
        let result = match self.target(container, key) {
            Ok((state, object)) => state.transport.delete(&object).await,
            Err(e) => Err(e),
        };
        metrics::observe("delete_object", started, &result);

        if let Err(e) = &result {
            error!(error = %e, "Storage delete failed");
        }
        result
    }

    /// Read-only URL for one blob, valid from now until now + `ttl`
    ///
    /// A zero `ttl` yields a URL that is already expired.
    #[instrument(skip(self))]
    pub fn create_signed_url(&self, container: &str, key: &str, ttl: Duration) -> Result<Url> {
        let started = Instant::now();
        let result = self.sign(container, key, ttl);
        metrics::observe("create_signed_url", started, &result);

        if let Err(e) = &result {
            error!(error = %e, "Signed URL creation failed");
        }
        result
    }

    fn sign(&self, container: &str, key: &str, ttl: Duration) -> Result<Url> {
        let state = self.state()?;
        let Credential::SharedKey(shared_key) = state.credential.as_ref() else {
            return Err(GatewayError::Credential(
                "signed URLs require a shared key credential".to_string(),
            ));
        };
        let out_of_range =
            || GatewayError::ConfigValidation(format!("signed URL ttl {:?} out of range", ttl));
        let delta = chrono::Duration::from_std(ttl).map_err(|_| out_of_range())?;

        let start = Utc::now().trunc_subsecs(0);
        let expiry = start.checked_add_signed(delta).ok_or_else(out_of_range)?;
        sas::signed_blob_url(
            &state.endpoint,
            shared_key,
            &ObjectDescriptor::checked(container, key)?,
            SasWindow { start, expiry },
        )
    }

    /// Drop the connection and stop background token refresh
    pub fn shutdown(&mut self) {
        if let Some(state) = self.state.take() {
            state.credential.shutdown();
            info!("Blob gateway shut down");
        }
    }
}

/// Block ids must have equal length within a blob
fn block_id(upload_id: &str, index: usize) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{}-{:08}", upload_id, index))
}
