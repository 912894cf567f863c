//! In-memory blob transport for tests

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http::StatusCode;

use crate::credential::Credential;
use crate::encryption::EncryptionOptions;
use crate::errors::{GatewayError, Result};

use super::{
    BlobProperties, BlobTransport, Connector, Download, DownloadRequest, Endpoint, ListRequest,
    ListSegment, ObjectDescriptor,
};

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    etag: String,
}

#[derive(Debug, Default)]
struct Inner {
    blobs: BTreeMap<ObjectDescriptor, StoredBlob>,
    staged: HashMap<ObjectDescriptor, HashMap<String, Bytes>>,
    fail_next: Option<(StatusCode, Option<String>)>,
    interrupt_after: Option<usize>,
    /// (operation, customer-provided key attached)
    encryption_log: Vec<(&'static str, bool)>,
    list_calls: usize,
}

/// Block blob store behind a mutex
#[derive(Debug)]
pub(crate) struct MemoryTransport {
    inner: Mutex<Inner>,
    etags: AtomicU64,
    page_size: usize,
    chunk_size: usize,
    delimiter_unsupported: bool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            inner: Mutex::default(),
            etags: AtomicU64::new(1),
            page_size: 5000,
            chunk_size: 1024,
            delimiter_unsupported: false,
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Reject delimiter listings the way some emulators do
    pub fn without_delimiter_support(mut self) -> Self {
        self.delimiter_unsupported = true;
        self
    }

    /// Fail the next call with this status and service code
    pub fn fail_next(&self, status: StatusCode, code: Option<&str>) {
        self.lock().fail_next = Some((status, code.map(str::to_string)));
    }

    /// Break the next download stream after `bytes` bytes
    pub fn interrupt_next_download(&self, bytes: usize) {
        self.lock().interrupt_after = Some(bytes);
    }

    pub fn insert(&self, container: &str, key: &str, data: impl Into<Bytes>) {
        let etag = self.next_etag();
        self.lock().blobs.insert(
            ObjectDescriptor::new(container, key),
            StoredBlob {
                data: data.into(),
                etag,
            },
        );
    }

    pub fn contents(&self, container: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .blobs
            .get(&ObjectDescriptor::new(container, key))
            .map(|b| b.data.clone())
    }

    pub fn staged_blocks(&self, container: &str, key: &str) -> usize {
        self.lock()
            .staged
            .get(&ObjectDescriptor::new(container, key))
            .map_or(0, HashMap::len)
    }

    pub fn encryption_log(&self) -> Vec<(&'static str, bool)> {
        self.lock().encryption_log.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn next_etag(&self) -> String {
        format!("\"0x{:X}\"", self.etags.fetch_add(1, Ordering::Relaxed))
    }

    /// Consume an injected failure, recording the encryption state
    fn enter(&self, key: &str, operation: &'static str, encryption: Option<&EncryptionOptions>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(encryption) = encryption {
            inner.encryption_log.push((operation, encryption.is_set()));
        }
        match inner.fail_next.take() {
            Some((status, code)) => Err(GatewayError::remote(key, status, code, "injected failure")),
            None => Ok(()),
        }
    }

    fn not_found(key: &str) -> GatewayError {
        GatewayError::remote(
            key,
            StatusCode::NOT_FOUND,
            Some("BlobNotFound".into()),
            "The specified blob does not exist.",
        )
    }
}

#[async_trait]
impl BlobTransport for MemoryTransport {
    async fn put_block(
        &self,
        object: &ObjectDescriptor,
        block_id: &str,
        data: Bytes,
        encryption: &EncryptionOptions,
    ) -> Result<()> {
        self.enter(&object.key, "put_block", Some(encryption))?;
        self.lock()
            .staged
            .entry(object.clone())
            .or_default()
            .insert(block_id.to_string(), data);
        Ok(())
    }

    async fn put_block_list(
        &self,
        object: &ObjectDescriptor,
        block_ids: &[String],
        encryption: &EncryptionOptions,
    ) -> Result<()> {
        self.enter(&object.key, "put_block_list", Some(encryption))?;
        let etag = self.next_etag();
        let mut inner = self.lock();

        let staged = inner.staged.remove(object).unwrap_or_default();
        let mut data = Vec::new();
        for id in block_ids {
            let block = staged.get(id).ok_or_else(|| {
                GatewayError::remote(
                    &object.key,
                    StatusCode::BAD_REQUEST,
                    Some("InvalidBlockList".into()),
                    "The specified block list is invalid.",
                )
            })?;
            data.extend_from_slice(block);
        }
        inner.blobs.insert(
            object.clone(),
            StoredBlob {
                data: Bytes::from(data),
                etag,
            },
        );
        Ok(())
    }

    async fn get_properties(
        &self,
        object: &ObjectDescriptor,
        encryption: &EncryptionOptions,
    ) -> Result<BlobProperties> {
        self.enter(&object.key, "get_properties", Some(encryption))?;
        let inner = self.lock();
        let blob = inner.blobs.get(object).ok_or_else(|| Self::not_found(&object.key))?;
        Ok(BlobProperties {
            content_length: blob.data.len() as u64,
            etag: Some(blob.etag.clone()),
            last_modified: None,
        })
    }

    async fn download(
        &self,
        object: &ObjectDescriptor,
        request: &DownloadRequest,
        encryption: &EncryptionOptions,
    ) -> Result<Download> {
        self.enter(&object.key, "download", Some(encryption))?;
        let mut inner = self.lock();
        let blob = inner
            .blobs
            .get(object)
            .cloned()
            .ok_or_else(|| Self::not_found(&object.key))?;

        if let Some(expected) = &request.if_match {
            if *expected != blob.etag {
                return Err(GatewayError::remote(
                    &object.key,
                    StatusCode::PRECONDITION_FAILED,
                    Some("ConditionNotMet".into()),
                    "The condition specified using HTTP conditional header(s) is not met.",
                ));
            }
        }

        // ranged reads are only sent past the first byte
        if request.offset > 0 && request.offset >= blob.data.len() as u64 {
            return Err(GatewayError::remote(
                &object.key,
                StatusCode::RANGE_NOT_SATISFIABLE,
                Some("InvalidRange".into()),
                "The range specified is invalid for the current size of the resource.",
            ));
        }

        let offset = request.offset as usize;
        let remaining = blob.data.slice(offset..);
        let interrupt = inner.interrupt_after.take();

        let (served, tail) = match interrupt {
            Some(limit) if limit <= remaining.len() => (
                remaining.slice(..limit),
                Some(GatewayError::transport(&object.key, "connection reset by peer")),
            ),
            _ => (remaining.clone(), None),
        };

        let mut chunks: Vec<Result<Bytes>> = served
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        chunks.extend(tail.map(Err));

        Ok(Download {
            body: stream::iter(chunks).boxed(),
            etag: Some(blob.etag),
            content_length: Some(remaining.len() as u64),
        })
    }

    async fn list_segment(&self, container: &str, request: &ListRequest) -> Result<ListSegment> {
        self.enter(container, "list", None)?;
        let mut inner = self.lock();
        inner.list_calls += 1;

        if request.delimiter.is_some() && self.delimiter_unsupported {
            return Err(GatewayError::remote(
                container,
                StatusCode::NOT_IMPLEMENTED,
                Some("FeatureNotSupported".into()),
                "delimiter listings are not supported",
            ));
        }

        let prefix = request.prefix.as_deref().unwrap_or("");
        // (name, is_prefix) in name order
        let mut entries: BTreeSet<(String, bool)> = BTreeSet::new();
        for object in inner.blobs.keys().filter(|o| o.container == container) {
            let Some(rest) = object.key.strip_prefix(prefix) else {
                continue;
            };
            match request.delimiter.as_deref().and_then(|d| rest.find(d).map(|i| (d, i))) {
                Some((delimiter, idx)) => {
                    let rolled = format!("{}{}", prefix, &rest[..idx + delimiter.len()]);
                    entries.insert((rolled, true));
                }
                None => {
                    entries.insert((object.key.clone(), false));
                }
            }
        }

        let page_size = request
            .max_results
            .map_or(self.page_size, |m| (m as usize).min(self.page_size));
        let marker = request.marker.as_deref().unwrap_or("");
        let mut pending = entries.into_iter().filter(|(name, _)| name.as_str() > marker);

        let mut segment = ListSegment::default();
        let mut last = None;
        for (name, is_prefix) in pending.by_ref().take(page_size) {
            last = Some(name.clone());
            if is_prefix {
                segment.prefixes.push(name);
            } else {
                segment.blobs.push(name);
            }
        }
        if pending.next().is_some() {
            segment.next_marker = last;
        }
        Ok(segment)
    }

    async fn delete(&self, object: &ObjectDescriptor) -> Result<()> {
        self.enter(&object.key, "delete", None)?;
        match self.lock().blobs.remove(object) {
            Some(_) => Ok(()),
            None => Err(Self::not_found(&object.key)),
        }
    }
}

/// Hands out one shared [`MemoryTransport`] and records every connect
#[derive(Debug, Default)]
pub(crate) struct MemoryConnector {
    pub transport: Arc<MemoryTransport>,
    connections: Mutex<Vec<(String, &'static str)>>,
}

impl MemoryConnector {
    pub fn new(transport: MemoryTransport) -> Self {
        Self {
            transport: Arc::new(transport),
            connections: Mutex::default(),
        }
    }

    /// (endpoint url, credential kind) per connect call
    pub fn connections(&self) -> Vec<(String, &'static str)> {
        self.connections.lock().unwrap().clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, endpoint: &Endpoint, credential: Arc<Credential>) -> Result<Arc<dyn BlobTransport>> {
        self.connections
            .lock()
            .unwrap()
            .push((endpoint.url().to_string(), credential.kind()));
        Ok(self.transport.clone())
    }
}
