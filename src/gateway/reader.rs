//! Streaming object reader with mid-stream resume
//!
//! When the body fails after the blob was opened, the reader re-issues a
//! ranged read from the last delivered byte, conditioned on the ETag seen
//! at open so a blob replaced in the meantime fails instead of splicing two
//! versions together.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::encryption::EncryptionOptions;
use crate::errors::Result;
use crate::storage::{BlobTransport, DownloadRequest, ObjectDescriptor};

/// Resume behavior of an [`ObjectReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Consecutive resumes allowed without receiving any data
    pub max_retries: u32,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

struct ReadState {
    transport: Arc<dyn BlobTransport>,
    object: ObjectDescriptor,
    encryption: EncryptionOptions,
    options: ReaderOptions,
    body: Option<BoxStream<'static, Result<Bytes>>>,
    offset: u64,
    etag: Option<String>,
    /// Blob size seen at open
    content_length: Option<u64>,
    failures: u32,
}

impl ReadState {
    fn is_complete(&self) -> bool {
        self.content_length == Some(self.offset)
    }

    async fn next_chunk(mut self) -> Result<Option<(Bytes, Self)>> {
        loop {
            let next = match self.body.as_mut() {
                Some(body) => body.next().await,
                None => {
                    let request = DownloadRequest {
                        offset: self.offset,
                        if_match: self.etag.clone(),
                    };
                    let download = self
                        .transport
                        .download(&self.object, &request, &self.encryption)
                        .await?;
                    self.body = Some(download.body);
                    continue;
                }
            };

            match next {
                Some(Ok(chunk)) => {
                    self.offset += chunk.len() as u64;
                    if !chunk.is_empty() {
                        self.failures = 0;
                    }
                    return Ok(Some((chunk, self)));
                }
                None => return Ok(None),
                // a range starting at the end of the blob is rejected
                Some(Err(err)) if self.is_complete() => {
                    debug!(
                        key = %self.object.key,
                        offset = self.offset,
                        error = %err,
                        "Object body failed after the last byte, ending stream"
                    );
                    return Ok(None);
                }
                Some(Err(err)) if self.failures < self.options.max_retries => {
                    self.failures += 1;
                    warn!(
                        container = %self.object.container,
                        key = %self.object.key,
                        offset = self.offset,
                        attempt = self.failures,
                        error = %err,
                        "Object body interrupted, resuming"
                    );
                    self.body = None;
                }
                Some(Err(err)) => return Err(err),
            }
        }
    }
}

/// Byte stream over one blob
pub struct ObjectReader {
    inner: BoxStream<'static, Result<Bytes>>,
    etag: Option<String>,
    content_length: Option<u64>,
}

impl ObjectReader {
    /// Open the blob; a missing blob fails here rather than on first read
    pub(crate) async fn open(
        transport: Arc<dyn BlobTransport>,
        object: ObjectDescriptor,
        encryption: EncryptionOptions,
        options: ReaderOptions,
    ) -> Result<Self> {
        let download = transport
            .download(&object, &DownloadRequest::default(), &encryption)
            .await?;
        let etag = download.etag.clone();
        let content_length = download.content_length;

        let state = ReadState {
            transport,
            object,
            encryption,
            options,
            body: Some(download.body),
            offset: 0,
            etag: download.etag,
            content_length,
            failures: 0,
        };
        let inner = stream::try_unfold(state, ReadState::next_chunk).boxed();

        Ok(Self {
            inner,
            etag,
            content_length,
        })
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Size reported when the blob was opened
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Adapt to `tokio::io::AsyncRead`
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(self.map_err(|e| io::Error::new(io::ErrorKind::Other, e)))
    }

    /// Buffer the whole object
    pub async fn read_all(self) -> Result<Bytes> {
        let capacity = self.content_length.unwrap_or(0).min(usize::MAX as u64) as usize;
        let buffer = self
            .try_fold(BytesMut::with_capacity(capacity), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;
        Ok(buffer.freeze())
    }
}

impl Stream for ObjectReader {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
