//! Lazy, restartable listings
//!
//! A [`Listing`] fetches nothing until polled and follows the continuation
//! marker one page at a time, so a caller that stops early never pays for
//! the remaining pages. Each call to [`Listing::pages`] starts over from the
//! first page.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::errors::Result;
use crate::storage::{BlobTransport, ListRequest, ListSegment};

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Listing of one container, optionally filtered by prefix and rolled up by delimiter
#[derive(Clone)]
pub struct Listing {
    transport: Arc<dyn BlobTransport>,
    container: String,
    request: ListRequest,
}

impl Listing {
    pub(crate) fn new(
        transport: Arc<dyn BlobTransport>,
        container: &str,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Self {
        Self {
            transport,
            container: container.to_string(),
            request: ListRequest {
                prefix: prefix.filter(|p| !p.is_empty()).map(str::to_string),
                delimiter: delimiter.filter(|d| !d.is_empty()).map(str::to_string),
                ..Default::default()
            },
        }
    }

    /// Pages in server order; ends after the page without a continuation marker
    pub fn pages(&self) -> BoxStream<'static, Result<ListSegment>> {
        let listing = self.clone();
        stream::try_unfold(Cursor::Start, move |cursor| {
            let listing = listing.clone();
            async move {
                let marker = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::Start => None,
                    Cursor::Next(marker) => Some(marker),
                };
                let request = ListRequest {
                    marker,
                    ..listing.request.clone()
                };
                let segment = listing
                    .transport
                    .list_segment(&listing.container, &request)
                    .await?;
                let next = match &segment.next_marker {
                    Some(marker) => Cursor::Next(marker.clone()),
                    None => Cursor::Done,
                };
                Ok(Some((segment, next)))
            }
        })
        .boxed()
    }

    /// Blob names across all pages
    pub fn objects(&self) -> BoxStream<'static, Result<String>> {
        self.pages()
            .map_ok(|segment| stream::iter(segment.blobs.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    /// Rolled-up prefixes across all pages
    pub fn prefixes(&self) -> BoxStream<'static, Result<String>> {
        self.pages()
            .map_ok(|segment| stream::iter(segment.prefixes.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }
}
