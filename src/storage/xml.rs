//! Blob service XML payloads
//!
//! List Blobs responses, Put Block List requests and error bodies.

use quick_xml::de::from_str;
use quick_xml::se::to_string;
use serde::{Deserialize, Serialize};

use super::ListSegment;

/// List Blobs response
#[derive(Debug, Deserialize)]
#[serde(rename = "EnumerationResults", rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "$value", default)]
    items: Vec<BlobListItem>,
}

/// Blobs and virtual directories are interleaved in document order
#[derive(Debug, Deserialize)]
enum BlobListItem {
    Blob(NamedEntry),
    BlobPrefix(NamedEntry),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NamedEntry {
    name: String,
}

/// Put Block List request body
#[derive(Debug, Serialize)]
#[serde(rename = "BlockList")]
struct BlockList<'a> {
    #[serde(rename = "Latest")]
    latest: &'a [String],
}

/// Service error body
#[derive(Debug, Default, Deserialize)]
#[serde(rename = "Error", rename_all = "PascalCase")]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

fn strip_bom(body: &str) -> &str {
    body.trim_start_matches('\u{feff}')
}

/// Parse one List Blobs page
pub(crate) fn parse_list_segment(body: &str) -> Result<ListSegment, quick_xml::DeError> {
    let results: EnumerationResults = from_str(strip_bom(body))?;

    let mut segment = ListSegment::default();
    for item in results.blobs.items {
        match item {
            BlobListItem::Blob(entry) => segment.blobs.push(entry.name),
            BlobListItem::BlobPrefix(entry) => segment.prefixes.push(entry.name),
        }
    }
    segment.next_marker = results.next_marker.filter(|m| !m.is_empty());
    Ok(segment)
}

/// Serialize the ordered block ids of a Put Block List call
pub(crate) fn block_list_xml(block_ids: &[String]) -> Result<String, quick_xml::DeError> {
    Ok(format!(
        r#"<?xml version="1.0" encoding="utf-8"?>{}"#,
        to_string(&BlockList { latest: block_ids })?
    ))
}

/// Best-effort parse of an error body; unparseable bodies yield nothing
pub(crate) fn parse_error(body: &str) -> ErrorBody {
    from_str(strip_bom(body)).unwrap_or_default()
}
