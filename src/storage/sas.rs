//! Service shared access signatures
//!
//! A signed URL grants read access to exactly one blob until its expiry.
//! It is signed with the account key, so only the shared-key credential
//! can produce one.

use chrono::{DateTime, SecondsFormat, Utc};
use url::Url;

use crate::credential::SharedKeyCredential;
use crate::errors::Result;

use super::{Endpoint, ObjectDescriptor, API_VERSION};

const READ_PERMISSION: &str = "r";
const BLOB_RESOURCE: &str = "b";

/// Validity window of a signed URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SasWindow {
    pub start: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Plain-HTTP endpoints (emulators) also allow http
fn protocol(endpoint: &Endpoint) -> &'static str {
    if endpoint.url().scheme() == "https" {
        "https"
    } else {
        "https,http"
    }
}

/// Service SAS string-to-sign for a blob resource
pub(crate) fn string_to_sign(
    account: &str,
    object: &ObjectDescriptor,
    window: &SasWindow,
    protocol: &str,
) -> String {
    let resource = format!("/blob/{}/{}/{}", account, object.container, object.key);
    let start = format_time(window.start);
    let expiry = format_time(window.expiry);
    [
        READ_PERMISSION,
        start.as_str(),
        expiry.as_str(),
        resource.as_str(),
        "", // signed identifier
        "", // signed ip
        protocol,
        API_VERSION,
        BLOB_RESOURCE,
        "", // snapshot time
        "", // encryption scope
        "", // cache-control
        "", // content-disposition
        "", // content-encoding
        "", // content-language
        "", // content-type
    ]
    .join("\n")
}

/// Read-only URL for one blob, valid within `window`
pub fn signed_blob_url(
    endpoint: &Endpoint,
    credential: &SharedKeyCredential,
    object: &ObjectDescriptor,
    window: SasWindow,
) -> Result<Url> {
    let mut url = endpoint.blob_url(object)?;
    let protocol = protocol(endpoint);
    let signature = credential.sign(&string_to_sign(
        credential.account(),
        object,
        &window,
        protocol,
    ))?;

    url.query_pairs_mut()
        .append_pair("sv", API_VERSION)
        .append_pair("st", &format_time(window.start))
        .append_pair("se", &format_time(window.expiry))
        .append_pair("sr", BLOB_RESOURCE)
        .append_pair("sp", READ_PERMISSION)
        .append_pair("spr", protocol)
        .append_pair("sig", &signature);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GatewayError;
    use chrono::TimeZone;
    use std::collections::HashMap;

    const KEY: &str = "a2V5LWZvci10ZXN0aW5nLW9ubHk=";

    fn window() -> SasWindow {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        SasWindow {
            start,
            expiry: start + chrono::Duration::minutes(15),
        }
    }

    #[test]
    fn test_string_to_sign_fields() {
        let object = ObjectDescriptor::new("backups", "nightly/a.tar");
        let text = string_to_sign("acct", &object, &window(), "https");
        let fields: Vec<&str> = text.split('\n').collect();

        assert_eq!(fields.len(), 16);
        assert_eq!(fields[0], "r");
        assert_eq!(fields[1], "2024-03-01T12:00:00Z");
        assert_eq!(fields[2], "2024-03-01T12:15:00Z");
        assert_eq!(fields[3], "/blob/acct/backups/nightly/a.tar");
        assert_eq!(fields[6], "https");
        assert_eq!(fields[7], API_VERSION);
        assert_eq!(fields[8], "b");
    }

    #[test]
    fn test_signed_url_query() {
        let endpoint = Endpoint::for_account("acct", None).unwrap();
        let credential = SharedKeyCredential::new("acct", KEY).unwrap();
        let object = ObjectDescriptor::new("backups", "nightly/a.tar");

        let url = signed_blob_url(&endpoint, &credential, &object, window()).unwrap();
        assert_eq!(url.path(), "/backups/nightly/a.tar");

        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(query["se"], "2024-03-01T12:15:00Z");
        assert_eq!(query["sp"], "r");
        assert_eq!(query["sr"], "b");
        assert_eq!(query["spr"], "https");

        let expected = credential
            .sign(&string_to_sign("acct", &object, &window(), "https"))
            .unwrap();
        assert_eq!(query["sig"], expected);
    }

    #[test]
    fn test_dot_segment_key_is_not_signed() {
        let endpoint = Endpoint::for_account("acct", None).unwrap();
        let credential = SharedKeyCredential::new("acct", KEY).unwrap();
        let err = signed_blob_url(&endpoint, &credential, &ObjectDescriptor::new("c", "x/../y"), window())
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidObjectKey(_)));
    }

    #[test]
    fn test_http_endpoint_allows_http() {
        let endpoint = Endpoint::custom("devstoreaccount1", "http://127.0.0.1:10000/devstoreaccount1").unwrap();
        let credential = SharedKeyCredential::new("devstoreaccount1", KEY).unwrap();
        let url = signed_blob_url(&endpoint, &credential, &ObjectDescriptor::new("c", "k"), window()).unwrap();
        assert!(url.query_pairs().any(|(k, v)| k == "spr" && v == "https,http"));
    }
}
