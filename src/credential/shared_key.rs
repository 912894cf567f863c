//! Shared Key authorization
//!
//! Implements the storage-account Shared Key scheme:
//! `Authorization: SharedKey {account}:{signature}` where the signature is
//! the base64 HMAC-SHA256, keyed by the decoded account key, of:
//!
//! ```text
//! VERB\n
//! Content-Encoding\n
//! Content-Language\n
//! Content-Length\n
//! Content-MD5\n
//! Content-Type\n
//! Date\n
//! If-Modified-Since\n
//! If-Match\n
//! If-None-Match\n
//! If-Unmodified-Since\n
//! Range\n
//! CanonicalizedHeaders
//! CanonicalizedResource
//! ```

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use sha2::Sha256;

use crate::errors::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

const SIGNED_STANDARD_HEADERS: [&str; 11] = [
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

/// Storage account name plus decoded access key
#[derive(Clone)]
pub struct SharedKeyCredential {
    account: String,
    key: Vec<u8>,
}

impl SharedKeyCredential {
    /// Build from the account name and the base64 access key
    pub fn new(account: &str, key: &str) -> Result<Self> {
        if account.trim().is_empty() {
            return Err(GatewayError::Credential(
                "storage account name must not be empty".to_string(),
            ));
        }

        let key = BASE64_STANDARD.decode(key.trim()).map_err(|e| {
            GatewayError::Credential(format!("storage account key is not valid base64: {}", e))
        })?;
        if key.is_empty() {
            return Err(GatewayError::Credential(
                "storage account key must not be empty".to_string(),
            ));
        }

        Ok(Self {
            account: account.trim().to_string(),
            key,
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Base64 HMAC-SHA256 of `payload` under the account key
    pub fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| GatewayError::Credential(format!("HMAC key error: {}", e)))?;
        mac.update(payload.as_bytes());
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Sign a fully built request in place
    pub fn authorize(&self, request: &mut reqwest::Request) -> Result<()> {
        let signature = self.sign(&string_to_sign(&self.account, request))?;
        let value = HeaderValue::from_str(&format!("SharedKey {}:{}", self.account, signature))
            .map_err(|e| GatewayError::Credential(format!("invalid authorization header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }
}

impl fmt::Debug for SharedKeyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKeyCredential")
            .field("account", &self.account)
            .field("key", &"<redacted>")
            .finish()
    }
}

pub(crate) fn string_to_sign(account: &str, request: &reqwest::Request) -> String {
    let headers = request.headers();
    let body_len = request.body().and_then(|b| b.as_bytes()).map(<[u8]>::len);

    let mut out = String::new();
    out.push_str(request.method().as_str());
    out.push('\n');

    for name in SIGNED_STANDARD_HEADERS {
        let value = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let value = if name == "content-length" {
            // zero length is signed as empty
            match value.or_else(|| body_len.map(|l| l.to_string())) {
                Some(len) if len != "0" => len,
                _ => String::new(),
            }
        } else {
            value.unwrap_or_default()
        };
        out.push_str(&value);
        out.push('\n');
    }

    let mut ms_headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if name.starts_with("x-ms-") {
            let value = value.to_str().unwrap_or_default().trim().to_string();
            ms_headers.insert(name, value);
        }
    }
    for (name, value) in &ms_headers {
        out.push_str(name);
        out.push(':');
        out.push_str(value);
        out.push('\n');
    }

    out.push_str(&canonicalized_resource(account, request.url()));
    out
}

fn canonicalized_resource(account: &str, url: &url::Url) -> String {
    let mut resource = format!("/{}{}", account, url.path());

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into_owned());
    }
    for (name, mut values) in params {
        values.sort();
        resource.push('\n');
        resource.push_str(&name);
        resource.push(':');
        resource.push_str(&values.join(","));
    }
    resource
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;

    const KEY: &str = "a2V5LWZvci10ZXN0aW5nLW9ubHk=";

    fn request(method: Method, url: &str) -> reqwest::Request {
        reqwest::Request::new(method, url::Url::parse(url).unwrap())
    }

    #[test]
    fn test_rejects_bad_key_and_account() {
        assert!(matches!(
            SharedKeyCredential::new("acct", "not base64!"),
            Err(GatewayError::Credential(_))
        ));
        assert!(matches!(
            SharedKeyCredential::new("", KEY),
            Err(GatewayError::Credential(_))
        ));
        assert!(matches!(
            SharedKeyCredential::new("acct", ""),
            Err(GatewayError::Credential(_))
        ));
    }

    #[test]
    fn test_string_to_sign_layout() {
        let mut req = request(
            Method::GET,
            "https://acct.blob.core.windows.net/backups?restype=container&comp=list&prefix=a%2Fb",
        );
        req.headers_mut()
            .insert("x-ms-version", HeaderValue::from_static("2021-08-06"));
        req.headers_mut().insert(
            "x-ms-date",
            HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT"),
        );

        let sts = string_to_sign("acct", &req);
        let expected = "GET\n\n\n\n\n\n\n\n\n\n\n\n\
                        x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
                        x-ms-version:2021-08-06\n\
                        /acct/backups\n\
                        comp:list\n\
                        prefix:a/b\n\
                        restype:container";
        assert_eq!(sts, expected);
    }

    #[test]
    fn test_content_length_from_body() {
        let mut req = request(Method::PUT, "https://acct.blob.core.windows.net/c/k?comp=block&blockid=QQ%3D%3D");
        *req.body_mut() = Some(reqwest::Body::from(vec![1u8, 2, 3]));
        let sts = string_to_sign("acct", &req);
        assert!(sts.starts_with("PUT\n\n\n3\n"));
        assert!(sts.ends_with("/acct/c/k\nblockid:QQ==\ncomp:block"));

        let mut empty = request(Method::PUT, "https://acct.blob.core.windows.net/c/k");
        *empty.body_mut() = Some(reqwest::Body::from(Vec::<u8>::new()));
        assert!(string_to_sign("acct", &empty).starts_with("PUT\n\n\n\n"));
    }

    #[test]
    fn test_authorize_sets_header() {
        let credential = SharedKeyCredential::new("acct", KEY).unwrap();
        let mut req = request(Method::HEAD, "https://acct.blob.core.windows.net/c/a.txt");
        credential.authorize(&mut req).unwrap();

        let expected_sig = {
            let mut mac = HmacSha256::new_from_slice(&BASE64_STANDARD.decode(KEY).unwrap()).unwrap();
            mac.update(string_to_sign("acct", &req).as_bytes());
            BASE64_STANDARD.encode(mac.finalize().into_bytes())
        };
        assert_eq!(
            req.headers().get(AUTHORIZATION).unwrap().to_str().unwrap(),
            format!("SharedKey acct:{}", expected_sig)
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let credential = SharedKeyCredential::new("acct", KEY).unwrap();
        assert!(!format!("{:?}", credential).contains(KEY));
    }
}
