//! Stored response codec and the header bookkeeping around it.

use crate::headers::{FROM_CACHE, STATUS, VARIED_PREFIX};
use crate::transport::{ProxyRequest, ProxyResponse};
use crate::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use serde::{Deserialize, Serialize};

/// A response as persisted in a [`CacheBackend`](super::CacheBackend).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    /// Header pairs in wire order; repeated names are kept.
    pub headers: Vec<(String, String)>,
    /// Base64 of the body.
    pub body: String,
}

impl StoredResponse {
    /// Capture `resp` for storage. Markers that only describe how this copy was
    /// served (`X-From-Cache`, the not-modified `Status`) are left out.
    pub fn from_response(resp: &ProxyResponse) -> Self {
        let headers = resp
            .headers()
            .iter()
            .filter(|(name, _)| name.as_str() != FROM_CACHE && name.as_str() != STATUS)
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Self {
            status: resp.status().as_u16(),
            headers,
            body: STANDARD.encode(resp.body()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn into_response(self) -> Result<ProxyResponse> {
        let body = STANDARD.decode(self.body.as_bytes()).map_err(|e| {
            crate::Error::storage_with_context(
                format!("stored body is not valid base64: {}", e),
                crate::ErrorContext::new().with_source("cache_entry"),
            )
        })?;
        let status = StatusCode::from_u16(self.status).map_err(http::Error::from)?;
        let mut builder = http::Response::builder().status(status);
        for (name, value) in &self.headers {
            let value = HeaderValue::from_bytes(value.as_bytes()).map_err(http::Error::from)?;
            builder = builder.header(name.as_str(), value);
        }
        Ok(builder.body(Bytes::from(body))?)
    }
}

/// Header names listed in `Vary`, lowercased.
fn vary_fields(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|field| field.trim().to_ascii_lowercase())
        .filter(|field| !field.is_empty())
        .collect()
}

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Whether `req` carries the same values for every header the stored
/// response varies on.
pub fn varies_match(stored: &HeaderMap, req: &ProxyRequest) -> bool {
    vary_fields(stored).iter().all(|field| {
        header_text(req.headers(), field)
            == header_text(stored, &format!("{}{}", VARIED_PREFIX, field))
    })
}

/// Record the request's values for each `Vary` header as `X-Varied-<name>`.
pub fn record_varied(resp: &mut ProxyResponse, req_headers: &HeaderMap) {
    for field in vary_fields(resp.headers()) {
        let Some(value) = req_headers.get(field.as_str()).filter(|v| !v.is_empty()) else {
            continue;
        };
        if let Ok(name) = HeaderName::from_bytes(format!("{}{}", VARIED_PREFIX, field).as_bytes()) {
            resp.headers_mut().insert(name, value.clone());
        }
    }
}

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Names of the headers in `headers` that describe the resource rather than
/// the connection.
pub fn end_to_end_headers(headers: &HeaderMap) -> Vec<HeaderName> {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();
    headers
        .keys()
        .filter(|name| {
            !HOP_BY_HOP.contains(&name.as_str()) && !listed.iter().any(|l| l == name.as_str())
        })
        .cloned()
        .collect()
}

/// Overwrite the stored response's headers with the end-to-end headers of a
/// `304 Not Modified`.
pub fn merge_not_modified(stored: &mut HeaderMap, not_modified: &HeaderMap) {
    for name in end_to_end_headers(not_modified) {
        stored.remove(&name);
        for value in not_modified.get_all(&name) {
            stored.append(name.clone(), value.clone());
        }
    }
}

/// Add validators taken from a stored response unless the caller sent their own.
pub fn add_validators(req: &mut ProxyRequest, stored: &HeaderMap) {
    let pairs = [
        (header::ETAG, header::IF_NONE_MATCH),
        (header::LAST_MODIFIED, header::IF_MODIFIED_SINCE),
    ];
    for (source, validator) in pairs {
        if req.headers().contains_key(&validator) {
            continue;
        }
        if let Some(value) = stored.get(&source).filter(|v| !v.is_empty()) {
            let value = value.clone();
            req.headers_mut().insert(validator, value);
        }
    }
}
