//! Cache and coalescing key generation.

use crate::transport::ProxyRequest;
use http::header::{ACCEPT, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::Method;
use sha2::{Digest, Sha256};

/// Lowercase hex sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Store key of a request: its URI for `GET`, `"<METHOD> <uri>"` otherwise.
pub fn cache_key(req: &ProxyRequest) -> String {
    if req.method() == Method::GET {
        req.uri().to_string()
    } else {
        format!("{} {}", req.method(), req.uri())
    }
}

/// Fingerprint of everything that decides whether two requests may share one
/// upstream response: method, URI, the requested media type and the caller's
/// conditional headers.
///
/// Scoped to a partition by the caller; credentials are not part of the key.
pub fn coalescing_key(req: &ProxyRequest) -> String {
    let mut canonical = Vec::with_capacity(128);
    canonical.extend_from_slice(req.method().as_str().as_bytes());
    canonical.push(b'\n');
    canonical.extend_from_slice(req.uri().to_string().as_bytes());
    for name in [ACCEPT, IF_NONE_MATCH, IF_MODIFIED_SINCE] {
        canonical.push(b'\n');
        canonical.extend_from_slice(name.as_str().as_bytes());
        canonical.push(b':');
        for value in req.headers().get_all(&name) {
            canonical.extend_from_slice(value.as_bytes());
            canonical.push(b',');
        }
    }
    sha256_hex(&canonical)
}
