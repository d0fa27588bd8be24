use super::backend::CacheBackend;
use super::entry::{add_validators, merge_not_modified, record_varied, varies_match, StoredResponse};
use super::key::cache_key;
use crate::headers::{FROM_CACHE, STATUS, STATUS_NOT_MODIFIED};
use crate::transport::{ProxyRequest, ProxyResponse, RoundTrip};
use crate::Result;
use async_trait::async_trait;
use http::header::{HeaderValue, CACHE_CONTROL, RANGE};
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

/// HTTP cache in front of a delegate, storing into a [`CacheBackend`].
///
/// Freshness is never evaluated: a stored entry only contributes validators
/// to the upstream request, and its body is served only when upstream answers
/// `304 Not Modified`.
pub struct CachingTransport {
    store: Arc<dyn CacheBackend>,
    delegate: Arc<dyn RoundTrip>,
}

impl CachingTransport {
    pub fn new(store: Arc<dyn CacheBackend>, delegate: Arc<dyn RoundTrip>) -> Self {
        Self { store, delegate }
    }

    async fn lookup(&self, key: &str) -> Option<ProxyResponse> {
        let bytes = match self.store.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(cache_key = %key, backend = self.store.name(), error = %e, "Cache lookup failed");
                return None;
            }
        };
        match StoredResponse::decode(&bytes).and_then(StoredResponse::into_response) {
            Ok(mut resp) => {
                resp.headers_mut().insert(FROM_CACHE, HeaderValue::from_static("1"));
                Some(resp)
            }
            Err(e) => {
                warn!(cache_key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    async fn store(&self, key: &str, resp: &ProxyResponse) {
        let encoded = match StoredResponse::from_response(resp).encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(cache_key = %key, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.store.set(key, &encoded).await {
            warn!(cache_key = %key, backend = self.store.name(), error = %e, "Cache write failed");
        }
    }

    async fn forget(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!(cache_key = %key, backend = self.store.name(), error = %e, "Cache delete failed");
        }
    }
}

fn is_cacheable(req: &ProxyRequest) -> bool {
    (req.method() == Method::GET || req.method() == Method::HEAD) && !req.headers().contains_key(RANGE)
}

fn has_no_store(headers: &HeaderMap) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|directive| directive.trim().eq_ignore_ascii_case("no-store"))
}

#[async_trait]
impl RoundTrip for CachingTransport {
    async fn round_trip(&self, mut req: ProxyRequest) -> Result<ProxyResponse> {
        if !is_cacheable(&req) {
            return self.delegate.round_trip(req).await;
        }

        let key = cache_key(&req);
        let cached = self.lookup(&key).await;
        if let Some(stored) = &cached {
            if varies_match(stored.headers(), &req) {
                add_validators(&mut req, stored.headers());
            }
        }

        let method = req.method().clone();
        let req_headers = req.headers().clone();

        let mut resp = self.delegate.round_trip(req).await?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            resp.headers_mut()
                .insert(STATUS, HeaderValue::from_static(STATUS_NOT_MODIFIED));
        }

        match cached {
            Some(mut stored) if method == Method::GET && resp.status() == StatusCode::NOT_MODIFIED => {
                debug!(cache_key = %key, "Revalidated stored response");
                merge_not_modified(stored.headers_mut(), resp.headers());
                resp = stored;
            }
            Some(_) if resp.status() != StatusCode::OK => self.forget(&key).await,
            _ => {}
        }

        if !has_no_store(&req_headers) && !has_no_store(resp.headers()) {
            record_varied(&mut resp, &req_headers);
            self.store(&key, &resp).await;
        } else {
            self.forget(&key).await;
        }
        Ok(resp)
    }
}
