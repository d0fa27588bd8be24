use super::hasher::TokenHasher;
use crate::cache::cache_response_mode;
use crate::headers::{CACHE_MODE, TOKEN_EXPIRES_AT};
use crate::telemetry::record_partition_created;
use crate::transport::{ProxyRequest, ProxyResponse, RoundTrip};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::header::HeaderValue;
use http::HeaderMap;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Builds the transport chain of a new partition from its key and the
/// credential's expiry, if known.
pub type PartitionFactory = dyn Fn(&str, Option<DateTime<Utc>>) -> Arc<dyn RoundTrip> + Send + Sync;

/// Routes each request to the transport chain of its credential's partition,
/// creating the chain on first use.
pub struct PartitioningTransport {
    hasher: Arc<TokenHasher>,
    factory: Box<PartitionFactory>,
    partitions: RwLock<HashMap<String, Arc<dyn RoundTrip>>>,
}

impl PartitioningTransport {
    pub fn new<F>(hasher: Arc<TokenHasher>, factory: F) -> Self
    where
        F: Fn(&str, Option<DateTime<Utc>>) -> Arc<dyn RoundTrip> + Send + Sync + 'static,
    {
        Self {
            hasher,
            factory: Box::new(factory),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn partition(&self, key: &str, expires_at: Option<DateTime<Utc>>) -> Arc<dyn RoundTrip> {
        if let Some(chain) = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return chain.clone();
        }

        let mut partitions = self.partitions.write().unwrap_or_else(PoisonError::into_inner);
        // Another request may have created it while we waited for the write lock.
        if let Some(chain) = partitions.get(key) {
            return chain.clone();
        }
        debug!(partition = %key, expires_at = ?expires_at, "Creating cache partition");
        // The factory runs under the registry write lock. Disk partitions write
        // their metadata synchronously here, so every lookup waits on that I/O
        // once per new credential.
        let chain = (self.factory)(key, expires_at);
        partitions.insert(key.to_string(), chain.clone());
        record_partition_created(key);
        chain
    }
}

/// Expiry announced by the caller. An unparsable value is logged and ignored.
pub fn token_expiry(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let raw = headers.get(TOKEN_EXPIRES_AT)?.to_str().ok()?;
    if raw.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => Some(parsed.with_timezone(&Utc)),
        Err(e) => {
            warn!(header = TOKEN_EXPIRES_AT, value = raw, error = %e, "Failed to parse token expiry header");
            None
        }
    }
}

#[async_trait]
impl RoundTrip for PartitioningTransport {
    async fn round_trip(&self, req: ProxyRequest) -> Result<ProxyResponse> {
        let key = self.hasher.token_budget(req.headers());
        let expires_at = token_expiry(req.headers());
        let chain = self.partition(&key, expires_at);

        let mut resp = chain.round_trip(req).await?;
        if !resp.headers().contains_key(CACHE_MODE) {
            let mode = cache_response_mode(resp.headers());
            resp.headers_mut()
                .insert(CACHE_MODE, HeaderValue::from_static(mode.as_str()));
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::round_trip_fn;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Each chain answers with the partition key it was built for.
    fn router(created: Arc<Mutex<Vec<(String, Option<DateTime<Utc>>)>>>) -> PartitioningTransport {
        PartitioningTransport::new(Arc::new(TokenHasher::new()), move |key, expires_at| {
            created.lock().unwrap().push((key.to_string(), expires_at));
            let key = key.to_string();
            Arc::new(round_trip_fn(move |_req: ProxyRequest| {
                let key = key.clone();
                async move { Ok(http::Response::new(Bytes::from(key))) }
            }))
        })
    }

    fn request(auth: &str) -> ProxyRequest {
        http::Request::get("/user")
            .header("authorization", auth)
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_partitions_by_credential() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let router = router(created.clone());

        let a1 = router.round_trip(request("Bearer a")).await.unwrap();
        let a2 = router.round_trip(request("Bearer a")).await.unwrap();
        let b = router.round_trip(request("Bearer b")).await.unwrap();

        assert_eq!(a1.body(), a2.body());
        assert_ne!(a1.body(), b.body());
        assert_eq!(router.partition_count(), 2);
        assert_eq!(created.lock().unwrap().len(), 2);
        assert_eq!(a1.headers()[CACHE_MODE], "MISS");
    }

    #[tokio::test]
    async fn test_budget_identifier_and_expiry() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let router = router(created.clone());

        let req = http::Request::get("/user")
            .header("authorization", "Bearer a")
            .header("x-prow-ghcache-token-budget-identifier", "app-7")
            .header("x-prow-token-expires-at", "2030-01-01T00:00:00Z")
            .body(Bytes::new())
            .unwrap();
        let resp = router.round_trip(req).await.unwrap();
        assert_eq!(resp.body(), &Bytes::from_static(b"app-7"));

        let created = created.lock().unwrap();
        assert_eq!(created[0].0, "app-7");
        assert_eq!(
            created[0].1,
            Some(DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z").unwrap().with_timezone(&Utc))
        );
    }

    #[test]
    fn test_invalid_expiry_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_EXPIRES_AT, "tomorrow".parse().unwrap());
        assert!(token_expiry(&headers).is_none());
        assert!(token_expiry(&HeaderMap::new()).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_first_use_builds_one_chain() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let router = Arc::new(PartitioningTransport::new(Arc::new(TokenHasher::new()), move |_key, _exp| {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(round_trip_fn(|_req: ProxyRequest| async {
                Ok(http::Response::new(Bytes::new()))
            }))
        }));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let router = router.clone();
                tokio::spawn(async move { router.round_trip(request("Bearer same")).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_existing_cache_mode_is_kept() {
        let router = PartitioningTransport::new(Arc::new(TokenHasher::new()), |_key, _exp| {
            Arc::new(round_trip_fn(|_req: ProxyRequest| async {
                Ok(http::Response::builder()
                    .header(CACHE_MODE, "COALESCED")
                    .body(Bytes::new())
                    .unwrap())
            }))
        });
        let resp = router.round_trip(request("Bearer a")).await.unwrap();
        assert_eq!(resp.headers()[CACHE_MODE], "COALESCED");
    }
}
