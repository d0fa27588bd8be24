//! Request coalescing: one upstream call for many identical concurrent requests.
//!
//! The first caller for a [`coalescing_key`] becomes the executor. Its
//! delegate call runs on a spawned task, so it finishes even if that caller
//! goes away; every caller that arrives while it runs waits on a `watch`
//! channel and receives its own copy of the outcome. The key is removed from
//! the registry before the outcome is published, so a request arriving after
//! completion always starts a new call.

use crate::cache::{cache_response_mode, coalescing_key, CacheMode};
use crate::headers::CACHE_MODE;
use crate::partition::TokenHasher;
use crate::telemetry::collect_cache_response;
use crate::transport::{log_key, ProxyRequest, ProxyResponse, ResponseSnapshot, RoundTrip};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use http::header::{HeaderValue, USER_AGENT};
use http::Method;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Outcome = std::result::Result<ResponseSnapshot, Arc<Error>>;
type Registry = Arc<Mutex<HashMap<String, watch::Receiver<Option<Outcome>>>>>;

enum Role {
    Executor(watch::Sender<Option<Outcome>>),
    Waiter(watch::Receiver<Option<Outcome>>),
}

/// Removes a key from the registry when the delegate call ends, however it ends.
struct Deregister {
    registry: Registry,
    key: String,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Collapses concurrent identical `GET`/`HEAD` requests within one partition.
///
/// Every response leaves with the `x-cache-mode` header set: `COALESCED` for
/// waiters, the classifier's verdict for the executor.
pub struct RequestCoalescer {
    delegate: Arc<dyn RoundTrip>,
    hasher: Arc<TokenHasher>,
    in_flight: Registry,
}

impl RequestCoalescer {
    pub fn new(delegate: Arc<dyn RoundTrip>, hasher: Arc<TokenHasher>) -> Self {
        Self {
            delegate,
            hasher,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of distinct keys currently being executed.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn join(&self, key: &str) -> Role {
        let mut registry = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = registry.get(key) {
            return Role::Waiter(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        registry.insert(key.to_string(), rx);
        Role::Executor(tx)
    }

    async fn execute(
        &self,
        key: String,
        mut req: ProxyRequest,
        tx: watch::Sender<Option<Outcome>>,
        cancel: Option<CancellationToken>,
    ) -> Result<ProxyResponse> {
        // The shared call must not observe any single caller's cancellation.
        req.extensions_mut().remove::<CancellationToken>();
        let request_key = log_key(&req);
        let delegate = self.delegate.clone();
        let guard = Deregister {
            registry: self.in_flight.clone(),
            key,
        };
        let mut call = tokio::spawn(async move {
            let outcome: Outcome = delegate
                .round_trip(req)
                .await
                .map(ResponseSnapshot::from)
                .map_err(Arc::new);
            drop(guard);
            let _ = tx.send(Some(outcome.clone()));
            outcome
        });

        let joined = match cancel {
            Some(token) => tokio::select! {
                joined = &mut call => joined,
                _ = token.cancelled() => return Err(Error::Cancelled { key: request_key }),
            },
            None => call.await,
        };
        let outcome = joined.map_err(|e| {
            Error::runtime_with_context(
                format!("upstream call did not complete: {}", e),
                ErrorContext::new().with_details(request_key.clone()).with_source("coalescer"),
            )
        })?;

        match outcome {
            Ok(snapshot) => {
                let resp = snapshot.into_response();
                let mode = cache_response_mode(resp.headers());
                Ok(with_mode(resp, mode))
            }
            Err(shared) => Err(Error::from_shared(shared)),
        }
    }

    async fn wait(
        &self,
        mut rx: watch::Receiver<Option<Outcome>>,
        cancel: Option<CancellationToken>,
        request_key: String,
    ) -> Result<ProxyResponse> {
        debug!(cache_key = %request_key, "Waiting for in-flight request");
        let waited = async {
            rx.wait_for(|outcome| outcome.is_some())
                .await
                .map(|outcome| outcome.clone())
        };
        let received = match cancel {
            Some(token) => tokio::select! {
                received = waited => received,
                _ = token.cancelled() => return Err(Error::Cancelled { key: request_key }),
            },
            None => waited.await,
        };

        match received {
            Ok(Some(Ok(snapshot))) => Ok(with_mode(snapshot.into_response(), CacheMode::Coalesced)),
            Ok(Some(Err(shared))) => Err(Error::Shared(shared)),
            _ => Err(Error::runtime_with_context(
                "in-flight request ended without a result",
                ErrorContext::new().with_details(request_key).with_source("coalescer"),
            )),
        }
    }
}

fn with_mode(mut resp: ProxyResponse, mode: CacheMode) -> ProxyResponse {
    resp.headers_mut()
        .insert(CACHE_MODE, HeaderValue::from_static(mode.as_str()));
    resp
}

#[async_trait]
impl RoundTrip for RequestCoalescer {
    async fn round_trip(&self, req: ProxyRequest) -> Result<ProxyResponse> {
        let path = req.uri().path().to_string();
        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let token_budget = self.hasher.token_budget(req.headers());

        let result = if req.method() == Method::GET || req.method() == Method::HEAD {
            let cancel = req.extensions().get::<CancellationToken>().cloned();
            let key = coalescing_key(&req);
            match self.join(&key) {
                Role::Executor(tx) => self.execute(key, req, tx, cancel).await,
                Role::Waiter(rx) => self.wait(rx, cancel, log_key(&req)).await,
            }
        } else {
            self.delegate.round_trip(req).await.map(|resp| {
                let mode = cache_response_mode(resp.headers());
                with_mode(resp, mode)
            })
        };

        let mode = match &result {
            Ok(resp) => resp
                .headers()
                .get(CACHE_MODE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(CacheMode::Miss),
            Err(_) => CacheMode::Error,
        };
        collect_cache_response(mode.as_str(), &path, &user_agent, &token_budget);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{round_trip_fn, TransportError};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Delegate that counts calls and blocks each one until `release` fires.
    fn gated(calls: Arc<AtomicUsize>, release: Arc<Notify>, fail: bool) -> Arc<dyn RoundTrip> {
        Arc::new(round_trip_fn(move |_req: ProxyRequest| {
            let (calls, release) = (calls.clone(), release.clone());
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                release.notified().await;
                if fail {
                    return Err(Error::Transport(TransportError::Other("upstream reset".into())));
                }
                Ok(http::Response::new(Bytes::from(format!("call {}", n))))
            }
        }))
    }

    fn get() -> ProxyRequest {
        http::Request::get("/repos/o/r/pulls").body(Bytes::new()).unwrap()
    }

    async fn settle(coalescer: &RequestCoalescer, calls: &AtomicUsize, waiters: usize) {
        // Let every spawned caller register before releasing the executor.
        while calls.load(Ordering::SeqCst) == 0 || coalescer.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..waiters * 4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_share_one_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let coalescer = Arc::new(RequestCoalescer::new(
            gated(calls.clone(), release.clone(), false),
            Arc::new(TokenHasher::new()),
        ));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let coalescer = coalescer.clone();
                tokio::spawn(async move { coalescer.round_trip(get()).await })
            })
            .collect();
        settle(&coalescer, &calls, 5).await;
        release.notify_one();

        let mut modes = Vec::new();
        for handle in handles {
            let mut resp = handle.await.unwrap().unwrap();
            assert_eq!(resp.body(), &Bytes::from_static(b"call 1"));
            // Each copy is independently consumable.
            *resp.body_mut() = Bytes::new();
            modes.push(resp.headers()[CACHE_MODE].to_str().unwrap().to_string());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(modes.iter().filter(|m| *m == "COALESCED").count(), 4);
        assert_eq!(modes.iter().filter(|m| *m == "MISS").count(), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_reaches_every_waiter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let coalescer = Arc::new(RequestCoalescer::new(
            gated(calls.clone(), release.clone(), true),
            Arc::new(TokenHasher::new()),
        ));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let coalescer = coalescer.clone();
                tokio::spawn(async move { coalescer.round_trip(get()).await })
            })
            .collect();
        settle(&coalescer, &calls, 3).await;
        release.notify_one();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.is_transport());
            assert!(err.to_string().contains("upstream reset"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_after_completion_starts_new_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let coalescer = RequestCoalescer::new(
            gated(calls.clone(), release.clone(), false),
            Arc::new(TokenHasher::new()),
        );

        release.notify_one();
        let first = coalescer.round_trip(get()).await.unwrap();
        release.notify_one();
        let second = coalescer.round_trip(get()).await.unwrap();

        assert_eq!(first.body(), &Bytes::from_static(b"call 1"));
        assert_eq!(second.body(), &Bytes::from_static(b"call 2"));
        assert_eq!(second.headers()[CACHE_MODE], "MISS");
    }

    #[tokio::test]
    async fn test_cancelled_executor_does_not_cancel_shared_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let coalescer = Arc::new(RequestCoalescer::new(
            gated(calls.clone(), release.clone(), false),
            Arc::new(TokenHasher::new()),
        ));

        let token = CancellationToken::new();
        let executor = tokio::spawn({
            let coalescer = coalescer.clone();
            let mut req = get();
            req.extensions_mut().insert(token.clone());
            async move { coalescer.round_trip(req).await }
        });
        settle(&coalescer, &calls, 1).await;
        let waiter = tokio::spawn({
            let coalescer = coalescer.clone();
            async move { coalescer.round_trip(get()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        token.cancel();
        assert!(matches!(executor.await.unwrap(), Err(Error::Cancelled { .. })));

        release.notify_one();
        let resp = waiter.await.unwrap().unwrap();
        assert_eq!(resp.body(), &Bytes::from_static(b"call 1"));
        assert_eq!(resp.headers()[CACHE_MODE], "COALESCED");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_methods_are_not_coalesced() {
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let coalescer = RequestCoalescer::new(
            gated(calls.clone(), release.clone(), false),
            Arc::new(TokenHasher::new()),
        );
        release.notify_one();
        let post = http::Request::post("/repos/o/r/issues")
            .body(Bytes::from_static(b"{}"))
            .unwrap();
        let resp = coalescer.round_trip(post).await.unwrap();
        assert_eq!(resp.headers()[CACHE_MODE], "MISS");
        assert_eq!(coalescer.in_flight(), 0);
    }
}
