use super::{log_key, ProxyRequest, ProxyResponse, RoundTrip};
use crate::telemetry::{concurrent_outbound, pending_outbound};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Holds one unit of an outbound gauge until dropped, so the gauge settles even
/// when the caller's future is dropped mid-request.
struct GaugeGuard(fn(f64));

impl GaugeGuard {
    fn enter(gauge: fn(f64)) -> Self {
        gauge(1.0);
        Self(gauge)
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        (self.0)(-1.0);
    }
}

/// Admission gate bounding concurrent calls to the delegate.
///
/// A caller waiting for admission can be released early through a
/// [`CancellationToken`] in the request extensions; the delegate is then never
/// called.
pub struct ThrottlingTransport {
    permits: Arc<Semaphore>,
    delegate: Arc<dyn RoundTrip>,
}

impl ThrottlingTransport {
    /// `max_concurrency` is clamped to `1..=Semaphore::MAX_PERMITS`.
    pub fn new(max_concurrency: usize, delegate: Arc<dyn RoundTrip>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.clamp(1, Semaphore::MAX_PERMITS))),
            delegate,
        }
    }

    /// Permits not currently held by an in-flight call.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl RoundTrip for ThrottlingTransport {
    async fn round_trip(&self, req: ProxyRequest) -> Result<ProxyResponse> {
        let cancel = req.extensions().get::<CancellationToken>().cloned();
        let pending = GaugeGuard::enter(pending_outbound);

        let acquired = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err("request cancelled while waiting for admission".to_string()),
                permit = self.permits.acquire() => permit.map_err(|e| e.to_string()),
            },
            None => self.permits.acquire().await.map_err(|e| e.to_string()),
        };
        drop(pending);

        let _permit = match acquired {
            Ok(permit) => permit,
            Err(reason) => {
                let key = log_key(&req);
                error!(cache_key = %key, reason = %reason, "Internal error acquiring semaphore");
                return Err(Error::Admission { key, reason });
            }
        };

        let _in_flight = GaugeGuard::enter(concurrent_outbound);
        self.delegate.round_trip(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{CONCURRENT_OUTBOUND_REQUESTS, PENDING_OUTBOUND_REQUESTS};
    use crate::transport::round_trip_fn;
    use bytes::Bytes;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_test::assert_pending;

    fn gauge(snapshotter: &Snapshotter, name: &str) -> f64 {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find_map(|(key, _, _, value)| match value {
                DebugValue::Gauge(v) if key.key().name() == name => Some(v.into_inner()),
                _ => None,
            })
            .unwrap_or(0.0)
    }

    fn get() -> ProxyRequest {
        http::Request::get("/repos/o/r").body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn test_single_permit_serializes_calls() {
        let release = Arc::new(Notify::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let delegate = {
            let (release, in_flight, peak) = (release.clone(), in_flight.clone(), peak.clone());
            round_trip_fn(move |_req: ProxyRequest| {
                let (release, in_flight, peak) = (release.clone(), in_flight.clone(), peak.clone());
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    release.notified().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(http::Response::new(Bytes::from_static(b"done")))
                }
            })
        };
        let throttle = Arc::new(ThrottlingTransport::new(1, Arc::new(delegate)));

        let first = tokio::spawn({
            let throttle = throttle.clone();
            async move { throttle.round_trip(get()).await }
        });
        while in_flight.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(throttle.available(), 0);

        let mut second = tokio_test::task::spawn(throttle.round_trip(get()));
        assert_pending!(second.poll());
        assert_eq!(in_flight.load(Ordering::SeqCst), 1);

        release.notify_one();
        first.await.unwrap().unwrap();
        release.notify_one();
        let resp = second.await.unwrap();

        assert_eq!(resp.body(), &Bytes::from_static(b"done"));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(throttle.available(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_admission_skips_delegate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let delegate = {
            let calls = calls.clone();
            round_trip_fn(move |_req: ProxyRequest| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(http::Response::new(Bytes::new())) }
            })
        };
        let throttle = ThrottlingTransport::new(1, Arc::new(delegate));

        let token = CancellationToken::new();
        token.cancel();
        let mut req = get();
        req.extensions_mut().insert(token);

        let err = throttle.round_trip(req).await.unwrap_err();
        assert!(matches!(err, Error::Admission { ref key, .. } if key == "/repos/o/r"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(throttle.available(), 1);
    }

    #[tokio::test]
    async fn test_delegate_error_releases_permit() {
        let delegate = round_trip_fn(|_req: ProxyRequest| async {
            Err(Error::Transport(crate::transport::TransportError::Other(
                "connection reset".into(),
            )))
        });
        let throttle = ThrottlingTransport::new(2, Arc::new(delegate));
        assert!(throttle.round_trip(get()).await.unwrap_err().is_transport());
        assert_eq!(throttle.available(), 2);
    }

    #[test]
    fn test_oversized_concurrency_is_clamped() {
        let delegate = round_trip_fn(|_req: ProxyRequest| async { Ok(http::Response::new(Bytes::new())) });
        let throttle = ThrottlingTransport::new(usize::MAX, Arc::new(delegate));
        assert_eq!(throttle.available(), Semaphore::MAX_PERMITS);
    }

    #[tokio::test]
    async fn test_gauges_settle_after_success_error_and_abort() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        // Current-thread runtime: every task below records on this thread.
        let _local = metrics::set_default_local_recorder(&recorder);

        let entered = Arc::new(AtomicUsize::new(0));
        let delegate = {
            let entered = entered.clone();
            round_trip_fn(move |req: ProxyRequest| {
                entered.fetch_add(1, Ordering::SeqCst);
                let path = req.uri().path().to_string();
                async move {
                    match path.as_str() {
                        "/fail" => Err(Error::Transport(crate::transport::TransportError::Other(
                            "connection reset".into(),
                        ))),
                        "/hang" => {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            Ok(http::Response::new(Bytes::new()))
                        }
                        _ => Ok(http::Response::new(Bytes::new())),
                    }
                }
            })
        };
        let throttle = Arc::new(ThrottlingTransport::new(1, Arc::new(delegate)));
        let post = |path: &str| http::Request::post(path).body(Bytes::new()).unwrap();

        throttle.round_trip(post("/ok")).await.unwrap();
        assert!(throttle.round_trip(post("/fail")).await.is_err());
        assert_eq!(gauge(&snapshotter, PENDING_OUTBOUND_REQUESTS), 0.0);
        assert_eq!(gauge(&snapshotter, CONCURRENT_OUTBOUND_REQUESTS), 0.0);

        let hanging = tokio::spawn({
            let throttle = throttle.clone();
            let req = post("/hang");
            async move { throttle.round_trip(req).await }
        });
        while entered.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }
        let queued = tokio::spawn({
            let throttle = throttle.clone();
            let req = post("/ok");
            async move { throttle.round_trip(req).await }
        });
        while gauge(&snapshotter, PENDING_OUTBOUND_REQUESTS) < 1.0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gauge(&snapshotter, CONCURRENT_OUTBOUND_REQUESTS), 1.0);

        hanging.abort();
        queued.abort();
        assert!(hanging.await.unwrap_err().is_cancelled());
        let _ = queued.await;

        assert_eq!(gauge(&snapshotter, PENDING_OUTBOUND_REQUESTS), 0.0);
        assert_eq!(gauge(&snapshotter, CONCURRENT_OUTBOUND_REQUESTS), 0.0);
        assert_eq!(throttle.available(), 1);
    }
}
