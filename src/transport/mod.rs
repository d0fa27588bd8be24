//! Round-trip abstraction shared by every layer of the caching proxy.
//!
//! # Transport Module
//!
//! Each stage of the proxy (coalescer, cache, throttle, upstream policy and
//! the real HTTP call) is a [`RoundTrip`] that wraps another [`RoundTrip`].
//! Requests and responses are fully buffered `http` messages with
//! [`Bytes`] bodies, so a response can be copied cheaply and every copy
//! consumed independently.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RoundTrip`] | The single-method exchange trait every layer implements |
//! | [`HttpTransport`] | reqwest-backed call to the upstream API |
//! | [`UpstreamPolicyTransport`] | Forces "store, always revalidate" and reports token usage |
//! | [`ThrottlingTransport`] | Bounds concurrent outbound calls |
//! | [`ResponseSnapshot`] | Cloneable copy of a response for fan-out |
//! | [`round_trip_fn`] | Adapts an async closure into a [`RoundTrip`] |
//!
//! ## Cancellation
//!
//! A caller may attach a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! to the request extensions. The throttling gate observes it while waiting
//! for admission; no other layer cancels work on the caller's behalf.

mod client;
mod policy;
mod throttle;

pub use client::{HttpTransport, HttpTransportConfig, TransportError, DEFAULT_UPSTREAM_URL};
pub use policy::UpstreamPolicyTransport;
pub use throttle::ThrottlingTransport;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use std::future::Future;
use std::sync::Arc;

/// A buffered request travelling through the proxy.
pub type ProxyRequest = http::Request<Bytes>;

/// A buffered response travelling back through the proxy.
pub type ProxyResponse = http::Response<Bytes>;

/// One HTTP exchange: hand a request to the next layer, get its response.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, req: ProxyRequest) -> Result<ProxyResponse>;
}

#[async_trait]
impl<T: RoundTrip + ?Sized> RoundTrip for Arc<T> {
    async fn round_trip(&self, req: ProxyRequest) -> Result<ProxyResponse> {
        (**self).round_trip(req).await
    }
}

/// A [`RoundTrip`] backed by an async closure.
pub struct RoundTripFn<F> {
    f: F,
}

/// Wrap `f` so it can be used anywhere a [`RoundTrip`] is expected.
pub fn round_trip_fn<F, Fut>(f: F) -> RoundTripFn<F>
where
    F: Fn(ProxyRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProxyResponse>> + Send,
{
    RoundTripFn { f }
}

#[async_trait]
impl<F, Fut> RoundTrip for RoundTripFn<F>
where
    F: Fn(ProxyRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProxyResponse>> + Send,
{
    async fn round_trip(&self, req: ProxyRequest) -> Result<ProxyResponse> {
        (self.f)(req).await
    }
}

/// Owned, cloneable copy of a response.
///
/// `http::Response` is not `Clone`; this is what the coalescer hands to each
/// waiter. Extensions are not carried over.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseSnapshot {
    pub fn of(resp: &ProxyResponse) -> Self {
        Self {
            status: resp.status(),
            version: resp.version(),
            headers: resp.headers().clone(),
            body: resp.body().clone(),
        }
    }

    pub fn into_response(self) -> ProxyResponse {
        let mut resp = http::Response::new(self.body);
        *resp.status_mut() = self.status;
        *resp.version_mut() = self.version;
        *resp.headers_mut() = self.headers;
        resp
    }
}

impl From<ProxyResponse> for ResponseSnapshot {
    fn from(resp: ProxyResponse) -> Self {
        let (parts, body) = resp.into_parts();
        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body,
        }
    }
}

/// Identifying key used in log lines for a request.
pub(crate) fn log_key(req: &ProxyRequest) -> String {
    req.uri().to_string()
}
