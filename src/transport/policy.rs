use super::{log_key, ProxyRequest, ProxyResponse, RoundTrip};
use crate::headers::{CACHE_ENTRY_CREATION_DATE, CONDITIONAL_REQUEST};
use crate::partition::TokenHasher;
use crate::telemetry::{collect_request_metrics, collect_request_timeout, collect_token_metrics};
use crate::Result;
use async_trait::async_trait;
use http::header::{HeaderValue, CACHE_CONTROL, IF_NONE_MATCH, USER_AGENT};
use http::StatusCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Forces "store, but always revalidate" on upstream responses and reports
/// per-token usage.
///
/// Error responses are marked `no-store`: they cannot be revalidated with a
/// conditional request. GraphQL responses are never stored.
pub struct UpstreamPolicyTransport {
    delegate: Arc<dyn RoundTrip>,
    hasher: Arc<TokenHasher>,
}

impl UpstreamPolicyTransport {
    pub fn new(delegate: Arc<dyn RoundTrip>, hasher: Arc<TokenHasher>) -> Self {
        Self { delegate, hasher }
    }
}

fn is_graphql(path: &str) -> bool {
    path.starts_with("graphql") || path.starts_with("/graphql")
}

#[async_trait]
impl RoundTrip for UpstreamPolicyTransport {
    async fn round_trip(&self, req: ProxyRequest) -> Result<ProxyResponse> {
        let etag = req.headers().get(IF_NONE_MATCH).cloned().filter(|v| !v.is_empty());
        let token_budget = self.hasher.token_budget(req.headers());
        let path = req.uri().path().to_string();
        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let key = log_key(&req);

        let started = Instant::now();
        let mut resp = match self.delegate.round_trip(req).await {
            Ok(resp) => resp,
            Err(e) => {
                collect_request_timeout(&token_budget, &path, &user_agent);
                warn!(cache_key = %key, error = %e, "Error from upstream (GitHub)");
                return Err(e);
            }
        };
        let round_trip = started.elapsed();
        let response_unix_secs = chrono::Utc::now().timestamp();

        let status = resp.status();
        let headers = resp.headers_mut();
        if status.as_u16() >= 400 {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        } else {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            if status != StatusCode::NOT_MODIFIED {
                headers.insert(CACHE_ENTRY_CREATION_DATE, HeaderValue::from(response_unix_secs));
            }
        }
        if let Some(etag) = etag {
            headers.insert(CONDITIONAL_REQUEST, etag);
        }

        let api_version = if is_graphql(&path) {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
            "v4"
        } else {
            "v3"
        };

        collect_token_metrics(&token_budget, api_version, resp.headers(), response_unix_secs);
        collect_request_metrics(&token_budget, &path, status.as_u16(), &user_agent, round_trip);
        Ok(resp)
    }
}
