use super::{ProxyRequest, ProxyResponse, RoundTrip};
use crate::Result;
use async_trait::async_trait;
use http::header::{self, HeaderMap, HeaderName};
use reqwest::Proxy;
use std::time::Duration;
use url::Url;

/// Default upstream the proxy talks to.
pub const DEFAULT_UPSTREAM_URL: &str = "https://api.github.com";

/// Connection knobs for the upstream HTTP client.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub proxy_url: Option<String>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_URL.to_string(),
            timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
            proxy_url: None,
        }
    }
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }
}

/// The innermost layer: performs the real call to the upstream API.
///
/// Requests whose URI is only a path (the usual case for a reverse proxy) are
/// resolved against the configured base URL; absolute URIs are sent as-is.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(cfg: &HttpTransportConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", cfg.base_url, e)))?;

        let mut builder = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .pool_max_idle_per_host(cfg.pool_max_idle_per_host)
            .pool_idle_timeout(Some(cfg.pool_idle_timeout))
            // Bodies are relayed byte-for-byte; never follow redirects on the caller's behalf.
            .redirect(reqwest::redirect::Policy::none());

        if let Some(proxy_url) = &cfg.proxy_url {
            let proxy = Proxy::all(proxy_url)
                .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(Self { client, base_url })
    }

    fn resolve(&self, req: &ProxyRequest) -> std::result::Result<Url, TransportError> {
        let uri = req.uri();
        if uri.scheme().is_some() {
            return Url::parse(&uri.to_string())
                .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", uri, e)));
        }
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let mut url = self.base_url.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        match path_and_query.split_once('?') {
            Some((path, query)) => {
                url.set_path(&format!("{}{}", base_path, path));
                url.set_query(Some(query));
            }
            None => {
                url.set_path(&format!("{}{}", base_path, path_and_query));
                url.set_query(None);
            }
        }
        Ok(url)
    }
}

/// Headers describing the client connection rather than the exchange.
fn strip_connection_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in [
        header::CONNECTION,
        header::HOST,
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::TE,
        header::TRAILER,
        header::PROXY_AUTHORIZATION,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

#[async_trait]
impl RoundTrip for HttpTransport {
    async fn round_trip(&self, req: ProxyRequest) -> Result<ProxyResponse> {
        let url = self.resolve(&req)?;
        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        strip_connection_headers(&mut headers);

        let resp = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(TransportError::Http)?;

        let status = resp.status();
        let version = resp.version();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(TransportError::Http)?;

        let mut out = http::Response::new(body);
        *out.status_mut() = status;
        *out.version_mut() = version;
        *out.headers_mut() = headers;
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Other(String),
}
