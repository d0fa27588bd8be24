//! Proxy configuration, loaded from YAML or `GHCACHE_*` environment variables.

use crate::transport::{HttpTransportConfig, DEFAULT_UPSTREAM_URL};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Semaphore;

fn default_upstream_url() -> String {
    DEFAULT_UPSTREAM_URL.to_string()
}

fn default_max_concurrency() -> usize {
    25
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    32
}

fn default_pool_idle_timeout_secs() -> u64 {
    90
}

fn default_prune_interval_secs() -> u64 {
    3600
}

/// Where cached responses are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// One in-process map per partition.
    #[default]
    Memory,
    /// Files under `<dir>/data/<partition>` and `<dir>/temp/<partition>`.
    Disk {
        dir: PathBuf,
        #[serde(default)]
        size_gb: u64,
        /// Share one cache between every credential (no pruning).
        #[serde(default)]
        disable_partitioning: bool,
        #[serde(default = "default_prune_interval_secs")]
        prune_interval_secs: u64,
    },
    /// A single Redis database shared by every partition.
    Redis { address: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    /// Concurrent upstream calls allowed per partition.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_url: default_upstream_url(),
            max_concurrency: default_max_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            proxy_url: None,
            backend: BackendConfig::default(),
        }
    }
}

fn config_error(field: &str, message: impl Into<String>) -> Error {
    Error::configuration_with_context(
        message,
        ErrorContext::new().with_field_path(field).with_source("config"),
    )
}

impl ProxyConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ProxyConfig = serde_yaml::from_str(content).map_err(|e| {
            Error::configuration_with_context(
                format!("Failed to parse config: {}", e),
                ErrorContext::new().with_source("config"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("Failed to read config: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config"),
            )
        })?;
        Self::from_yaml_str(&content)
    }

    /// Read `GHCACHE_*` variables from the process environment.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `GHCACHE_UPSTREAM_URL` | `upstream_url` |
    /// | `GHCACHE_MAX_CONCURRENCY` | `max_concurrency` |
    /// | `GHCACHE_REQUEST_TIMEOUT_SECS` | `request_timeout_secs` |
    /// | `GHCACHE_POOL_MAX_IDLE_PER_HOST` | `pool_max_idle_per_host` |
    /// | `GHCACHE_POOL_IDLE_TIMEOUT_SECS` | `pool_idle_timeout_secs` |
    /// | `GHCACHE_PROXY_URL` | `proxy_url` |
    /// | `GHCACHE_BACKEND` | `memory`, `disk` or `redis` |
    /// | `GHCACHE_CACHE_DIR` | disk `dir` |
    /// | `GHCACHE_CACHE_SIZE_GB` | disk `size_gb` |
    /// | `GHCACHE_DISABLE_PARTITIONING` | disk `disable_partitioning` |
    /// | `GHCACHE_PRUNE_INTERVAL_SECS` | disk `prune_interval_secs` |
    /// | `GHCACHE_REDIS_ADDRESS` | redis `address` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = ProxyConfig::default();

        if let Some(url) = get("GHCACHE_UPSTREAM_URL") {
            config.upstream_url = url;
        }
        if let Some(v) = get("GHCACHE_MAX_CONCURRENCY") {
            config.max_concurrency = parse_var("GHCACHE_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("GHCACHE_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_var("GHCACHE_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("GHCACHE_POOL_MAX_IDLE_PER_HOST") {
            config.pool_max_idle_per_host = parse_var("GHCACHE_POOL_MAX_IDLE_PER_HOST", &v)?;
        }
        if let Some(v) = get("GHCACHE_POOL_IDLE_TIMEOUT_SECS") {
            config.pool_idle_timeout_secs = parse_var("GHCACHE_POOL_IDLE_TIMEOUT_SECS", &v)?;
        }
        config.proxy_url = get("GHCACHE_PROXY_URL");

        let backend = get("GHCACHE_BACKEND").unwrap_or_else(|| "memory".to_string());
        config.backend = match backend.to_ascii_lowercase().as_str() {
            "memory" => BackendConfig::Memory,
            "disk" => BackendConfig::Disk {
                dir: get("GHCACHE_CACHE_DIR").map(PathBuf::from).unwrap_or_default(),
                size_gb: get("GHCACHE_CACHE_SIZE_GB")
                    .map(|v| parse_var("GHCACHE_CACHE_SIZE_GB", &v))
                    .transpose()?
                    .unwrap_or(0),
                disable_partitioning: get("GHCACHE_DISABLE_PARTITIONING")
                    .map(|v| parse_var("GHCACHE_DISABLE_PARTITIONING", &v))
                    .transpose()?
                    .unwrap_or(false),
                prune_interval_secs: get("GHCACHE_PRUNE_INTERVAL_SECS")
                    .map(|v| parse_var("GHCACHE_PRUNE_INTERVAL_SECS", &v))
                    .transpose()?
                    .unwrap_or_else(default_prune_interval_secs),
            },
            "redis" => BackendConfig::Redis {
                address: get("GHCACHE_REDIS_ADDRESS").unwrap_or_default(),
            },
            other => {
                return Err(config_error(
                    "GHCACHE_BACKEND",
                    format!("unknown backend '{}', expected memory, disk or redis", other),
                ))
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency < 1 {
            return Err(config_error("max_concurrency", "max_concurrency must be at least 1"));
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(config_error(
                "max_concurrency",
                format!("max_concurrency must not exceed {}", Semaphore::MAX_PERMITS),
            ));
        }
        url::Url::parse(&self.upstream_url).map_err(|e| {
            config_error("upstream_url", format!("invalid upstream URL '{}': {}", self.upstream_url, e))
        })?;
        match &self.backend {
            BackendConfig::Memory => {}
            BackendConfig::Disk {
                dir,
                prune_interval_secs,
                ..
            } => {
                if dir.as_os_str().is_empty() {
                    return Err(config_error("backend.dir", "disk backend requires a cache directory"));
                }
                if *prune_interval_secs == 0 {
                    return Err(config_error(
                        "backend.prune_interval_secs",
                        "prune interval must be at least one second",
                    ));
                }
            }
            BackendConfig::Redis { address } => {
                if address.trim().is_empty() {
                    return Err(config_error("backend.address", "redis backend requires an address"));
                }
            }
        }
        Ok(())
    }

    pub fn http_transport_config(&self) -> HttpTransportConfig {
        let mut cfg = HttpTransportConfig::new(self.upstream_url.clone())
            .with_timeout(Duration::from_secs(self.request_timeout_secs));
        cfg.pool_max_idle_per_host = self.pool_max_idle_per_host;
        cfg.pool_idle_timeout = Duration::from_secs(self.pool_idle_timeout_secs);
        if let Some(proxy_url) = &self.proxy_url {
            cfg = cfg.with_proxy_url(proxy_url.clone());
        }
        cfg
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| config_error(name, format!("invalid value '{}': {}", value, e)))
}
