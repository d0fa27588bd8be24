//! Assembles the partitioned proxy transport.

use crate::cache::{CacheBackend, CachingTransport, DiskCache, MemoryCache, RedisCache};
use crate::coalesce::RequestCoalescer;
use crate::config::{BackendConfig, ProxyConfig};
use crate::partition::{partition_dir_name, write_partition_metadata, PartitioningTransport, Pruner, TokenHasher};
use crate::telemetry::describe_metrics;
use crate::transport::{
    HttpTransport, ProxyRequest, ProxyResponse, RoundTrip, ThrottlingTransport, UpstreamPolicyTransport,
};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Where each new partition gets its store from.
enum Stores {
    Memory,
    Disk { dir: PathBuf, size_gb: u64 },
    Shared(Arc<dyn CacheBackend>),
    /// Legacy unpartitioned disk cache.
    SharedDisk(Arc<DiskCache>),
}

impl Stores {
    fn for_partition(&self, key: &str, expires_at: Option<DateTime<Utc>>) -> Arc<dyn CacheBackend> {
        match self {
            Stores::Memory => Arc::new(MemoryCache::new()),
            Stores::Disk { dir, size_gb } => {
                let name = partition_dir_name(key);
                let base_path = dir.join("data").join(&name);
                let temp_dir = dir.join("temp").join(&name);
                if let Err(e) = write_partition_metadata(&base_path, &temp_dir, expires_at) {
                    warn!(partition = %key, error = %e, "Failed to write cache partition metadata");
                }
                Arc::new(DiskCache::with_size_gb(base_path, temp_dir, *size_gb))
            }
            Stores::Shared(store) => store.clone(),
            Stores::SharedDisk(store) => {
                warn!(
                    partition = %key,
                    "Cache partitioning is disabled; every credential shares one disk cache"
                );
                store.clone()
            }
        }
    }
}

/// Builder for [`GhCache`].
///
/// ```rust,no_run
/// use ghcache::{GhCacheBuilder, HttpTransport, HttpTransportConfig};
/// use std::sync::Arc;
///
/// # async fn run() -> ghcache::Result<()> {
/// let upstream = HttpTransport::new(&HttpTransportConfig::default())?;
/// let proxy = GhCacheBuilder::new()
///     .with_max_concurrency(10)
///     .with_disk_backend("/var/cache/ghcache", 50)
///     .build(Arc::new(upstream))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct GhCacheBuilder {
    max_concurrency: usize,
    backend: BackendConfig,
}

impl Default for GhCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GhCacheBuilder {
    pub fn new() -> Self {
        let defaults = ProxyConfig::default();
        Self {
            max_concurrency: defaults.max_concurrency,
            backend: defaults.backend,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            backend: config.backend.clone(),
        }
    }

    /// Concurrent upstream calls allowed per partition.
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_memory_backend(self) -> Self {
        self.with_backend(BackendConfig::Memory)
    }

    /// Partitioned disk cache under `dir`, pruned hourly.
    pub fn with_disk_backend(self, dir: impl Into<PathBuf>, size_gb: u64) -> Self {
        self.with_backend(BackendConfig::Disk {
            dir: dir.into(),
            size_gb,
            disable_partitioning: false,
            prune_interval_secs: 3600,
        })
    }

    pub fn with_redis_backend(self, address: impl Into<String>) -> Self {
        self.with_backend(BackendConfig::Redis {
            address: address.into(),
        })
    }

    /// Build the proxy around `upstream`. Connecting to redis happens here and
    /// its failure is returned.
    pub async fn build(self, upstream: Arc<dyn RoundTrip>) -> Result<GhCache> {
        if !(1..=Semaphore::MAX_PERMITS).contains(&self.max_concurrency) {
            return Err(Error::configuration_with_context(
                format!(
                    "max_concurrency must be between 1 and {}",
                    Semaphore::MAX_PERMITS
                ),
                ErrorContext::new().with_field_path("max_concurrency"),
            ));
        }
        describe_metrics();

        let mut pruner = None;
        let stores = match self.backend {
            BackendConfig::Memory => Stores::Memory,
            BackendConfig::Disk {
                dir,
                size_gb,
                disable_partitioning: true,
                ..
            } => {
                warn!(dir = %dir.display(), "Disk cache partitioning is disabled; expired credentials are never pruned");
                Stores::SharedDisk(Arc::new(DiskCache::with_size_gb(
                    dir.join("data"),
                    dir.join("temp"),
                    size_gb,
                )))
            }
            BackendConfig::Disk {
                dir,
                size_gb,
                prune_interval_secs,
                ..
            } => {
                let interval = Duration::from_secs(prune_interval_secs.max(1));
                info!(dir = %dir.display(), interval_secs = interval.as_secs(), "Starting cache partition pruner");
                pruner = Some(Arc::new(Pruner::new(dir.clone())).spawn(interval));
                Stores::Disk { dir, size_gb }
            }
            BackendConfig::Redis { address } => {
                let store = RedisCache::connect(&address).await?;
                warn!("Redis cache is shared by every credential; cache partitioning is not supported");
                Stores::Shared(Arc::new(store))
            }
        };

        let hasher = Arc::new(TokenHasher::new());
        let max_concurrency = self.max_concurrency;
        let chain_hasher = hasher.clone();
        let router = PartitioningTransport::new(hasher, move |key, expires_at| {
            let store = stores.for_partition(key, expires_at);
            let policy = Arc::new(UpstreamPolicyTransport::new(upstream.clone(), chain_hasher.clone()));
            let throttle = Arc::new(ThrottlingTransport::new(max_concurrency, policy));
            let cache = Arc::new(CachingTransport::new(store, throttle));
            Arc::new(RequestCoalescer::new(cache, chain_hasher.clone())) as Arc<dyn RoundTrip>
        });

        Ok(GhCache { router, pruner })
    }
}

/// The assembled proxy transport: partition router in front of one
/// coalescer → cache → throttle → policy chain per credential.
pub struct GhCache {
    router: PartitioningTransport,
    pruner: Option<JoinHandle<()>>,
}

impl GhCache {
    /// Validate `config` and build a proxy that calls the configured upstream
    /// with reqwest.
    pub async fn from_config(config: &ProxyConfig) -> Result<Self> {
        config.validate()?;
        let upstream = HttpTransport::new(&config.http_transport_config())?;
        GhCacheBuilder::from_config(config)
            .build(Arc::new(upstream))
            .await
    }

    pub fn partition_count(&self) -> usize {
        self.router.partition_count()
    }

    pub fn has_pruner(&self) -> bool {
        self.pruner.is_some()
    }
}

impl Drop for GhCache {
    fn drop(&mut self) {
        if let Some(pruner) = self.pruner.take() {
            pruner.abort();
        }
    }
}

#[async_trait]
impl RoundTrip for GhCache {
    async fn round_trip(&self, req: ProxyRequest) -> Result<ProxyResponse> {
        self.router.round_trip(req).await
    }
}
