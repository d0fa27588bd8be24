//! Shared remote store backed by Redis.

use super::backend::CacheBackend;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::Config as FredConfig;
use fred::types::Builder;
use tracing::info;

/// Prefix applied to every key, so the cache can share a Redis database.
const KEY_PREFIX: &str = "rediscache:";

const POOL_SIZE: usize = 4;

/// One namespace for every partition: two credentials requesting the same
/// path read each other's stored responses.
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    /// Connect and verify the server answers. Failure is fatal for the caller.
    ///
    /// `address` is either `host:port` or a `redis://` URL.
    pub async fn connect(address: &str) -> Result<Self> {
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("redis://{}", address)
        };
        let config = FredConfig::from_url(&url).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid redis address: {}", e),
                ErrorContext::new()
                    .with_field_path("backend.address")
                    .with_details(address.to_string()),
            )
        })?;
        let pool = Builder::from_config(config)
            .build_pool(POOL_SIZE)
            .map_err(|e| redis_error("build pool", e))?;
        pool.init().await.map_err(|e| redis_error("connect", e))?;
        let _: String = pool.ping(None).await.map_err(|e| redis_error("ping", e))?;
        info!(address = %address, "Connected to redis cache");
        Ok(Self { pool })
    }

    fn key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

fn redis_error(op: &str, err: fred::error::Error) -> Error {
    Error::storage_with_context(
        format!("redis {} failed: {}", op, err),
        ErrorContext::new().with_source("redis_cache"),
    )
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.pool
            .get::<Option<Vec<u8>>, _>(Self::key(key))
            .await
            .map_err(|e| redis_error("get", e))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.pool
            .set::<(), _, _>(Self::key(key), value.to_vec(), None, None, false)
            .await
            .map_err(|e| redis_error("set", e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.pool
            .del::<(), _>(Self::key(key))
            .await
            .map_err(|e| redis_error("delete", e))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
