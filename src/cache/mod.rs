//! 响应缓存模块：可插拔的存储后端与“总是重新验证”的 HTTP 缓存层。
//!
//! # Response Caching Module
//!
//! Stores upstream responses so that repeated requests can be answered with a
//! conditional round-trip instead of a full one. A stored entry is never
//! trusted as fresh; it only supplies validators, and its body is served when
//! upstream confirms it with `304 Not Modified`.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CachingTransport`] | HTTP cache layer over a [`CacheBackend`] |
//! | [`CacheBackend`] | Get/set/delete capability every store implements |
//! | [`MemoryCache`] | Unbounded in-process map |
//! | [`DiskCache`] | Files under a data directory, staged through a temp directory |
//! | [`RedisCache`] | Remote store shared by every partition |
//! | [`CacheMode`] | How a response was fulfilled, from [`cache_response_mode`] |
//! | [`StoredResponse`] | Serialized form of a stored entry |
//!
//! ## Shared remote store
//!
//! [`RedisCache`] has no notion of partitions. Two credentials requesting the
//! same path read and overwrite the same entry.

mod backend;
mod disk;
mod entry;
mod key;
mod layer;
mod mode;
mod redis;

pub use backend::{CacheBackend, MemoryCache};
pub use disk::DiskCache;
pub use entry::StoredResponse;
pub use key::{cache_key, coalescing_key, sha256_hex};
pub use layer::CachingTransport;
pub use mode::{cache_response_mode, CacheMode};
pub use redis::RedisCache;
