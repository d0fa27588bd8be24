//! # ghcache
//!
//! 面向 GitHub API 的缓存代理传输层：按凭据分区、合并重复请求、始终重新验证。
//!
//! A caching transport for clients of the GitHub API. Every stored response
//! is revalidated upstream with a conditional request, so callers always see
//! current data while `304 Not Modified` answers spare their rate-limit
//! budget.
//!
//! ## Overview
//!
//! Requests are routed to a partition per credential. Each partition owns a
//! chain of [`RoundTrip`] layers:
//!
//! ```text
//! PartitioningTransport
//!   └─ RequestCoalescer        identical concurrent GET/HEAD share one call
//!       └─ CachingTransport    stored entries + validators
//!           └─ ThrottlingTransport   bounded outbound concurrency
//!               └─ UpstreamPolicyTransport   "store, always revalidate"
//!                   └─ HttpTransport (or any RoundTrip)
//! ```
//!
//! Every response leaves with an `x-cache-mode` header (see [`CacheMode`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ghcache::{GhCache, ProxyConfig, RoundTrip};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> ghcache::Result<()> {
//!     let proxy = GhCache::from_config(&ProxyConfig::from_env()?).await?;
//!
//!     let req = http::Request::get("/repos/rust-lang/rust")
//!         .header("authorization", "Bearer <token>")
//!         .body(Bytes::new())?;
//!     let resp = proxy.round_trip(req).await?;
//!     println!("{} {:?}", resp.status(), resp.headers().get("x-cache-mode"));
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`transport`] | `RoundTrip` trait, upstream client, policy and throttling layers |
//! | [`cache`] | Classifier, storage backends, cache keys, caching layer |
//! | [`coalesce`] | Request coalescing |
//! | [`partition`] | Per-credential routing, partition metadata, pruning |
//! | [`telemetry`] | Metric names and collectors |
//! | [`config`] | YAML / environment configuration |
//! | [`builder`] | Assembles the full proxy transport |

pub mod builder;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod headers;
pub mod partition;
pub mod telemetry;
pub mod transport;

pub use builder::{GhCache, GhCacheBuilder};
pub use cache::{cache_response_mode, CacheBackend, CacheMode, DiskCache, MemoryCache, RedisCache};
pub use coalesce::RequestCoalescer;
pub use config::{BackendConfig, ProxyConfig};
pub use partition::{PartitioningTransport, PruneReport, Pruner, TokenHasher};
pub use transport::{
    round_trip_fn, HttpTransport, HttpTransportConfig, ProxyRequest, ProxyResponse, RoundTrip,
};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
