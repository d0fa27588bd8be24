//! 缓存分区：按凭据隔离缓存，并按凭据过期时间清理。
//!
//! # Cache Partitions
//!
//! Every credential gets its own transport chain and, for the disk backend,
//! its own pair of directories. A partition is keyed by the caller's explicit
//! token budget identifier or, failing that, the sha256 of its
//! `Authorization` header.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`PartitioningTransport`] | Lazily builds and caches one chain per partition |
//! | [`TokenHasher`] | Memoized credential hashing shared with metrics |
//! | [`PartitionMetadata`] | `{"expires_at": ...}` stored next to a partition |
//! | [`Pruner`] | Periodic removal of expired partitions |

mod hasher;
mod metadata;
mod pruner;
mod router;

pub use hasher::TokenHasher;
pub use metadata::{write_partition_metadata, PartitionMetadata, METADATA_FILE_NAME};
pub use pruner::{Clock, PruneReport, Pruner, SystemClock};
pub use router::{token_expiry, PartitionFactory, PartitioningTransport};

use crate::cache::sha256_hex;

/// Directory name for a partition key. Keys that are not a single plain path
/// component are replaced by their sha256.
pub fn partition_dir_name(key: &str) -> String {
    let plain = !key.is_empty()
        && key != "."
        && key != ".."
        && !key.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
        && key.len() <= 128;
    if plain {
        key.to_string()
    } else {
        sha256_hex(key.as_bytes())
    }
}
