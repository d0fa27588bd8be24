//! Header names exchanged at the proxy boundary.

/// Carries the [`CacheMode`](crate::cache::CacheMode) a response was served with.
pub const CACHE_MODE: &str = "x-cache-mode";

/// Unix seconds at which a stored (non-304) upstream response was created.
pub const CACHE_ENTRY_CREATION_DATE: &str = "x-prow-request-date";

/// Optional caller-chosen token budget name; overrides the credential hash for
/// partitioning and metrics.
pub const TOKEN_BUDGET_IDENTIFIER: &str = "x-prow-ghcache-token-budget-identifier";

/// RFC3339 time at which the caller's credential expires; drives partition pruning.
pub const TOKEN_EXPIRES_AT: &str = "x-prow-token-expires-at";

/// Echo of the caller's entity tag when the upstream call was conditional.
pub const CONDITIONAL_REQUEST: &str = "x-conditional-request";

/// GitHub-style status line header; `304 Not Modified` marks a revalidation.
pub const STATUS: &str = "status";

/// Value of [`STATUS`] set on revalidated responses.
pub const STATUS_NOT_MODIFIED: &str = "304 Not Modified";

/// Set to `1` on responses built from a stored cache entry.
pub const FROM_CACHE: &str = "x-from-cache";

/// Prefix of the headers recording request values a stored response varies on.
pub const VARIED_PREFIX: &str = "x-varied-";
