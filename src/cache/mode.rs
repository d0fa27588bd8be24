//! How a response was fulfilled, for observability.

use crate::headers::{CONDITIONAL_REQUEST, STATUS, STATUS_NOT_MODIFIED};
use http::header::CACHE_CONTROL;
use http::HeaderMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheMode {
    /// Internal failure before any upstream response existed.
    Error,
    /// Response is not cacheable.
    NoStore,
    /// Not in cache; proxied and stored.
    Miss,
    /// Stored value was stale: the resource changed and the entry was replaced.
    Changed,
    /// Copy of a response produced for an identical concurrent request.
    Coalesced,
    /// Stored value confirmed current by a conditional request.
    Revalidated,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Error => "ERROR",
            CacheMode::NoStore => "NO-STORE",
            CacheMode::Miss => "MISS",
            CacheMode::Changed => "CHANGED",
            CacheMode::Coalesced => "COALESCED",
            CacheMode::Revalidated => "REVALIDATED",
        }
    }

    /// Whether fulfilling the request cost no API token.
    ///
    /// `Error` counts as free: upstream was never reached successfully.
    pub fn is_free(&self) -> bool {
        matches!(
            self,
            CacheMode::Coalesced | CacheMode::Revalidated | CacheMode::Error
        )
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ERROR" => Ok(CacheMode::Error),
            "NO-STORE" => Ok(CacheMode::NoStore),
            "MISS" => Ok(CacheMode::Miss),
            "CHANGED" => Ok(CacheMode::Changed),
            "COALESCED" => Ok(CacheMode::Coalesced),
            "REVALIDATED" => Ok(CacheMode::Revalidated),
            other => Err(format!("unknown cache mode: {}", other)),
        }
    }
}

fn header_contains(headers: &HeaderMap, name: impl http::header::AsHeaderName, needle: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains(needle))
        .unwrap_or(false)
}

/// Classify a response from its headers.
///
/// Precedence: `no-store`, then a not-modified status marker, then the
/// conditional-request marker, otherwise a miss. Never yields `Error` or
/// `Coalesced`; those are decided by the caller.
pub fn cache_response_mode(headers: &HeaderMap) -> CacheMode {
    if header_contains(headers, CACHE_CONTROL, "no-store") {
        return CacheMode::NoStore;
    }
    if header_contains(headers, STATUS, STATUS_NOT_MODIFIED) {
        return CacheMode::Revalidated;
    }
    if headers
        .get(CONDITIONAL_REQUEST)
        .map(|v| !v.is_empty())
        .unwrap_or(false)
    {
        return CacheMode::Changed;
    }
    CacheMode::Miss
}
