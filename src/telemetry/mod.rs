//! Telemetry: outbound metrics reporting.
//!
//! The crate only emits through the [`metrics`] facade; installing a
//! recorder/exporter is the embedding process's job. Label values are
//! simplified before use so per-path and per-user-agent series stay bounded.
//!
//! | Metric | Kind | Labels |
//! |--------|------|--------|
//! | `pending_outbound_requests` | gauge | |
//! | `concurrent_outbound_requests` | gauge | |
//! | `ghcache_cache_partitions` | counter | `token_hash` |
//! | `ghcache_responses` | counter | `mode`, `path`, `user_agent`, `token_hash` |
//! | `github_token_usage` | gauge | `token_hash`, `api_version`, `ratelimit_resource` |
//! | `github_token_reset_seconds` | gauge | `token_hash`, `api_version`, `ratelimit_resource` |
//! | `github_request_duration` | histogram | `token_hash`, `path`, `status`, `user_agent` |
//! | `github_request_timeouts` | counter | `token_hash`, `path`, `user_agent` |

use http::HeaderMap;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Once;
use std::time::Duration;

pub const PENDING_OUTBOUND_REQUESTS: &str = "pending_outbound_requests";
pub const CONCURRENT_OUTBOUND_REQUESTS: &str = "concurrent_outbound_requests";
pub const CACHE_PARTITIONS: &str = "ghcache_cache_partitions";
pub const CACHE_RESPONSES: &str = "ghcache_responses";
pub const TOKEN_USAGE: &str = "github_token_usage";
pub const TOKEN_RESET_SECONDS: &str = "github_token_reset_seconds";
pub const REQUEST_DURATION: &str = "github_request_duration";
pub const REQUEST_TIMEOUTS: &str = "github_request_timeouts";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Register metric descriptions with the installed recorder (idempotent).
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_gauge!(
            PENDING_OUTBOUND_REQUESTS,
            Unit::Count,
            "How many pending requests are waiting to be sent to GitHub servers."
        );
        describe_gauge!(
            CONCURRENT_OUTBOUND_REQUESTS,
            Unit::Count,
            "How many concurrent requests are in flight to GitHub servers."
        );
        describe_counter!(
            CACHE_PARTITIONS,
            Unit::Count,
            "Which cache partitions exist."
        );
        describe_counter!(
            CACHE_RESPONSES,
            Unit::Count,
            "How many cache responses of each cache response mode there are."
        );
        describe_gauge!(
            TOKEN_USAGE,
            Unit::Count,
            "How many GitHub API tokens remain for each token budget."
        );
        describe_gauge!(
            TOKEN_RESET_SECONDS,
            Unit::Seconds,
            "Seconds until the GitHub API token budget resets."
        );
        describe_histogram!(
            REQUEST_DURATION,
            Unit::Seconds,
            "GitHub request round-trip duration in seconds."
        );
        describe_counter!(
            REQUEST_TIMEOUTS,
            Unit::Count,
            "How many GitHub requests failed without a response."
        );
    });
}

static NUMERIC_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+$").expect("valid regex"));
static SHA_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{40}$").expect("valid regex"));

/// Collapse high-cardinality path segments (numbers, commit SHAs).
pub fn simplify_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if NUMERIC_SEGMENT.is_match(segment) {
                ":number"
            } else if SHA_SEGMENT.is_match(segment) {
                ":sha"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// `"prow-hook/v20240101 (linux)"` -> `"prow-hook"`.
pub fn user_agent_without_version(user_agent: &str) -> String {
    user_agent
        .split('/')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Remaining quota and reset time as reported by upstream rate-limit headers.
pub fn collect_token_metrics(
    token_hash: &str,
    api_version: &'static str,
    headers: &HeaderMap,
    response_unix_secs: i64,
) {
    let resource = header_str(headers, "x-ratelimit-resource")
        .unwrap_or("core")
        .to_string();
    let labels = [
        ("token_hash", token_hash.to_string()),
        ("api_version", api_version.to_string()),
        ("ratelimit_resource", resource),
    ];

    if let Some(remaining) =
        header_str(headers, "x-ratelimit-remaining").and_then(|v| v.parse::<f64>().ok())
    {
        gauge!(TOKEN_USAGE, &labels).set(remaining);
    }
    if let Some(reset) = header_str(headers, "x-ratelimit-reset").and_then(|v| v.parse::<i64>().ok())
    {
        gauge!(TOKEN_RESET_SECONDS, &labels).set((reset - response_unix_secs).max(0) as f64);
    }
}

pub fn collect_request_metrics(
    token_hash: &str,
    path: &str,
    status: u16,
    user_agent: &str,
    round_trip: Duration,
) {
    histogram!(
        REQUEST_DURATION,
        "token_hash" => token_hash.to_string(),
        "path" => simplify_path(path),
        "status" => status.to_string(),
        "user_agent" => user_agent_without_version(user_agent)
    )
    .record(round_trip.as_secs_f64());
}

pub fn collect_request_timeout(token_hash: &str, path: &str, user_agent: &str) {
    counter!(
        REQUEST_TIMEOUTS,
        "token_hash" => token_hash.to_string(),
        "path" => simplify_path(path),
        "user_agent" => user_agent_without_version(user_agent)
    )
    .increment(1);
}

pub fn collect_cache_response(mode: &str, path: &str, user_agent: &str, token_hash: &str) {
    counter!(
        CACHE_RESPONSES,
        "mode" => mode.to_string(),
        "path" => simplify_path(path),
        "user_agent" => user_agent_without_version(user_agent),
        "token_hash" => token_hash.to_string()
    )
    .increment(1);
}

pub fn record_partition_created(token_hash: &str) {
    counter!(CACHE_PARTITIONS, "token_hash" => token_hash.to_string()).increment(1);
}

pub(crate) fn pending_outbound(delta: f64) {
    gauge!(PENDING_OUTBOUND_REQUESTS).increment(delta);
}

pub(crate) fn concurrent_outbound(delta: f64) {
    gauge!(CONCURRENT_OUTBOUND_REQUESTS).increment(delta);
}
