//! Store key shapes for rate limit state.
//!
//! Every piece of shared state lives under one of these keys; the reset
//! operation deletes exactly this namespace and nothing else.

use super::Algorithm;

/// Persisted dynamic `{limit, window}` configuration.
pub const CONFIG: &str = "config:rate_limit";

/// Global counter of every request observed.
pub const TOTAL_REQUESTS: &str = "global:total_requests";

/// Global counter of every rejected request.
pub const TOTAL_429S: &str = "global:total_429s";

/// Set of every client identity ever observed.
pub const ACTIVE_IPS: &str = "global:active_ips";

/// Set of identities with pending leaky bucket state.
pub const ACTIVE_LEAKY_BUCKETS: &str = "active_leaky_buckets";

/// Glob patterns covering the per-identity state namespaces.
pub const RESET_PATTERNS: &[&str] = &["ratelimit:*", "leaky_bucket:*"];

/// Exactly-named keys deleted by the reset operation.
pub const RESET_KEYS: &[&str] = &[
    ACTIVE_LEAKY_BUCKETS,
    CONFIG,
    TOTAL_REQUESTS,
    TOTAL_429S,
    ACTIVE_IPS,
];

/// Fixed window counter for an identity.
pub fn fixed_window(identity: &str) -> String {
    format!("ratelimit:{}:{}", Algorithm::FixedWindow.as_str(), identity)
}

/// Sliding window log (sorted set of timestamps) for an identity.
pub fn sliding_window_log(identity: &str) -> String {
    format!(
        "ratelimit:{}:{}",
        Algorithm::SlidingWindowLog.as_str(),
        identity
    )
}

/// Counter for one discrete window slice of an identity.
pub fn sliding_window_counter(identity: &str, slice: i64) -> String {
    format!(
        "ratelimit:{}:{}:{}",
        Algorithm::SlidingWindowCounter.as_str(),
        identity,
        slice
    )
}

/// Serialized token bucket record for an identity.
pub fn token_bucket(identity: &str) -> String {
    format!("ratelimit:{}:{}", Algorithm::TokenBucket.as_str(), identity)
}

/// Pending request queue for an identity.
pub fn leaky_bucket(identity: &str) -> String {
    format!("leaky_bucket:{}", identity)
}
