//! Key–value store abstraction shared by every rate limiting engine.
//!
//! All rate limit state lives behind [`StoreBackend`], which is implemented
//! by both the networked [`RedisStore`] and the in-process [`MemoryStore`].
//! Sequences that must be observed as a single step by other clients are
//! expressed as dedicated trait operations rather than raw script text:
//! the Redis backend realizes them as server-side Lua scripts, while the
//! in-process backend performs them under a single lock acquisition. Both
//! backends are behaviorally identical at every point the engines can
//! observe.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Which backend a store handle is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// A networked Redis server.
    Redis,
    /// The in-process fake.
    Memory,
}

impl StoreKind {
    /// Whether this backend is the in-process fake.
    pub fn is_fake(&self) -> bool {
        matches!(self, StoreKind::Memory)
    }

    /// Human-readable backend type name, reported by the health endpoint.
    pub fn type_name(&self) -> &'static str {
        match self {
            StoreKind::Redis => "RedisStore",
            StoreKind::Memory => "MemoryStore",
        }
    }
}

/// Operations the rate limiting core requires from the key–value store.
///
/// Any method may suspend at a network boundary; callers must tolerate
/// interleaving between calls. Per-key atomicity of the individual
/// operations and of the `*_admit` / `*_take` / `*_incr` composites is the
/// only ordering guarantee the engines rely on.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Which backend this is, for health reporting.
    fn kind(&self) -> StoreKind;

    /// Verify the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Get a string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a string value, optionally with a time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set a string value only if the key does not exist. Returns whether
    /// the value was written.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    /// Increment an integer counter, returning the post-increment value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Set a key's time-to-live.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys matching a glob pattern (`*` wildcard).
    ///
    /// Used only by the admin reset path; not suitable for hot paths.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Add a member to a set.
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    /// Remove a member from a set.
    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    /// All members of a set.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Cardinality of a set.
    async fn scard(&self, key: &str) -> Result<u64>;

    /// Append a value to the tail of a list, returning the new length.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64>;

    /// Pop the oldest element from the head of a list.
    async fn lpop(&self, key: &str) -> Result<Option<String>>;

    /// Pop the newest element from the tail of a list.
    async fn rpop(&self, key: &str) -> Result<Option<String>>;

    /// Length of a list. Missing keys read as empty.
    async fn llen(&self, key: &str) -> Result<u64>;

    /// Atomically increment a fixed-window counter, arming the window TTL
    /// together with the first increment. Returns the post-increment count.
    async fn fixed_window_incr(&self, key: &str, window: Duration) -> Result<i64>;

    /// Atomically prune entries older than `now - window` from a sliding
    /// log, and add `member` at score `now` iff the pruned cardinality is
    /// below `limit`. The key TTL is refreshed to `window + 1` seconds on
    /// every call. Returns whether the member was added.
    async fn sliding_log_admit(
        &self,
        key: &str,
        now: f64,
        window_secs: u64,
        limit: u64,
        member: &str,
    ) -> Result<bool>;

    /// Atomically admit against a weighted two-slice estimate:
    /// `count(previous) * weight + count(current) < limit`. On admission the
    /// current slice counter is incremented and given `ttl`. Missing slice
    /// counters read as zero. Returns whether the request was admitted.
    async fn sliding_counter_admit(
        &self,
        current_key: &str,
        previous_key: &str,
        weight: f64,
        limit: u64,
        ttl: Duration,
    ) -> Result<bool>;

    /// Atomically refill a token bucket to `now` (at `refill_rate` tokens
    /// per second, capacity `limit`) and take one token if at least one is
    /// available. The record is written back with `ttl` whether or not a
    /// token was taken. Returns whether a token was taken.
    async fn token_bucket_take(
        &self,
        key: &str,
        now: f64,
        limit: u64,
        refill_rate: f64,
        ttl: Duration,
    ) -> Result<bool>;
}

/// Serialized token bucket record, shared by both backends.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TokenBucketState {
    /// Tokens currently available, in `[0, limit]`.
    pub tokens: f64,
    /// Unix timestamp (seconds) of the last refill.
    pub last_refill: f64,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::FloodgateError;

    /// A backend whose every operation fails, for failure-policy tests.
    #[derive(Debug, Default)]
    pub struct FailingStore;

    fn down<T>() -> Result<T> {
        Err(FloodgateError::Store("store unreachable".to_string()))
    }

    #[async_trait]
    impl StoreBackend for FailingStore {
        fn kind(&self) -> StoreKind {
            StoreKind::Memory
        }

        async fn ping(&self) -> Result<()> {
            down()
        }

        async fn get(&self, _key: &str) -> Result<Option<String>> {
            down()
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
            down()
        }

        async fn set_if_absent(&self, _key: &str, _value: &str) -> Result<bool> {
            down()
        }

        async fn incr(&self, _key: &str) -> Result<i64> {
            down()
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
            down()
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            down()
        }

        async fn keys(&self, _pattern: &str) -> Result<Vec<String>> {
            down()
        }

        async fn sadd(&self, _key: &str, _member: &str) -> Result<()> {
            down()
        }

        async fn srem(&self, _key: &str, _member: &str) -> Result<()> {
            down()
        }

        async fn smembers(&self, _key: &str) -> Result<Vec<String>> {
            down()
        }

        async fn scard(&self, _key: &str) -> Result<u64> {
            down()
        }

        async fn rpush(&self, _key: &str, _value: &str) -> Result<u64> {
            down()
        }

        async fn lpop(&self, _key: &str) -> Result<Option<String>> {
            down()
        }

        async fn rpop(&self, _key: &str) -> Result<Option<String>> {
            down()
        }

        async fn llen(&self, _key: &str) -> Result<u64> {
            down()
        }

        async fn fixed_window_incr(&self, _key: &str, _window: Duration) -> Result<i64> {
            down()
        }

        async fn sliding_log_admit(
            &self,
            _key: &str,
            _now: f64,
            _window_secs: u64,
            _limit: u64,
            _member: &str,
        ) -> Result<bool> {
            down()
        }

        async fn sliding_counter_admit(
            &self,
            _current_key: &str,
            _previous_key: &str,
            _weight: f64,
            _limit: u64,
            _ttl: Duration,
        ) -> Result<bool> {
            down()
        }

        async fn token_bucket_take(
            &self,
            _key: &str,
            _now: f64,
            _limit: u64,
            _refill_rate: f64,
            _ttl: Duration,
        ) -> Result<bool> {
            down()
        }
    }
}
