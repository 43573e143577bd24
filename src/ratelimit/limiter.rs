//! Admission engines for the five rate limiting algorithms.
//!
//! Every engine keys its state on the client identity and leans on the
//! store for atomicity: the multi-step sequences execute as single
//! server-side units, so concurrent requests across any number of service
//! processes cannot interleave inside a decision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::store::StoreBackend;

use super::keys;
use super::{Algorithm, LimitRegistry, LimitSettings};

/// Monotonic suffix distinguishing sliding log members that share a
/// timestamp.
static MEMBER_SEQ: AtomicU64 = AtomicU64::new(0);

/// The outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed to the protected payload.
    Admit,
    /// The request is rejected with a too-many-requests response.
    Reject,
}

impl Decision {
    /// Whether the request was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }

    fn from_admitted(admitted: bool) -> Self {
        if admitted {
            Decision::Admit
        } else {
            Decision::Reject
        }
    }
}

/// What to do when the store is unreachable during an admission check.
///
/// The leaky bucket always rejects on enqueue failure regardless of this
/// policy, since an unenqueued request has no slot the drainer could leak.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit when the store cannot be consulted (availability first).
    #[default]
    Open,
    /// Reject when the store cannot be consulted.
    Closed,
}

/// The rate limiting decision engine.
///
/// Thread-safe and shared across all in-flight requests.
pub struct RateLimiter {
    store: Arc<dyn StoreBackend>,
    registry: Arc<LimitRegistry>,
    failure_policy: FailurePolicy,
}

impl RateLimiter {
    /// Create a limiter over the given store and settings registry.
    pub fn new(
        store: Arc<dyn StoreBackend>,
        registry: Arc<LimitRegistry>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            store,
            registry,
            failure_policy,
        }
    }

    /// Check whether a request from `identity` is admitted under
    /// `algorithm`, using the current dynamic settings.
    pub async fn check(&self, identity: &str, algorithm: Algorithm) -> Decision {
        let limits = self.registry.load().await;

        trace!(
            identity = %identity,
            algorithm = %algorithm,
            limit = limits.limit,
            window = limits.window,
            "Checking rate limit"
        );

        let result = match algorithm {
            Algorithm::FixedWindow => self.fixed_window(identity, limits).await,
            Algorithm::SlidingWindowLog => self.sliding_window_log(identity, limits).await,
            Algorithm::SlidingWindowCounter => self.sliding_window_counter(identity, limits).await,
            Algorithm::TokenBucket => self.token_bucket(identity, limits).await,
            Algorithm::LeakyBucket => self.leaky_bucket(identity, limits).await,
        };

        match result {
            Ok(decision) => {
                if decision == Decision::Reject {
                    debug!(
                        identity = %identity,
                        algorithm = %algorithm,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(error) => {
                warn!(
                    identity = %identity,
                    algorithm = %algorithm,
                    error = %error,
                    "Store error during admission check"
                );
                match (algorithm, self.failure_policy) {
                    (Algorithm::LeakyBucket, _) => Decision::Reject,
                    (_, FailurePolicy::Open) => Decision::Admit,
                    (_, FailurePolicy::Closed) => Decision::Reject,
                }
            }
        }
    }

    /// Increment the window counter, arming the TTL together with the first
    /// increment. Admitted while the count stays within the limit.
    async fn fixed_window(&self, identity: &str, limits: LimitSettings) -> Result<Decision> {
        let key = keys::fixed_window(identity);
        let count = self
            .store
            .fixed_window_incr(&key, limits.window_duration())
            .await?;
        Ok(Decision::from_admitted(count as u64 <= limits.limit))
    }

    /// Prune timestamps older than one window, then add this request's
    /// timestamp iff fewer than `limit` remain.
    async fn sliding_window_log(&self, identity: &str, limits: LimitSettings) -> Result<Decision> {
        let key = keys::sliding_window_log(identity);
        let now = unix_now();
        let member = format!("{:.6}-{}", now, MEMBER_SEQ.fetch_add(1, Ordering::Relaxed));
        let admitted = self
            .store
            .sliding_log_admit(&key, now, limits.window, limits.limit, &member)
            .await?;
        Ok(Decision::from_admitted(admitted))
    }

    /// Weight the previous slice's count by how little of the current slice
    /// has elapsed and admit while the estimate stays below the limit.
    async fn sliding_window_counter(
        &self,
        identity: &str,
        limits: LimitSettings,
    ) -> Result<Decision> {
        let now = unix_now();
        let window = limits.window as f64;
        let slice = (now / window).floor() as i64;
        let offset = (now % window) / window;

        let current_key = keys::sliding_window_counter(identity, slice);
        let previous_key = keys::sliding_window_counter(identity, slice - 1);
        let admitted = self
            .store
            .sliding_counter_admit(
                &current_key,
                &previous_key,
                1.0 - offset,
                limits.limit,
                2 * limits.window_duration(),
            )
            .await?;
        Ok(Decision::from_admitted(admitted))
    }

    /// Refill the bucket to now and take one token if available.
    async fn token_bucket(&self, identity: &str, limits: LimitSettings) -> Result<Decision> {
        let key = keys::token_bucket(identity);
        let admitted = self
            .store
            .token_bucket_take(
                &key,
                unix_now(),
                limits.limit,
                limits.per_second_rate(),
                limits.window_duration(),
            )
            .await?;
        Ok(Decision::from_admitted(admitted))
    }

    /// Enqueue the request; if the queue overflowed the capacity, undo the
    /// enqueue and reject. Admitted entries are drained by the background
    /// worker at the leak rate.
    async fn leaky_bucket(&self, identity: &str, limits: LimitSettings) -> Result<Decision> {
        let key = keys::leaky_bucket(identity);
        let length = self.store.rpush(&key, &format!("{:.6}", unix_now())).await?;
        if length > limits.limit {
            self.store.rpop(&key).await?;
            return Ok(Decision::Reject);
        }

        self.store
            .sadd(keys::ACTIVE_LEAKY_BUCKETS, identity)
            .await?;
        Ok(Decision::Admit)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

/// Current Unix time in fractional seconds.
fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}
