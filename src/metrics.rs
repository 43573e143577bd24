//! Best-effort global request metrics.
//!
//! Counters live in the store so every service instance contributes to the
//! same totals. Recording never blocks or fails an admission: a store error
//! here is logged and dropped.

use std::sync::Arc;

use tracing::warn;

use crate::ratelimit::keys;
use crate::store::StoreBackend;

/// Point-in-time view of the global counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Every request observed since the last reset.
    pub total_requests: u64,
    /// Every rejection since the last reset.
    pub total_429s: u64,
    /// Distinct client identities observed since the last reset.
    pub active_identities: u64,
}

/// Records global request metrics into the store.
pub struct MetricsRecorder {
    store: Arc<dyn StoreBackend>,
}

impl MetricsRecorder {
    /// Create a recorder over the given store.
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        Self { store }
    }

    /// Count an observed request and remember its identity.
    pub async fn record_request(&self, identity: &str) {
        if let Err(error) = self.store.incr(keys::TOTAL_REQUESTS).await {
            warn!(error = %error, "Failed to record request metric");
        }
        if let Err(error) = self.store.sadd(keys::ACTIVE_IPS, identity).await {
            warn!(error = %error, "Failed to record active identity");
        }
    }

    /// Count a rejected request.
    pub async fn record_rejection(&self) {
        if let Err(error) = self.store.incr(keys::TOTAL_429S).await {
            warn!(error = %error, "Failed to record rejection metric");
        }
    }

    /// Read the current counters. Missing or unreadable values report as
    /// zero rather than failing the monitoring surface.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.read_counter(keys::TOTAL_REQUESTS).await,
            total_429s: self.read_counter(keys::TOTAL_429S).await,
            active_identities: self.store.scard(keys::ACTIVE_IPS).await.unwrap_or_else(
                |error| {
                    warn!(error = %error, "Failed to read active identity count");
                    0
                },
            ),
        }
    }

    async fn read_counter(&self, key: &str) -> u64 {
        match self.store.get(key).await {
            Ok(value) => value.and_then(|raw| raw.parse().ok()).unwrap_or(0),
            Err(error) => {
                warn!(key = %key, error = %error, "Failed to read metric counter");
                0
            }
        }
    }
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder").finish_non_exhaustive()
    }
}
