//! Background worker that drains leaky bucket queues.
//!
//! A single task per process wakes every tick, reloads the dynamic
//! settings, and removes entries from every active bucket at the leak rate
//! (`limit / window` per second). Fractional leakage is carried between
//! ticks as per-bucket credit, so the average drain rate converges to the
//! leak rate regardless of the tick length. Multiple processes may drain
//! concurrently without coordination; popping is atomic, so they simply
//! share the work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::StoreBackend;

use super::keys;
use super::LimitRegistry;

/// Default interval between drain passes.
const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// The leaky bucket drain worker.
pub struct LeakyBucketDrainer {
    store: Arc<dyn StoreBackend>,
    registry: Arc<LimitRegistry>,
    tick: Duration,
    /// Fractional leaked-entry credit per identity, carried between ticks.
    credit: HashMap<String, f64>,
}

impl LeakyBucketDrainer {
    /// Create a drainer with the default one-second tick.
    pub fn new(store: Arc<dyn StoreBackend>, registry: Arc<LimitRegistry>) -> Self {
        Self {
            store,
            registry,
            tick: DEFAULT_TICK,
            credit: HashMap::new(),
        }
    }

    /// Override the tick interval. Mainly useful in tests.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Start the drain loop on the runtime, returning a handle for
    /// graceful shutdown.
    pub fn spawn(self) -> DrainerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        DrainerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(tick = ?self.tick, "Leaky bucket drainer started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so elapsed time is
        // measured from here.
        interval.tick().await;
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Leaky bucket drainer stopping");
                    break;
                }
                _ = interval.tick() => {
                    let elapsed = last_tick.elapsed();
                    last_tick = Instant::now();
                    self.drain(elapsed).await;
                }
            }
        }
    }

    /// One drain pass over every active bucket. A failing bucket is logged
    /// and skipped; it never stops the others.
    pub async fn drain(&mut self, elapsed: Duration) {
        let limits = self.registry.load().await;
        let leak_rate = limits.per_second_rate();

        let identities = match self.store.smembers(keys::ACTIVE_LEAKY_BUCKETS).await {
            Ok(identities) => identities,
            Err(error) => {
                warn!(error = %error, "Failed to list active leaky buckets");
                return;
            }
        };

        // Buckets that disappeared (reset, or drained by another process)
        // must not keep stale credit.
        self.credit
            .retain(|identity, _| identities.contains(identity));

        for identity in identities {
            if let Err(error) = self.drain_bucket(&identity, elapsed, leak_rate).await {
                warn!(
                    identity = %identity,
                    error = %error,
                    "Failed to drain leaky bucket"
                );
            }
        }
    }

    async fn drain_bucket(
        &mut self,
        identity: &str,
        elapsed: Duration,
        leak_rate: f64,
    ) -> Result<()> {
        let leaked = {
            let credit = self.credit.entry(identity.to_string()).or_insert(0.0);
            *credit += elapsed.as_secs_f64() * leak_rate;
            let leaked = credit.floor() as u64;
            *credit -= leaked as f64;
            leaked
        };

        let key = keys::leaky_bucket(identity);
        for _ in 0..leaked {
            if self.store.lpop(&key).await?.is_none() {
                break;
            }
        }

        if leaked > 0 {
            debug!(identity = %identity, leaked = leaked, "Leaked queued requests");
        }

        if self.store.llen(&key).await? == 0 {
            self.store
                .srem(keys::ACTIVE_LEAKY_BUCKETS, identity)
                .await?;
            self.credit.remove(identity);
            debug!(identity = %identity, "Leaky bucket empty, untracked");
        }
        Ok(())
    }
}

impl std::fmt::Debug for LeakyBucketDrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakyBucketDrainer")
            .field("tick", &self.tick)
            .field("tracked_buckets", &self.credit.len())
            .finish_non_exhaustive()
    }
}

/// Handle to a running drainer.
pub struct DrainerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DrainerHandle {
    /// Signal the drainer to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::LimitSettings;
    use crate::store::MemoryStore;

    fn drainer_with(
        store: Arc<MemoryStore>,
        limit: u64,
        window: u64,
    ) -> LeakyBucketDrainer {
        let registry = Arc::new(LimitRegistry::new(
            store.clone(),
            LimitSettings { limit, window },
        ));
        LeakyBucketDrainer::new(store, registry)
    }

    async fn fill_bucket(store: &MemoryStore, identity: &str, entries: u64) {
        for i in 0..entries {
            store
                .rpush(&keys::leaky_bucket(identity), &format!("{}", i))
                .await
                .unwrap();
        }
        store
            .sadd(keys::ACTIVE_LEAKY_BUCKETS, identity)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drains_oldest_at_leak_rate() {
        let store = Arc::new(MemoryStore::new());
        // limit 2 / window 2s: one entry per second.
        let mut drainer = drainer_with(store.clone(), 2, 2);
        fill_bucket(&store, "a", 2).await;

        drainer.drain(Duration::from_secs(1)).await;
        assert_eq!(store.llen(&keys::leaky_bucket("a")).await.unwrap(), 1);
        // The oldest entry went first.
        assert_eq!(
            store.lpop(&keys::leaky_bucket("a")).await.unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn test_fractional_credit_accumulates() {
        let store = Arc::new(MemoryStore::new());
        // limit 1 / window 2s: half an entry per second.
        let mut drainer = drainer_with(store.clone(), 1, 2);
        fill_bucket(&store, "a", 1).await;

        drainer.drain(Duration::from_secs(1)).await;
        assert_eq!(
            store.llen(&keys::leaky_bucket("a")).await.unwrap(),
            1,
            "half a tick of credit must not leak an entry"
        );

        drainer.drain(Duration::from_secs(1)).await;
        assert_eq!(store.llen(&keys::leaky_bucket("a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_bucket_is_untracked() {
        let store = Arc::new(MemoryStore::new());
        let mut drainer = drainer_with(store.clone(), 2, 2);
        fill_bucket(&store, "a", 1).await;

        drainer.drain(Duration::from_secs(2)).await;
        assert_eq!(store.llen(&keys::leaky_bucket("a")).await.unwrap(), 0);
        assert!(store
            .smembers(keys::ACTIVE_LEAKY_BUCKETS)
            .await
            .unwrap()
            .is_empty());
        assert!(drainer.credit.is_empty());
    }

    #[tokio::test]
    async fn test_drains_every_active_bucket() {
        let store = Arc::new(MemoryStore::new());
        let mut drainer = drainer_with(store.clone(), 2, 2);
        fill_bucket(&store, "a", 2).await;
        fill_bucket(&store, "b", 2).await;

        drainer.drain(Duration::from_secs(1)).await;
        assert_eq!(store.llen(&keys::leaky_bucket("a")).await.unwrap(), 1);
        assert_eq!(store.llen(&keys::leaky_bucket("b")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_panic() {
        let failing = Arc::new(crate::store::testing::FailingStore);
        let registry = Arc::new(LimitRegistry::new(
            failing.clone(),
            LimitSettings::default(),
        ));
        let mut drainer = LeakyBucketDrainer::new(failing, registry);
        drainer.drain(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_spawned_drainer_leaks_and_shuts_down() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(LimitRegistry::new(
            store.clone(),
            // limit 10 / window 1s: fast enough to observe within a test.
            LimitSettings { limit: 10, window: 1 },
        ));
        fill_bucket(&store, "a", 3).await;

        let handle = LeakyBucketDrainer::new(store.clone(), registry)
            .with_tick(Duration::from_millis(50))
            .spawn();

        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.shutdown().await;

        assert_eq!(store.llen(&keys::leaky_bucket("a")).await.unwrap(), 0);
    }
}
