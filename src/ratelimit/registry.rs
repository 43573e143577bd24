//! Process-wide dynamic rate limit configuration.
//!
//! The registry caches the current `{limit, window}` pair for lock-cheap
//! reads and keeps the store's `config:rate_limit` record as the source of
//! truth, so an update made through any service instance is observed by the
//! others within the refresh interval (bounded staleness, well under one
//! window).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FloodgateError, Result};
use crate::store::StoreBackend;

use super::keys;

/// Default maximum admissions per window.
pub const DEFAULT_LIMIT: u64 = 10;
/// Default window length in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// How stale the cached settings may get before the store is consulted.
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// The dynamic `{limit, window}` pair every engine works from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Maximum admissions per identity per window (or bucket capacity).
    pub limit: u64,
    /// Window length in seconds.
    pub window: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window: DEFAULT_WINDOW_SECS,
        }
    }
}

impl LimitSettings {
    /// The window as a [`Duration`].
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window)
    }

    /// Requests per second: the token bucket refill rate and the leaky
    /// bucket leak rate.
    pub fn per_second_rate(&self) -> f64 {
        self.limit as f64 / self.window as f64
    }

    /// Reject settings outside the accepted range.
    pub fn validate(&self) -> Result<()> {
        if self.limit < 1 {
            return Err(FloodgateError::Config(
                "limit must be at least 1".to_string(),
            ));
        }
        if self.window < 1 {
            return Err(FloodgateError::Config(
                "window must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared registry of the current rate limit settings.
pub struct LimitRegistry {
    store: Arc<dyn StoreBackend>,
    defaults: LimitSettings,
    current: RwLock<LimitSettings>,
    last_refresh: Mutex<Instant>,
    refresh_interval: Duration,
}

impl LimitRegistry {
    /// Create a registry seeded with the given defaults.
    pub fn new(store: Arc<dyn StoreBackend>, defaults: LimitSettings) -> Self {
        Self {
            store,
            defaults,
            current: RwLock::new(defaults),
            last_refresh: Mutex::new(Instant::now()),
            refresh_interval: REFRESH_INTERVAL,
        }
    }

    /// Override the staleness bound. Mainly useful in tests.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// The most recently committed settings, without consulting the store.
    pub fn current(&self) -> LimitSettings {
        *self.current.read()
    }

    /// The current settings, consulting the store first if the cache has
    /// exceeded the staleness bound. Refresh failures keep the cached value
    /// so admission never blocks on a degraded store.
    pub async fn load(&self) -> LimitSettings {
        let due = {
            let mut last = self.last_refresh.lock();
            if last.elapsed() >= self.refresh_interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };

        if due {
            if let Err(error) = self.refresh().await {
                warn!(error = %error, "Failed to refresh rate limit settings from store");
            }
        }

        self.current()
    }

    /// Re-read `config:rate_limit` and commit what it holds. An absent
    /// record (fresh store, or reset by another instance) reverts to the
    /// defaults.
    pub async fn refresh(&self) -> Result<()> {
        let settings = match self.store.get(keys::CONFIG).await? {
            Some(raw) => {
                let settings: LimitSettings = serde_json::from_str(&raw)?;
                settings.validate()?;
                settings
            }
            None => self.defaults,
        };

        let mut current = self.current.write();
        if *current != settings {
            debug!(
                limit = settings.limit,
                window = settings.window,
                "Observed rate limit settings change"
            );
            *current = settings;
        }
        Ok(())
    }

    /// Persist the defaults as the committed record if no instance has
    /// written one yet, then adopt whatever the store holds. Called once at
    /// startup; the set-if-absent keeps concurrently starting instances
    /// from clobbering an operator's live update.
    pub async fn ensure_persisted(&self) -> Result<()> {
        let raw = serde_json::to_string(&self.defaults)?;
        self.store.set_if_absent(keys::CONFIG, &raw).await?;
        self.refresh().await
    }

    /// Validate, persist, and commit new settings.
    pub async fn update(&self, settings: LimitSettings) -> Result<()> {
        settings.validate()?;

        let raw = serde_json::to_string(&settings)?;
        self.store.set(keys::CONFIG, &raw, None).await?;

        *self.current.write() = settings;
        *self.last_refresh.lock() = Instant::now();

        info!(
            limit = settings.limit,
            window = settings.window,
            "Rate limit settings updated"
        );
        Ok(())
    }

    /// Revert the cached settings to the defaults. Called after the admin
    /// reset deletes the persisted record.
    pub fn reset(&self) {
        *self.current.write() = self.defaults;
        *self.last_refresh.lock() = Instant::now();
    }
}

impl std::fmt::Debug for LimitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitRegistry")
            .field("current", &self.current())
            .field("defaults", &self.defaults)
            .finish()
    }
}
