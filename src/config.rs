//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::ratelimit::{FailurePolicy, LimitSettings, DEFAULT_LIMIT, DEFAULT_WINDOW_SECS};

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Force the in-process store backend instead of Redis
    #[serde(default)]
    pub use_memory_store: bool,

    /// Default maximum admissions per identity per window
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Default window length in seconds
    #[serde(default = "default_window_secs")]
    pub default_window_secs: u64,

    /// What admission does when the store is unreachable
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            use_memory_store: false,
            default_limit: default_limit(),
            default_window_secs: default_window_secs(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl RateLimitingConfig {
    /// The default `{limit, window}` pair the registry is seeded with.
    pub fn default_settings(&self) -> LimitSettings {
        LimitSettings {
            limit: self.default_limit,
            window: self.default_window_secs,
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

impl FloodgateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: FloodgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::FloodgateError::Config(e.to_string()))?;
        Ok(config)
    }
}
