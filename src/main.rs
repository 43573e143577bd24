use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber;

use floodgate::config::FloodgateConfig;
use floodgate::http::{AppState, HttpServer};
use floodgate::metrics::MetricsRecorder;
use floodgate::ratelimit::{LeakyBucketDrainer, LimitRegistry, RateLimiter};
use floodgate::store::{MemoryStore, RedisStore, StoreBackend};

/// Floodgate - HTTP rate limiting service
#[derive(Parser, Debug)]
#[command(name = "floodgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the service configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// HTTP server address
    #[arg(short = 'a', long = "addr")]
    addr: Option<String>,

    /// Key-value store URL
    #[arg(long = "redis-url", env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Force the in-process store backend
    #[arg(long = "memory-store", env = "USE_MEMORY_STORE", default_value_t = false)]
    memory_store: bool,

    /// Default maximum admissions per window
    #[arg(long = "limit")]
    limit: Option<u64>,

    /// Default window length in seconds
    #[arg(long = "window")]
    window: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Floodgate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration with CLI overrides
    let mut config = load_config(&args);

    if let Some(ref addr) = args.addr {
        match addr.parse() {
            Ok(addr) => config.server.http_addr = addr,
            Err(e) => warn!(addr = %addr, error = %e, "Ignoring invalid --addr"),
        }
    }
    if let Some(ref redis_url) = args.redis_url {
        config.rate_limiting.redis_url = redis_url.clone();
    }
    if args.memory_store {
        config.rate_limiting.use_memory_store = true;
    }
    if let Some(limit) = args.limit {
        config.rate_limiting.default_limit = limit;
    }
    if let Some(window) = args.window {
        config.rate_limiting.default_window_secs = window;
    }

    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    // Select the store backend, falling back to the in-process fake when
    // Redis is unreachable.
    let store = select_store(&config).await;
    info!(backend = store.kind().type_name(), "Store backend initialized");

    // Wire up the registry, engines, metrics, and the drain worker.
    let registry = Arc::new(LimitRegistry::new(
        store.clone(),
        config.rate_limiting.default_settings(),
    ));
    if let Err(error) = registry.ensure_persisted().await {
        warn!(error = %error, "Could not load persisted rate limit settings, using defaults");
    }

    let limiter = Arc::new(RateLimiter::new(
        store.clone(),
        registry.clone(),
        config.rate_limiting.failure_policy,
    ));
    let metrics = Arc::new(MetricsRecorder::new(store.clone()));

    let drainer = LeakyBucketDrainer::new(store.clone(), registry.clone()).spawn();

    let state = AppState {
        store,
        limiter,
        registry,
        metrics,
    };

    let server = HttpServer::new(config.server.http_addr, state);
    server.serve_with_shutdown(shutdown_signal()).await?;

    drainer.shutdown().await;

    info!("Floodgate Rate Limiting Service stopped");
    Ok(())
}

/// Load the service configuration file, falling back to defaults.
fn load_config(args: &Args) -> FloodgateConfig {
    if let Some(ref config_path) = args.config {
        match FloodgateConfig::from_file(config_path) {
            Ok(config) => {
                info!(path = %config_path, "Service configuration loaded");
                return config;
            }
            Err(e) => {
                warn!(
                    path = %config_path,
                    error = %e,
                    "Failed to load service configuration, using defaults"
                );
            }
        }
    } else {
        info!("No configuration path specified, using defaults");
    }

    FloodgateConfig::default()
}

/// Connect to the configured store, or fall back to the in-process fake.
async fn select_store(config: &FloodgateConfig) -> Arc<dyn StoreBackend> {
    if config.rate_limiting.use_memory_store {
        info!("Using in-process store backend");
        return Arc::new(MemoryStore::new());
    }

    match RedisStore::connect(&config.rate_limiting.redis_url).await {
        Ok(store) => Arc::new(store),
        Err(error) => {
            warn!(
                url = %config.rate_limiting.redis_url,
                error = %error,
                "Could not connect to Redis, falling back to in-process store"
            );
            Arc::new(MemoryStore::new())
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
