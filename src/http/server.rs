//! HTTP server implementation.

use std::net::SocketAddr;

use axum::routing::{get, post};
use axum::Router;
use tracing::{error, info};

use crate::error::{FloodgateError, Result};

use super::handlers::{self, AppState};

/// HTTP server for the rate limiting service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared handler state
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Build the service router.
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/", get(handlers::root))
            .route("/api/image/{width}/{height}", get(handlers::get_image))
            .route("/api/monitor", get(handlers::monitor))
            .route("/api/config", post(handlers::update_config))
            .route("/api/reset", post(handlers::reset))
            .route("/api/health", get(handlers::health))
            .with_state(state)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            Self::router(self.state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            FloodgateError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRecorder;
    use crate::ratelimit::{FailurePolicy, LimitRegistry, LimitSettings, RateLimiter};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(LimitRegistry::new(store.clone(), LimitSettings::default()));
        let state = AppState {
            store: store.clone(),
            limiter: Arc::new(RateLimiter::new(
                store.clone(),
                registry.clone(),
                FailurePolicy::Open,
            )),
            registry,
            metrics: Arc::new(MetricsRecorder::new(store)),
        };
        let _server = HttpServer::new(addr, state);
    }
}
