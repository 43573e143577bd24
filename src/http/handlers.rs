//! HTTP request handlers: the admission orchestrator and the admin surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::Result;
use crate::metrics::MetricsRecorder;
use crate::ratelimit::{keys, Algorithm, LimitRegistry, LimitSettings, RateLimiter};
use crate::store::StoreBackend;

use super::identity::client_identity;
use super::image::placeholder_svg;

/// Shared state every handler works from.
#[derive(Clone)]
pub struct AppState {
    /// The store, reachable directly for the admin surface.
    pub store: Arc<dyn StoreBackend>,
    /// The admission decision engine.
    pub limiter: Arc<RateLimiter>,
    /// The dynamic settings registry.
    pub registry: Arc<LimitRegistry>,
    /// Best-effort global metrics.
    pub metrics: Arc<MetricsRecorder>,
}

#[derive(Debug, Deserialize)]
pub struct AdmissionQuery {
    /// Requested algorithm; unknown or absent values use the default.
    algo: Option<String>,
}

/// The rate limited payload endpoint.
///
/// Orchestrates a request end to end: derive the identity, record the
/// request, pick the algorithm, ask the engine, and map the decision to a
/// payload or a too-many-requests response.
pub async fn get_image(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((width, height)): Path<(u32, u32)>,
    Query(query): Query<AdmissionQuery>,
    headers: HeaderMap,
) -> Response {
    let identity = client_identity(peer, &headers);
    state.metrics.record_request(&identity).await;

    let algorithm = query
        .algo
        .as_deref()
        .map(|raw| raw.parse().unwrap_or_default())
        .unwrap_or_default();

    let decision = state.limiter.check(&identity, algorithm).await;
    debug!(
        identity = %identity,
        algorithm = %algorithm,
        admitted = decision.is_admitted(),
        "Admission decision made"
    );

    if !decision.is_admitted() {
        state.metrics.record_rejection().await;
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"detail": "Rate limit exceeded. Try again later."})),
        )
            .into_response();
    }

    (
        [(header::CONTENT_TYPE, "image/svg+xml")],
        placeholder_svg(width, height),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    limit: i64,
    window: i64,
}

/// Update the dynamic `{limit, window}` configuration.
pub async fn update_config(
    State(state): State<AppState>,
    Json(body): Json<ConfigUpdate>,
) -> Response {
    if body.limit < 1 || body.window < 1 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "limit and window must be at least 1"})),
        )
            .into_response();
    }

    let settings = LimitSettings {
        limit: body.limit as u64,
        window: body.window as u64,
    };
    match state.registry.update(settings).await {
        Ok(()) => Json(json!({
            "status": "success",
            "message": format!(
                "Updated config: limit={}, window={}s",
                settings.limit, settings.window
            ),
        }))
        .into_response(),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "message": error.to_string()})),
        )
            .into_response(),
    }
}

/// Delete every rate limit key, clear the global counters, and revert the
/// settings registry to its defaults.
pub async fn reset(State(state): State<AppState>) -> Response {
    match reset_all(&state).await {
        Ok(()) => {
            info!("All rate limit state and metrics reset");
            Json(json!({
                "status": "success",
                "message": "All rate limit state and metrics reset",
            }))
            .into_response()
        }
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "message": error.to_string()})),
        )
            .into_response(),
    }
}

async fn reset_all(state: &AppState) -> Result<()> {
    for pattern in keys::RESET_PATTERNS {
        for key in state.store.keys(pattern).await? {
            state.store.delete(&key).await?;
        }
    }
    for key in keys::RESET_KEYS {
        state.store.delete(key).await?;
    }
    state.registry.reset();
    Ok(())
}

/// Store reachability probe.
pub async fn health(State(state): State<AppState>) -> Response {
    let kind = state.store.kind();
    match health_probe(&state).await {
        Ok(test_write) => Json(json!({
            "status": "healthy",
            "redis": {
                "connected": true,
                "is_fakeredis": kind.is_fake(),
                "type": kind.type_name(),
                "test_write": test_write,
            },
            "api": "running",
        }))
        .into_response(),
        Err(error) => Json(json!({
            "status": "unhealthy",
            "redis": {
                "connected": false,
                "error": error.to_string(),
            },
            "api": "running",
        }))
        .into_response(),
    }
}

async fn health_probe(state: &AppState) -> Result<bool> {
    state.store.ping().await?;
    state
        .store
        .set("health_check_test", "working", Some(Duration::from_secs(10)))
        .await?;
    let value = state.store.get("health_check_test").await?;
    Ok(value.as_deref() == Some("working"))
}

/// Telemetry for the monitoring dashboard.
pub async fn monitor(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.metrics.snapshot().await;
    let settings = state.registry.load().await;

    let algorithm_data: serde_json::Map<String, serde_json::Value> = Algorithm::ALL
        .iter()
        .map(|algorithm| {
            (
                algorithm.as_str().to_string(),
                json!({"limit": settings.limit, "window": settings.window}),
            )
        })
        .collect();

    Json(json!({
        "globalMetrics": {
            "totalRequests": snapshot.total_requests,
            "total429s": snapshot.total_429s,
            "activeIPs": snapshot.active_identities,
        },
        "algorithmData": algorithm_data,
    }))
}

/// API index.
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Floodgate rate limiting service is running",
        "endpoints": {
            "health": "/api/health",
            "image": "/api/image/{width}/{height}",
            "monitor": "/api/monitor",
            "config": "/api/config",
            "reset": "/api/reset",
        },
    }))
}
