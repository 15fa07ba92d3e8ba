//! Health check endpoint handlers.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::app::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: DatabaseHealth,
    pub event_subscribers: usize,
}

#[derive(Debug, Serialize)]
pub struct DatabaseHealth {
    /// `false` when no database is configured.
    pub configured: bool,
    pub connected: bool,
    pub latency_ms: Option<u64>,
}

/// Simple status response for liveness probes.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

/// Full health check.
///
/// GET /api/health
///
/// 503 when a configured database does not answer.
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<HealthResponse>)> {
    let database = match &state.pool {
        Some(pool) => {
            let start = std::time::Instant::now();
            let connected = persistence::db::ping(pool).await.is_ok();
            DatabaseHealth {
                configured: true,
                connected,
                latency_ms: connected.then(|| start.elapsed().as_millis() as u64),
            }
        }
        None => DatabaseHealth {
            configured: false,
            connected: false,
            latency_ms: None,
        },
    };

    let healthy = !database.configured || database.connected;
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
        event_subscribers: state.services.events.subscriber_count(),
    };

    if healthy {
        Ok(Json(response))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(response)))
    }
}

/// Liveness probe.
///
/// GET /api/health/live
pub async fn live() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "alive".to_string(),
    })
}
