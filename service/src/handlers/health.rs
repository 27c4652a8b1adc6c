//! Health check handler.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    gateway: &'static str,
}

/// `GET /health` - service liveness plus gateway reachability.
///
/// The service stays `ok` when the gateway is degraded; billing signals
/// keep queuing state transitions and reconciliation settles them once
/// the gateway returns.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let gateway = match state.gateway.health_check().await {
        Ok(()) => "ok",
        Err(err) => {
            tracing::warn!(error = %err, "Gateway health check failed");
            "degraded"
        }
    };

    Json(HealthResponse {
        status: "ok",
        gateway,
    })
}
