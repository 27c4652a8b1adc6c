//! HTTP route definitions.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{bids, billing, health, webhooks};
use crate::state::AppState;
use crate::ws;

/// Build the service router with all routes and middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = build_cors(&state.config.cors_origins);
    let body_limit = state.config.max_body_bytes;
    let timeout = Duration::from_secs(state.config.request_timeout_seconds);

    Router::new()
        .route("/health", get(health::health))
        .route("/v1/bids", post(bids::place_bid).get(bids::list_bids))
        .route("/v1/bids/:bid_id/accept", post(bids::accept_bid))
        .route("/v1/bids/:bid_id/reject", post(bids::reject_bid))
        .route("/v1/billing/start", post(billing::start))
        .route("/v1/billing/tick", post(billing::tick))
        .route("/v1/billing/end", post(billing::end))
        .route("/v1/billing/payment-failure", post(billing::payment_failure))
        .route("/v1/billing/refund", post(billing::refund))
        .route("/v1/billing/reconcile", post(billing::reconcile))
        .route("/v1/billing/sessions", get(billing::list_sessions))
        .route("/v1/ws", get(ws::ws_handler))
        .route("/webhooks/gateway", post(webhooks::gateway_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}

fn build_cors(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}
