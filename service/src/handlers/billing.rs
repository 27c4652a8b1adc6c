//! Billing signal endpoints.
//!
//! The mutating endpoints are call-layer signals authenticated with the
//! service API key; the call platform, not end users, reports call
//! starts, ticks, and ends. Session listing is end-user facing.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use callbill_core::{BillingSession, BillingSessionId, RateMeterTick, StreamSessionId};

use crate::auth::{AuthUser, ServiceAuth};
use crate::error::ApiError;
use crate::state::AppState;

/// A call-layer signal naming the stream session it concerns.
#[derive(Debug, Deserialize)]
pub struct BillingSignal {
    /// The stream session.
    pub session_id: StreamSessionId,
    /// A specific billing session (refund of a record that is no longer
    /// the stream's latest).
    #[serde(default)]
    pub billing_session_id: Option<BillingSessionId>,
    /// Elapsed call seconds as reported by the call layer (tick
    /// signals).
    #[serde(default)]
    pub elapsed_secs: Option<u64>,
    /// Final call duration in seconds as reported by the call layer
    /// (end signals).
    #[serde(default)]
    pub duration_secs: Option<u64>,
    /// Optional human-readable reason (end and failure signals).
    #[serde(default)]
    pub reason: Option<String>,
}

/// Query parameters for listing sessions.
#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    /// Maximum sessions to return (default 50, capped at 200).
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `POST /v1/billing/start` - the call connected; authorize and start
/// metering.
pub async fn start(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(signal): Json<BillingSignal>,
) -> Result<Json<BillingSession>, ApiError> {
    tracing::debug!(
        service = %auth.service_name,
        stream_session_id = %signal.session_id,
        "Call start signal"
    );
    let session = state.manager.start_call_billing(signal.session_id).await?;
    Ok(Json(session))
}

/// `POST /v1/billing/tick` - periodic accrual tick for an active call.
pub async fn tick(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(signal): Json<BillingSignal>,
) -> Result<Json<RateMeterTick>, ApiError> {
    let tick = state
        .manager
        .tick(signal.session_id, signal.elapsed_secs)
        .await?;
    Ok(Json(tick))
}

/// `POST /v1/billing/end` - the call ended; settle the final amount.
pub async fn end(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(signal): Json<BillingSignal>,
) -> Result<Json<BillingSession>, ApiError> {
    let reason = signal.reason.as_deref().unwrap_or("call ended");
    tracing::debug!(
        service = %auth.service_name,
        stream_session_id = %signal.session_id,
        reason,
        "Call end signal"
    );
    let session = state
        .manager
        .end_call_billing(signal.session_id, signal.duration_secs, reason)
        .await?;
    Ok(Json(session))
}

/// `POST /v1/billing/payment-failure` - an external payment failure
/// report (client decline callback).
pub async fn payment_failure(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(signal): Json<BillingSignal>,
) -> Result<Json<BillingSession>, ApiError> {
    let reason = signal.reason.as_deref().unwrap_or("payment failed");
    let session = state
        .manager
        .handle_payment_failure(signal.session_id, reason)
        .await?;
    Ok(Json(session))
}

/// `POST /v1/billing/refund` - refund a failed settlement.
pub async fn refund(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(signal): Json<BillingSignal>,
) -> Result<Json<BillingSession>, ApiError> {
    let session = state
        .manager
        .process_refund(signal.session_id, signal.billing_session_id)
        .await?;
    Ok(Json(session))
}

/// `POST /v1/billing/reconcile` - reconcile one stream's billing state
/// on demand.
pub async fn reconcile(
    State(state): State<Arc<AppState>>,
    _auth: ServiceAuth,
    Json(signal): Json<BillingSignal>,
) -> Result<Json<BillingSession>, ApiError> {
    let session = state.manager.reconcile(signal.session_id).await?;
    Ok(Json(session))
}

/// `GET /v1/billing/sessions` - the authenticated user's billing
/// history, most recent first.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Vec<BillingSession>>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(200);
    let sessions = state.manager.list_user_sessions(&user.user_id, limit)?;
    Ok(Json(sessions))
}
