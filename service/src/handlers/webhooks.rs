//! Gateway webhook handler.
//!
//! The gateway's asynchronous reports are a correction channel, never
//! the primary state driver: a verified `payment_intent.payment_failed`
//! is applied through the same manager path as a call-layer failure
//! signal; cancellation, refund, and dispute reports that disagree with
//! the local record are audited and handed to reconciliation rather
//! than trusted over local state.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use callbill_core::{BillingSession, BillingSessionId, BillingStatus};
use callbill_store::Store;

use crate::error::ApiError;
use crate::state::AppState;

/// The slice of a gateway webhook event we act on.
#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: WebhookObject,
}

#[derive(Debug, Deserialize)]
struct WebhookObject {
    id: String,
    #[serde(default)]
    metadata: WebhookMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookMetadata {
    #[serde(default)]
    billing_session_id: Option<BillingSessionId>,
}

/// Webhook acknowledgement.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    received: bool,
}

/// `POST /webhooks/gateway` - signed gateway event delivery.
pub async fn gateway_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    state
        .gateway
        .verify_webhook(&body, signature)
        .map_err(|_| ApiError::Unauthorized)?;

    let event: WebhookEvent = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed webhook payload: {e}")))?;

    match event.event_type.as_str() {
        "payment_intent.payment_failed" => {
            apply_payment_failure(&state, &event.data.object).await?;
        }
        kind @ ("payment_intent.canceled" | "charge.refunded" | "charge.dispute.created") => {
            apply_state_report(&state, kind, &event.data.object).await?;
        }
        other => {
            tracing::debug!(event_type = other, "Ignoring gateway webhook event");
        }
    }

    Ok(Json(WebhookAck { received: true }))
}

/// Resolve the billing session a webhook object points at, if any.
fn resolve_session(
    state: &Arc<AppState>,
    object: &WebhookObject,
) -> Result<Option<BillingSession>, ApiError> {
    let Some(billing_session_id) = object.metadata.billing_session_id else {
        tracing::warn!(
            object_id = %object.id,
            "Gateway webhook without billing session metadata"
        );
        return Ok(None);
    };

    let session = state.store.get_session(&billing_session_id)?;
    if session.is_none() {
        tracing::warn!(
            billing_session_id = %billing_session_id,
            "Gateway webhook for unknown billing session"
        );
    }
    Ok(session)
}

async fn apply_payment_failure(
    state: &Arc<AppState>,
    object: &WebhookObject,
) -> Result<(), ApiError> {
    let Some(session) = resolve_session(state, object)? else {
        return Ok(());
    };

    state
        .manager
        .handle_payment_failure(session.stream_session_id, "gateway reported payment failure")
        .await?;
    Ok(())
}

/// Compare a gateway-side state report against the local record. A
/// report the local record already reflects is acknowledged and
/// dropped; a disagreement is audited and hands the stream to
/// reconciliation.
async fn apply_state_report(
    state: &Arc<AppState>,
    event_type: &str,
    object: &WebhookObject,
) -> Result<(), ApiError> {
    let Some(session) = resolve_session(state, object)? else {
        return Ok(());
    };

    let agrees = match event_type {
        // A canceled intent means nothing will be captured; any
        // no-money-kept terminal state already reflects that.
        "payment_intent.canceled" => matches!(
            session.status,
            BillingStatus::PaymentFailed | BillingStatus::Refunded | BillingStatus::Failed
        ),
        "charge.refunded" => session.status == BillingStatus::Refunded,
        // A dispute always needs a correction pass.
        _ => false,
    };

    if agrees {
        tracing::debug!(
            billing_session_id = %session.id,
            event_type,
            "Gateway webhook matches local state"
        );
        return Ok(());
    }

    state
        .manager
        .reconcile_webhook_mismatch(
            session.stream_session_id,
            &format!("{event_type} reported for {}", object.id),
        )
        .await?;
    Ok(())
}
