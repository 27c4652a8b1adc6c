//! Billing session lifecycle integration tests.

mod common;

use common::TestHarness;
use serde_json::json;

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn flat_bid_call_settles_at_bid_amount() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;

    let response = harness.billing_signal("start", &stream).await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "active");
    assert!(body["payment_intent_id"].is_string());

    let response = harness.billing_signal("tick", &stream).await;
    response.assert_status_ok();
    let tick: serde_json::Value = response.json();
    assert_eq!(tick["accrued_cents"], 2500);

    let response = harness.billing_signal("end", &stream).await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["charged_cents"], 2500);
    assert!(body["charge_id"].is_string());

    assert_eq!(harness.gateway.authorize_calls(), 1);
    assert_eq!(harness.gateway.capture_calls(), 1);
    assert_eq!(harness.gateway.refund_calls(), 0);
}

#[tokio::test]
async fn events_are_published_in_transition_order() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;
    let mut receiver = harness.state.broadcaster.subscribe(harness.explorer_id);

    harness.billing_signal("start", &stream).await.assert_status_ok();
    harness.billing_signal("tick", &stream).await.assert_status_ok();
    harness.billing_signal("end", &stream).await.assert_status_ok();

    let kinds: Vec<&str> = std::iter::from_fn(|| receiver.try_recv().ok())
        .map(|envelope| envelope.event.kind())
        .collect();
    assert_eq!(
        kinds,
        ["BILLING_STARTED", "BILLING_UPDATED", "BILLING_COMPLETED"]
    );
}

#[tokio::test]
async fn reported_duration_governs_per_minute_settlement() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid_with_rate(2500, 100).await;

    harness.billing_signal("start", &stream).await.assert_status_ok();

    let response = harness
        .billing_signal_with(
            "tick",
            json!({ "session_id": stream, "elapsed_secs": 61 }),
        )
        .await;
    response.assert_status_ok();
    let tick: serde_json::Value = response.json();
    assert_eq!(tick["accrued_cents"], 2700);

    let response = harness
        .billing_signal_with(
            "end",
            json!({ "session_id": stream, "duration_secs": 180 }),
        )
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["duration_secs"], 180);
    assert_eq!(body["charged_cents"], 2800);
}

// ============================================================================
// Idempotent end
// ============================================================================

#[tokio::test]
async fn duplicate_end_signal_is_absorbed() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;

    harness.billing_signal("start", &stream).await.assert_status_ok();

    let first = harness.billing_signal("end", &stream).await;
    first.assert_status_ok();
    let first: serde_json::Value = first.json();

    let second = harness.billing_signal("end", &stream).await;
    second.assert_status_ok();
    let second: serde_json::Value = second.json();

    assert_eq!(first["charged_cents"], second["charged_cents"]);
    assert_eq!(first["duration_secs"], second["duration_secs"]);
    assert_eq!(harness.gateway.capture_calls(), 1);
}

#[tokio::test]
async fn second_end_with_longer_duration_is_ignored() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid_with_rate(2500, 100).await;
    harness.billing_signal("start", &stream).await.assert_status_ok();

    let first = harness
        .billing_signal_with(
            "end",
            json!({ "session_id": stream, "duration_secs": 180 }),
        )
        .await;
    first.assert_status_ok();

    let second = harness
        .billing_signal_with(
            "end",
            json!({ "session_id": stream, "duration_secs": 185 }),
        )
        .await;
    second.assert_status_ok();
    let body: serde_json::Value = second.json();

    // The first end fixed the settlement; the longer duration is dropped.
    assert_eq!(body["duration_secs"], 180);
    assert_eq!(body["charged_cents"], 2800);
    assert_eq!(harness.gateway.capture_calls(), 1);
}

#[tokio::test]
async fn late_tick_after_settlement_is_absorbed() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;
    harness.billing_signal("start", &stream).await.assert_status_ok();
    harness.billing_signal("end", &stream).await.assert_status_ok();

    let response = harness
        .billing_signal_with(
            "tick",
            json!({ "session_id": stream, "elapsed_secs": 600 }),
        )
        .await;
    response.assert_status_ok();
    let tick: serde_json::Value = response.json();
    assert_eq!(tick["accrued_cents"], 2500);

    // The settled record is untouched.
    let session = harness
        .state
        .manager
        .latest_session(&stream.parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(session.status, callbill_core::BillingStatus::Completed);
    assert_eq!(session.charged_cents, Some(2500));
}

#[tokio::test]
async fn end_before_start_fails_session_without_gateway_calls() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;

    let response = harness.billing_signal("end", &stream).await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "payment_failed");
    assert_eq!(harness.gateway.authorize_calls(), 0);
    assert_eq!(harness.gateway.capture_calls(), 0);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn declined_authorization_fails_the_session() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;
    let mut receiver = harness.state.broadcaster.subscribe(harness.explorer_id);
    harness.gateway.fail_authorize(true);

    let response = harness.billing_signal("start", &stream).await;
    response.assert_status(axum::http::StatusCode::BAD_GATEWAY);

    let session = harness
        .state
        .manager
        .latest_session(&stream.parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(session.status, callbill_core::BillingStatus::PaymentFailed);
    assert!(session.charged_cents.is_none());

    // Subscribers only ever see the failure; billing never started.
    let kinds: Vec<&str> = std::iter::from_fn(|| receiver.try_recv().ok())
        .map(|envelope| envelope.event.kind())
        .collect();
    assert_eq!(kinds, ["PAYMENT_FAILED"]);
}

#[tokio::test]
async fn failed_capture_refunds_the_authorization() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;

    harness.billing_signal("start", &stream).await.assert_status_ok();
    harness.gateway.fail_capture(true);

    let response = harness.billing_signal("end", &stream).await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "refunded");
    assert!(body["refund_id"].is_string());
    assert!(body["charged_cents"].is_null());
    assert_eq!(harness.gateway.refund_calls(), 1);
}

#[tokio::test]
async fn payment_failure_signal_fails_pending_session() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;

    let response = harness
        .server
        .post("/v1/billing/payment-failure")
        .add_header("x-api-key", harness.service_api_key.clone())
        .json(&json!({ "session_id": stream, "reason": "card_declined" }))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "payment_failed");
    assert_eq!(body["failure_reason"], "card_declined");
}

#[tokio::test]
async fn payment_failure_after_settlement_is_absorbed() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;

    harness.billing_signal("start", &stream).await.assert_status_ok();
    harness.billing_signal("end", &stream).await.assert_status_ok();

    let response = harness
        .server
        .post("/v1/billing/payment-failure")
        .add_header("x-api-key", harness.service_api_key.clone())
        .json(&json!({ "session_id": stream, "reason": "late decline" }))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    // The settled session wins; the report is audited, not applied.
    assert_eq!(body["status"], "completed");
}

// ============================================================================
// Auth and lookups
// ============================================================================

#[tokio::test]
async fn billing_signals_require_service_key() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;

    let response = harness
        .server
        .post("/v1/billing/start")
        .json(&json!({ "session_id": stream }))
        .await;

    response.assert_status_unauthorized();
}

#[tokio::test]
async fn start_for_unknown_stream_not_found() {
    let harness = TestHarness::new();
    let stream = callbill_core::StreamSessionId::generate().to_string();

    let response = harness.billing_signal("start", &stream).await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn users_see_their_session_history_newest_first() {
    let harness = TestHarness::new();

    for amount in [2000, 3000] {
        let stream = harness.accepted_bid(amount).await;
        harness.billing_signal("start", &stream).await.assert_status_ok();
        harness.billing_signal("end", &stream).await.assert_status_ok();
    }

    let response = harness
        .server
        .get("/v1/billing/sessions")
        .add_header("authorization", harness.explorer_auth_header())
        .await;

    response.assert_status_ok();
    let sessions: serde_json::Value = response.json();
    let sessions = sessions.as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["bid_amount_cents"], 3000);
    assert_eq!(sessions[1]["bid_amount_cents"], 2000);

    // The influencer sees the same sessions.
    let response = harness
        .server
        .get("/v1/billing/sessions")
        .add_header("authorization", harness.influencer_auth_header())
        .await;
    response.assert_status_ok();
    let sessions: serde_json::Value = response.json();
    assert_eq!(sessions.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn stranger_sees_no_sessions() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;
    harness.billing_signal("start", &stream).await.assert_status_ok();

    let response = harness
        .server
        .get("/v1/billing/sessions")
        .add_header(
            "authorization",
            TestHarness::bearer(&callbill_core::UserId::generate()),
        )
        .await;

    response.assert_status_ok();
    let sessions: serde_json::Value = response.json();
    assert!(sessions.as_array().unwrap().is_empty());
}

// ============================================================================
// Webhooks
// ============================================================================

#[tokio::test]
async fn payment_failed_webhook_fails_pending_session() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;
    let session = harness
        .state
        .manager
        .latest_session(&stream.parse().unwrap())
        .unwrap()
        .unwrap();

    let payload = json!({
        "type": "payment_intent.payment_failed",
        "data": { "object": {
            "id": "pi_test",
            "metadata": { "billing_session_id": session.id.to_string() },
        }},
    });

    let response = harness
        .server
        .post("/webhooks/gateway")
        .add_header("stripe-signature", "t=1,v1=fake")
        .text(payload.to_string())
        .await;

    response.assert_status_ok();
    let session = harness
        .state
        .manager
        .latest_session(&stream.parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(session.status, callbill_core::BillingStatus::PaymentFailed);
}

#[tokio::test]
async fn refund_webhook_disagreement_is_audited_and_reconciled() {
    use callbill_store::Store;

    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;
    harness.billing_signal("start", &stream).await.assert_status_ok();
    harness.billing_signal("end", &stream).await.assert_status_ok();

    let session = harness
        .state
        .manager
        .latest_session(&stream.parse().unwrap())
        .unwrap()
        .unwrap();

    // The gateway claims the charge was refunded; locally it settled.
    let payload = json!({
        "type": "charge.refunded",
        "data": { "object": {
            "id": "ch_test",
            "metadata": { "billing_session_id": session.id.to_string() },
        }},
    });
    let response = harness
        .server
        .post("/webhooks/gateway")
        .add_header("stripe-signature", "t=1,v1=fake")
        .text(payload.to_string())
        .await;
    response.assert_status_ok();

    let records = harness.state.store.list_reconciliations(&session.id).unwrap();
    assert!(records
        .iter()
        .any(|r| r.condition == callbill_core::DetectedCondition::WebhookMismatch));

    // Reconciliation leaves the settled record as the source of truth.
    let session = harness
        .state
        .manager
        .latest_session(&stream.parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(session.status, callbill_core::BillingStatus::Completed);
}

#[tokio::test]
async fn dispute_webhook_reconciles_an_abandoned_call() {
    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;
    harness.billing_signal("start", &stream).await.assert_status_ok();

    let session = harness
        .state
        .manager
        .latest_session(&stream.parse().unwrap())
        .unwrap()
        .unwrap();

    let payload = json!({
        "type": "charge.dispute.created",
        "data": { "object": {
            "id": "dp_test",
            "metadata": { "billing_session_id": session.id.to_string() },
        }},
    });
    let response = harness
        .server
        .post("/webhooks/gateway")
        .add_header("stripe-signature", "t=1,v1=fake")
        .text(payload.to_string())
        .await;
    response.assert_status_ok();

    // The active call was swept to a terminal state by reconciliation.
    let session = harness
        .state
        .manager
        .latest_session(&stream.parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(session.status, callbill_core::BillingStatus::Completed);
}

#[tokio::test]
async fn canceled_webhook_matching_local_state_is_dropped() {
    use callbill_store::Store;

    let harness = TestHarness::new();
    let stream = harness.accepted_bid(2500).await;
    harness.gateway.fail_authorize(true);
    harness
        .billing_signal("start", &stream)
        .await
        .assert_status(axum::http::StatusCode::BAD_GATEWAY);

    let session = harness
        .state
        .manager
        .latest_session(&stream.parse().unwrap())
        .unwrap()
        .unwrap();

    let payload = json!({
        "type": "payment_intent.canceled",
        "data": { "object": {
            "id": "pi_test",
            "metadata": { "billing_session_id": session.id.to_string() },
        }},
    });
    let response = harness
        .server
        .post("/webhooks/gateway")
        .add_header("stripe-signature", "t=1,v1=fake")
        .text(payload.to_string())
        .await;
    response.assert_status_ok();

    // Agreement: no mismatch audit, no state change.
    let records = harness.state.store.list_reconciliations(&session.id).unwrap();
    assert!(records.is_empty());
    let session = harness
        .state
        .manager
        .latest_session(&stream.parse().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(session.status, callbill_core::BillingStatus::PaymentFailed);
}

#[tokio::test]
async fn webhook_without_signature_rejected() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .post("/webhooks/gateway")
        .text("{}")
        .await;

    response.assert_status_unauthorized();
}
