//! Billing session orchestration.
//!
//! [`BillingManager`] owns every mutation of a billing session: it
//! serializes operations per stream with an in-process lock, drives the
//! state machine, calls the payment gateway, persists the result, then
//! publishes the event. Persist-before-publish means subscribers never
//! see a transition that did not durably happen.
//!
//! Gateway policy: one automatic retry for retryable failures
//! (timeouts, 5xx), keyed by a stable idempotency key so the retry can
//! never double-charge. A capture that fails both attempts moves the
//! session to `Failed` and an immediate refund of the outstanding
//! authorization is attempted under the same lock.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use callbill_core::{
    BidId, BillingError, BillingEvent, BillingSession, BillingSessionId, BillingStatus,
    DetectedCondition, RateMeter, RateMeterTick, ReconcileAction, ReconciliationRecord, Result,
    StreamSessionId, TransitionError, UserId,
};
use callbill_store::{Store, StoreError};

use crate::broadcaster::{EventBroadcaster, EventEnvelope};
use crate::gateway::{GatewayError, PaymentGateway, RefundTarget};

/// Orchestrates billing sessions against the store and payment gateway.
pub struct BillingManager {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    broadcaster: Arc<EventBroadcaster>,
    /// Per-stream operation locks. Held across the whole
    /// check-transition-persist-publish sequence so concurrent signals
    /// for one stream serialize.
    locks: DashMap<StreamSessionId, Arc<Mutex<()>>>,
}

impl BillingManager {
    /// Create a manager over the given store, gateway, and broadcaster.
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            store,
            gateway,
            broadcaster,
            locks: DashMap::new(),
        }
    }

    /// Allocate a `Created` session for a stream, claiming its active
    /// slot.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::SessionHasActiveBilling`] if the stream
    /// already has a non-terminal session.
    pub fn open(
        &self,
        stream_session_id: StreamSessionId,
        explorer_id: UserId,
        influencer_id: UserId,
        bid_id: Option<BidId>,
        bid_amount_cents: i64,
        rate_per_minute_cents: Option<i64>,
    ) -> Result<BillingSession> {
        if bid_amount_cents <= 0 {
            return Err(BillingError::InvalidAmount {
                amount_cents: bid_amount_cents,
            });
        }

        let session = BillingSession::open(
            stream_session_id,
            explorer_id,
            influencer_id,
            bid_id,
            bid_amount_cents,
            rate_per_minute_cents,
        );

        self.store
            .create_session(&session)
            .map_err(|e| match e {
                StoreError::ActiveSessionExists { .. } => {
                    BillingError::SessionHasActiveBilling(stream_session_id)
                }
                other => BillingError::Storage(other.to_string()),
            })?;

        tracing::info!(
            billing_session_id = %session.id,
            stream_session_id = %stream_session_id,
            bid_amount_cents,
            "Opened billing session"
        );
        Ok(session)
    }

    /// Authorize payment and activate billing for the call.
    ///
    /// Idempotent against the session's state: a session already past
    /// authorization is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::SessionNotFound`] if the stream has no
    /// non-terminal session, or [`BillingError::Gateway`] if
    /// authorization failed (the session is then `PaymentFailed`).
    pub async fn start_call_billing(
        &self,
        stream_session_id: StreamSessionId,
    ) -> Result<BillingSession> {
        let lock = self.lock_for(stream_session_id);
        let _guard = lock.lock().await;

        let mut session = self.require_active_session(&stream_session_id)?;

        // Already authorized (or authorizing): absorb the duplicate.
        if session.status != BillingStatus::Created {
            return Ok(session);
        }

        session.begin_authorization()?;
        self.persist(&session)?;

        let authorized = self
            .gateway_with_retry(|| self.gateway.authorize(&session.id, session.bid_amount_cents))
            .await;

        match authorized {
            Ok(intent_id) => {
                session.activate(intent_id)?;
                self.persist(&session)?;
                self.publish(
                    &session,
                    BillingEvent::BillingStarted {
                        session_id: stream_session_id,
                        billing_session_id: session.id,
                        bid_amount_cents: session.bid_amount_cents,
                    },
                );
                tracing::info!(
                    billing_session_id = %session.id,
                    stream_session_id = %stream_session_id,
                    "Billing active"
                );
                Ok(session)
            }
            Err(err) => {
                let reason = err.to_string();
                session.fail_payment(reason.clone())?;
                self.persist(&session)?;
                self.publish(
                    &session,
                    BillingEvent::PaymentFailed {
                        session_id: stream_session_id,
                        reason: reason.clone(),
                    },
                );
                tracing::warn!(
                    billing_session_id = %session.id,
                    stream_session_id = %stream_session_id,
                    error = %reason,
                    "Authorization failed"
                );
                Err(BillingError::Gateway(reason))
            }
        }
    }

    /// Record a rate-meter tick and broadcast the updated accrual.
    ///
    /// `elapsed_secs` is the call layer's reported elapsed time; when
    /// absent, elapsed time is measured from the session's activation.
    /// A late tick against a settling or terminal session is absorbed as
    /// a no-op returning the session's current accrual.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::SessionNotFound`] if the stream never had
    /// a billing session; a tick before activation is rejected with a
    /// transition error.
    pub async fn tick(
        &self,
        stream_session_id: StreamSessionId,
        elapsed_secs: Option<u64>,
    ) -> Result<RateMeterTick> {
        let lock = self.lock_for(stream_session_id);
        let _guard = lock.lock().await;

        let Some(mut session) = self
            .store
            .get_latest_session_for_stream(&stream_session_id)
            .map_err(storage_err)?
        else {
            return Err(BillingError::SessionNotFound(stream_session_id));
        };

        match session.status {
            BillingStatus::Active => {}
            BillingStatus::Created | BillingStatus::PaymentPending => {
                return Err(BillingError::Transition(TransitionError {
                    from: session.status,
                    event: "tick",
                }));
            }
            // The call already settled (or failed); report the frozen
            // accrual without touching the record.
            _ => {
                tracing::debug!(
                    billing_session_id = %session.id,
                    status = session.status.as_str(),
                    "Absorbed late tick"
                );
                return Ok(RateMeterTick {
                    stream_session_id,
                    elapsed_secs: session.duration_secs.unwrap_or(0),
                    accrued_cents: session.accrued_cents,
                });
            }
        }

        let elapsed_secs =
            elapsed_secs.unwrap_or_else(|| session.elapsed_secs(Utc::now()).unwrap_or(0));
        let accrued_cents = RateMeter::accrued_at(
            session.bid_amount_cents,
            session.rate_per_minute_cents,
            elapsed_secs,
        );

        session.record_tick(accrued_cents)?;
        self.persist(&session)?;
        self.publish(
            &session,
            BillingEvent::BillingUpdated {
                session_id: stream_session_id,
                total_charged_cents: session.accrued_cents,
                duration_secs: elapsed_secs,
            },
        );

        Ok(RateMeterTick {
            stream_session_id,
            elapsed_secs,
            accrued_cents: session.accrued_cents,
        })
    }

    /// End the call and settle the final amount.
    ///
    /// `duration_secs` is the call layer's reported duration, which
    /// governs the final charge; when absent (stale-session sweeps), the
    /// last known elapsed time stands in for it.
    ///
    /// Idempotent: a settling or settled session absorbs the duplicate
    /// signal as a no-op (audited as `double_end`), and a session that
    /// never went active is failed without any gateway call.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::SessionNotFound`] if the stream never had
    /// a billing session.
    pub async fn end_call_billing(
        &self,
        stream_session_id: StreamSessionId,
        duration_secs: Option<u64>,
        reason: &str,
    ) -> Result<BillingSession> {
        let lock = self.lock_for(stream_session_id);
        let _guard = lock.lock().await;

        let Some(session) = self
            .store
            .get_latest_session_for_stream(&stream_session_id)
            .map_err(storage_err)?
        else {
            return Err(BillingError::SessionNotFound(stream_session_id));
        };

        match session.status {
            BillingStatus::Active => self.settle(session, duration_secs, reason).await,
            // No authorization went out yet; nothing to settle.
            BillingStatus::Created | BillingStatus::PaymentPending => {
                let mut session = session;
                session.fail_payment(format!("call ended before activation: {reason}"))?;
                self.persist(&session)?;
                self.publish(
                    &session,
                    BillingEvent::PaymentFailed {
                        session_id: stream_session_id,
                        reason: "call ended before activation".into(),
                    },
                );
                Ok(session)
            }
            // Capture outstanding or already settled: absorb and audit.
            BillingStatus::Completing
            | BillingStatus::Completed
            | BillingStatus::PaymentFailed
            | BillingStatus::Refunded
            | BillingStatus::Failed => {
                self.audit(
                    &session,
                    DetectedCondition::DoubleEnd,
                    ReconcileAction::Ignored,
                    Some(format!(
                        "duplicate end signal in {}",
                        session.status.as_str()
                    )),
                )?;
                tracing::debug!(
                    billing_session_id = %session.id,
                    status = session.status.as_str(),
                    "Absorbed duplicate end-of-call signal"
                );
                Ok(session)
            }
        }
    }

    /// Apply an externally reported payment failure (gateway webhook or
    /// client decline callback).
    ///
    /// Sessions that already left the pre-active states absorb the
    /// signal; the disagreement is audited for reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::SessionNotFound`] if the stream never had
    /// a billing session.
    pub async fn handle_payment_failure(
        &self,
        stream_session_id: StreamSessionId,
        reason: &str,
    ) -> Result<BillingSession> {
        let lock = self.lock_for(stream_session_id);
        let _guard = lock.lock().await;

        let Some(mut session) = self
            .store
            .get_latest_session_for_stream(&stream_session_id)
            .map_err(storage_err)?
        else {
            return Err(BillingError::SessionNotFound(stream_session_id));
        };

        match session.status {
            BillingStatus::Created | BillingStatus::PaymentPending => {
                session.fail_payment(reason)?;
                self.persist(&session)?;
                self.publish(
                    &session,
                    BillingEvent::PaymentFailed {
                        session_id: stream_session_id,
                        reason: reason.to_string(),
                    },
                );
                Ok(session)
            }
            _ => {
                self.audit(
                    &session,
                    DetectedCondition::WebhookMismatch,
                    ReconcileAction::Ignored,
                    Some(format!(
                        "payment failure reported in {}: {reason}",
                        session.status.as_str()
                    )),
                )?;
                Ok(session)
            }
        }
    }

    /// Force-end a stream's active session. Used by reconciliation when
    /// a call goes stale without an end signal.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::SessionNotFound`] if the stream has no
    /// non-terminal session.
    pub async fn force_end(
        &self,
        stream_session_id: StreamSessionId,
        reason: &str,
    ) -> Result<BillingSession> {
        let session = self.end_call_billing(stream_session_id, None, reason).await?;
        self.audit(
            &session,
            DetectedCondition::StuckActive,
            ReconcileAction::ForcedCompletion,
            Some(reason.to_string()),
        )?;
        Ok(session)
    }

    /// Refund a session whose capture failed.
    ///
    /// By default the stream's latest session is targeted. An escalated
    /// `Failed` session that is no longer the stream's latest (a newer
    /// bid opened after it) stays reachable through an explicit
    /// `billing_session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::SessionNotFound`] if no matching session
    /// exists for the stream, a transition error if the targeted session
    /// is not `Failed`, or [`BillingError::Gateway`] if the refund
    /// failed (audited and escalated).
    pub async fn process_refund(
        &self,
        stream_session_id: StreamSessionId,
        billing_session_id: Option<BillingSessionId>,
    ) -> Result<BillingSession> {
        let lock = self.lock_for(stream_session_id);
        let _guard = lock.lock().await;

        let session = match billing_session_id {
            Some(id) => self
                .store
                .get_session(&id)
                .map_err(storage_err)?
                .filter(|s| s.stream_session_id == stream_session_id),
            None => self
                .store
                .get_latest_session_for_stream(&stream_session_id)
                .map_err(storage_err)?,
        };
        let Some(session) = session else {
            return Err(BillingError::SessionNotFound(stream_session_id));
        };

        self.refund_failed_session(session, DetectedCondition::CaptureFailed)
            .await
    }

    /// Examine one stream's billing state and apply corrective action.
    ///
    /// Dispatches on the latest session's status:
    ///
    /// - `PaymentPending` is failed (no authorization completed);
    /// - `Active` is force-ended and settled;
    /// - `Completing` gets one more capture attempt, then the refund path;
    /// - `Failed` gets a refund attempt.
    ///
    /// Terminal sessions other than `Failed` are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::SessionNotFound`] if the stream never had
    /// a billing session.
    pub async fn reconcile(&self, stream_session_id: StreamSessionId) -> Result<BillingSession> {
        let status = {
            let Some(session) = self
                .store
                .get_latest_session_for_stream(&stream_session_id)
                .map_err(storage_err)?
            else {
                return Err(BillingError::SessionNotFound(stream_session_id));
            };
            session.status
        };

        tracing::info!(
            stream_session_id = %stream_session_id,
            status = status.as_str(),
            "Reconciling billing session"
        );

        match status {
            BillingStatus::Created | BillingStatus::PaymentPending => {
                let lock = self.lock_for(stream_session_id);
                let _guard = lock.lock().await;
                let mut session = self.require_active_session(&stream_session_id)?;
                session.fail_payment("authorization never completed")?;
                self.persist(&session)?;
                self.audit(
                    &session,
                    DetectedCondition::StuckPending,
                    ReconcileAction::MarkedPaymentFailed,
                    None,
                )?;
                self.publish(
                    &session,
                    BillingEvent::PaymentFailed {
                        session_id: stream_session_id,
                        reason: "authorization never completed".into(),
                    },
                );
                Ok(session)
            }
            BillingStatus::Active => self.force_end(stream_session_id, "stale active call").await,
            BillingStatus::Completing => {
                let lock = self.lock_for(stream_session_id);
                let _guard = lock.lock().await;
                let session = self.require_active_session(&stream_session_id)?;
                self.capture_and_finish(session, DetectedCondition::StuckCompleting)
                    .await
            }
            BillingStatus::Failed => {
                let lock = self.lock_for(stream_session_id);
                let _guard = lock.lock().await;
                let Some(session) = self
                    .store
                    .get_latest_session_for_stream(&stream_session_id)
                    .map_err(storage_err)?
                else {
                    return Err(BillingError::SessionNotFound(stream_session_id));
                };
                self.refund_failed_session(session, DetectedCondition::RefundFailed)
                    .await
            }
            BillingStatus::PaymentFailed | BillingStatus::Completed | BillingStatus::Refunded => {
                let session = self
                    .store
                    .get_latest_session_for_stream(&stream_session_id)
                    .map_err(storage_err)?
                    .ok_or(BillingError::SessionNotFound(stream_session_id))?;
                Ok(session)
            }
        }
    }

    /// Apply a gateway webhook report that disagrees with the local
    /// record: audit the disagreement, then run reconciliation for the
    /// stream. The webhook is never trusted over local state directly.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::SessionNotFound`] if the stream never had
    /// a billing session, or any error from the reconciliation pass.
    pub async fn reconcile_webhook_mismatch(
        &self,
        stream_session_id: StreamSessionId,
        detail: &str,
    ) -> Result<BillingSession> {
        let session = self
            .latest_session(&stream_session_id)?
            .ok_or(BillingError::SessionNotFound(stream_session_id))?;
        self.audit(
            &session,
            DetectedCondition::WebhookMismatch,
            ReconcileAction::Escalated,
            Some(detail.to_string()),
        )?;
        tracing::warn!(
            billing_session_id = %session.id,
            status = session.status.as_str(),
            detail,
            "Gateway webhook disagrees with local state"
        );
        self.reconcile(stream_session_id).await
    }

    /// List a user's billing sessions, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn list_user_sessions(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<BillingSession>> {
        self.store
            .list_sessions_by_user(user_id, limit)
            .map_err(storage_err)
    }

    /// Get a stream's most recent session, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn latest_session(
        &self,
        stream_session_id: &StreamSessionId,
    ) -> Result<Option<BillingSession>> {
        self.store
            .get_latest_session_for_stream(stream_session_id)
            .map_err(storage_err)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Settle an `Active` session: fix the final amount, capture, and
    /// fall into the refund path when capture fails.
    async fn settle(
        &self,
        mut session: BillingSession,
        duration_secs: Option<u64>,
        reason: &str,
    ) -> Result<BillingSession> {
        let duration_secs =
            duration_secs.unwrap_or_else(|| session.elapsed_secs(Utc::now()).unwrap_or(0));
        let meter = RateMeter::new(session.bid_amount_cents, session.rate_per_minute_cents);
        // Floor at the persisted accrual so the final amount never
        // undercuts an observed tick.
        let final_cents = meter.finalize(duration_secs).max(session.accrued_cents);

        session.begin_settlement(duration_secs, final_cents, reason)?;
        self.persist(&session)?;

        self.capture_and_finish(session, DetectedCondition::CaptureFailed)
            .await
    }

    /// Capture a `Completing` session's final amount. On success the
    /// session completes; on failure it is failed and an immediate
    /// refund is attempted under the same lock.
    async fn capture_and_finish(
        &self,
        mut session: BillingSession,
        failure_condition: DetectedCondition,
    ) -> Result<BillingSession> {
        let intent_id = session.payment_intent_id.clone().ok_or_else(|| {
            BillingError::Gateway("completing session has no payment intent".into())
        })?;
        let final_cents = session.accrued_cents;

        let captured = self
            .gateway_with_retry(|| self.gateway.capture(&intent_id, final_cents))
            .await;

        match captured {
            Ok(charge_id) => {
                session.complete(charge_id)?;
                self.persist(&session)?;
                self.publish(
                    &session,
                    BillingEvent::BillingCompleted {
                        session_id: session.stream_session_id,
                        final_amount_cents: final_cents,
                        duration_secs: session.duration_secs.unwrap_or(0),
                    },
                );
                tracing::info!(
                    billing_session_id = %session.id,
                    final_amount_cents = final_cents,
                    "Billing settled"
                );
                Ok(session)
            }
            Err(err) => {
                let reason = err.to_string();
                session.fail_capture(reason.clone())?;
                self.persist(&session)?;
                self.audit(
                    &session,
                    failure_condition,
                    ReconcileAction::Escalated,
                    Some(reason.clone()),
                )?;
                self.publish(
                    &session,
                    BillingEvent::PaymentFailed {
                        session_id: session.stream_session_id,
                        reason,
                    },
                );
                tracing::error!(
                    billing_session_id = %session.id,
                    "Capture failed; attempting refund of outstanding authorization"
                );
                self.refund_failed_session(session, failure_condition).await
            }
        }
    }

    /// Refund a `Failed` session's outstanding money: the captured
    /// charge if one exists, otherwise the uncaptured authorization.
    async fn refund_failed_session(
        &self,
        mut session: BillingSession,
        condition: DetectedCondition,
    ) -> Result<BillingSession> {
        if session.status != BillingStatus::Failed {
            return Err(BillingError::Transition(TransitionError {
                from: session.status,
                event: "reconcile_refund",
            }));
        }

        let refunded = match (&session.charge_id, &session.payment_intent_id) {
            (Some(charge_id), _) => {
                self.gateway_with_retry(|| {
                    self.gateway.refund(RefundTarget::Charge(charge_id.as_str()))
                })
                .await
            }
            (None, Some(intent_id)) => {
                self.gateway_with_retry(|| {
                    self.gateway.refund(RefundTarget::Intent(intent_id.as_str()))
                })
                .await
            }
            (None, None) => {
                // Nothing was ever reserved. Audit and leave the session
                // in `Failed` for operators.
                self.audit(
                    &session,
                    condition,
                    ReconcileAction::Escalated,
                    Some("failed session has no intent or charge to refund".into()),
                )?;
                return Ok(session);
            }
        };

        match refunded {
            Ok(refund_id) => {
                session.mark_refunded(refund_id.clone())?;
                self.persist(&session)?;
                self.audit(&session, condition, ReconcileAction::Refunded, None)?;
                self.publish(
                    &session,
                    BillingEvent::RefundProcessed {
                        session_id: session.stream_session_id,
                        refund_id,
                    },
                );
                tracing::info!(billing_session_id = %session.id, "Session refunded");
                Ok(session)
            }
            Err(err) => {
                let reason = err.to_string();
                self.audit(
                    &session,
                    DetectedCondition::RefundFailed,
                    ReconcileAction::Escalated,
                    Some(reason.clone()),
                )?;
                tracing::error!(
                    billing_session_id = %session.id,
                    error = %reason,
                    "Refund failed; escalated to operators"
                );
                Err(BillingError::Gateway(reason))
            }
        }
    }

    /// Run a gateway call with one automatic retry for retryable
    /// failures. Idempotency keys on the gateway side make the retry
    /// safe.
    async fn gateway_with_retry<F, Fut>(&self, call: F) -> std::result::Result<String, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<String, GatewayError>>,
    {
        match call().await {
            Err(err) if err.is_retryable() => {
                tracing::warn!(error = %err, "Retryable gateway failure; retrying once");
                call().await
            }
            other => other,
        }
    }

    fn lock_for(&self, stream_session_id: StreamSessionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(stream_session_id)
            .or_default()
            .clone()
    }

    fn require_active_session(
        &self,
        stream_session_id: &StreamSessionId,
    ) -> Result<BillingSession> {
        self.store
            .get_active_session(stream_session_id)
            .map_err(storage_err)?
            .ok_or(BillingError::SessionNotFound(*stream_session_id))
    }

    fn persist(&self, session: &BillingSession) -> Result<()> {
        self.store.update_session(session).map_err(storage_err)
    }

    fn audit(
        &self,
        session: &BillingSession,
        condition: DetectedCondition,
        action: ReconcileAction,
        detail: Option<String>,
    ) -> Result<()> {
        let record = ReconciliationRecord::new(
            session.id,
            session.stream_session_id,
            condition,
            action,
            detail,
        );
        self.store
            .append_reconciliation(&record)
            .map_err(storage_err)
    }

    fn publish(&self, session: &BillingSession, event: BillingEvent) {
        self.broadcaster.publish(&EventEnvelope {
            stream_session_id: session.stream_session_id,
            billing_session_id: session.id,
            explorer_id: session.explorer_id,
            influencer_id: session.influencer_id,
            event,
            published_at: Utc::now(),
        });
    }
}

fn storage_err(err: StoreError) -> BillingError {
    BillingError::Storage(err.to_string())
}
