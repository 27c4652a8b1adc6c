//! Billing session types and the settlement state machine.
//!
//! A [`BillingSession`] tracks one call's money flow from payment
//! authorization through settlement. All mutation goes through the
//! transition methods below, which reject illegal edges; callers persist
//! the record only after a transition succeeds, so no partial state is
//! ever stored.
//!
//! ```text
//! Created -> PaymentPending -> { PaymentFailed | Active }
//! Active -> Completing -> { Completed | Failed }
//! Failed -> Refunded          (reconciliation refund)
//! ```
//!
//! `PaymentPending` and `Completing` are the "external call outstanding"
//! states: duplicate signals observed while in them (or after a terminal
//! state) are absorbed without re-invoking the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BidId, BillingSessionId, StreamSessionId, UserId};

/// The stateful record of one call's authorization, accrual, and settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingSession {
    /// Unique session ID (ULID for time-ordering).
    pub id: BillingSessionId,

    /// The stream session being billed.
    pub stream_session_id: StreamSessionId,

    /// The paying explorer.
    pub explorer_id: UserId,

    /// The influencer receiving the call.
    pub influencer_id: UserId,

    /// The accepted bid that opened this session, if it came from a bid.
    pub bid_id: Option<BidId>,

    /// Flat bid amount in cents. The floor of the final charge.
    pub bid_amount_cents: i64,

    /// Optional per-minute overage rate in cents.
    pub rate_per_minute_cents: Option<i64>,

    /// When the call went active (authorization succeeded).
    pub started_at: Option<DateTime<Utc>>,

    /// When settlement began.
    pub ended_at: Option<DateTime<Utc>>,

    /// Final call duration in seconds, fixed at settlement.
    pub duration_secs: Option<u64>,

    /// Running accrued charge in cents. Non-decreasing.
    pub accrued_cents: i64,

    /// Final captured amount in cents. Set exactly once, on completion.
    pub charged_cents: Option<i64>,

    /// Gateway payment intent from authorization.
    pub payment_intent_id: Option<String>,

    /// Gateway charge from capture.
    pub charge_id: Option<String>,

    /// Gateway refund from reconciliation.
    pub refund_id: Option<String>,

    /// Why the call ended (completed, disconnect, forced), for the audit
    /// record.
    pub end_reason: Option<String>,

    /// Why a payment step failed, for the audit record.
    pub failure_reason: Option<String>,

    /// Current state-machine status.
    pub status: BillingStatus,

    /// When the record was allocated.
    pub created_at: DateTime<Utc>,

    /// Last transition time. Drives the staleness sweep.
    pub updated_at: DateTime<Utc>,
}

impl BillingSession {
    /// Allocate a new session in `Created`.
    #[must_use]
    pub fn open(
        stream_session_id: StreamSessionId,
        explorer_id: UserId,
        influencer_id: UserId,
        bid_id: Option<BidId>,
        bid_amount_cents: i64,
        rate_per_minute_cents: Option<i64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: BillingSessionId::generate(),
            stream_session_id,
            explorer_id,
            influencer_id,
            bid_id,
            bid_amount_cents,
            rate_per_minute_cents,
            started_at: None,
            ended_at: None,
            duration_secs: None,
            accrued_cents: bid_amount_cents,
            charged_cents: None,
            payment_intent_id: None,
            charge_id: None,
            refund_id: None,
            end_reason: None,
            failure_reason: None,
            status: BillingStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// `Created` -> `PaymentPending`: an authorize call is going out.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the session is not in `Created`.
    pub fn begin_authorization(&mut self) -> Result<(), TransitionError> {
        self.require(BillingStatus::Created, "authorize")?;
        self.set_status(BillingStatus::PaymentPending);
        Ok(())
    }

    /// `PaymentPending` -> `Active`: authorization succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the session is not in `PaymentPending`.
    pub fn activate(&mut self, payment_intent_id: String) -> Result<(), TransitionError> {
        self.require(BillingStatus::PaymentPending, "authorize_ok")?;
        self.payment_intent_id = Some(payment_intent_id);
        self.started_at = Some(Utc::now());
        self.set_status(BillingStatus::Active);
        Ok(())
    }

    /// `Created`/`PaymentPending` -> `PaymentFailed`: authorization failed,
    /// timed out, or was reported failed externally. No charge exists.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the session already left the
    /// pre-active states.
    pub fn fail_payment(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        match self.status {
            BillingStatus::Created | BillingStatus::PaymentPending => {
                self.failure_reason = Some(reason.into());
                self.set_status(BillingStatus::PaymentFailed);
                Ok(())
            }
            from => Err(TransitionError {
                from,
                event: "authorize_failed",
            }),
        }
    }

    /// Record an accrual tick while `Active`. Monotonic: a tick that would
    /// lower the accrued amount is clamped to the current value.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the session is not `Active`.
    pub fn record_tick(&mut self, accrued_cents: i64) -> Result<(), TransitionError> {
        self.require(BillingStatus::Active, "tick")?;
        self.accrued_cents = self.accrued_cents.max(accrued_cents);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `Active` -> `Completing`: the call ended, a capture is going out.
    /// Fixes the final duration and amount.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the session is not `Active`.
    pub fn begin_settlement(
        &mut self,
        duration_secs: u64,
        final_cents: i64,
        reason: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.require(BillingStatus::Active, "end_call")?;
        self.duration_secs = Some(duration_secs);
        self.accrued_cents = self.accrued_cents.max(final_cents);
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(reason.into());
        self.set_status(BillingStatus::Completing);
        Ok(())
    }

    /// `Completing` -> `Completed`: capture succeeded. Sets `charged_cents`
    /// exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the session is not `Completing`.
    pub fn complete(&mut self, charge_id: String) -> Result<(), TransitionError> {
        self.require(BillingStatus::Completing, "capture_ok")?;
        self.charge_id = Some(charge_id);
        self.charged_cents = Some(self.accrued_cents);
        self.set_status(BillingStatus::Completed);
        Ok(())
    }

    /// `Completing` -> `Failed`: capture failed; reconciliation owns the
    /// session from here. An authorization may still be outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the session is not `Completing`.
    pub fn fail_capture(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.require(BillingStatus::Completing, "capture_failed")?;
        self.failure_reason = Some(reason.into());
        self.set_status(BillingStatus::Failed);
        Ok(())
    }

    /// `Failed` -> `Refunded`: reconciliation released the funds.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the session is not `Failed`.
    pub fn mark_refunded(&mut self, refund_id: String) -> Result<(), TransitionError> {
        self.require(BillingStatus::Failed, "reconcile_refund")?;
        self.refund_id = Some(refund_id);
        self.set_status(BillingStatus::Refunded);
        Ok(())
    }

    /// Whether the session occupies its stream's single active slot.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a gateway call may be outstanding for this session.
    #[must_use]
    pub fn is_settling(&self) -> bool {
        matches!(
            self.status,
            BillingStatus::PaymentPending | BillingStatus::Completing
        )
    }

    /// Elapsed seconds since the call went active, if it did.
    #[must_use]
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        let started = self.started_at?;
        Some(u64::try_from((now - started).num_seconds().max(0)).unwrap_or(0))
    }

    fn require(
        &self,
        expected: BillingStatus,
        event: &'static str,
    ) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                event,
            })
        }
    }

    fn set_status(&mut self, status: BillingStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Billing session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    /// Allocated, no gateway interaction yet.
    Created,

    /// Authorize call outstanding.
    PaymentPending,

    /// Authorization failed; nothing to refund.
    PaymentFailed,

    /// Funds reserved, call running, meter accruing.
    Active,

    /// Call ended, capture call outstanding.
    Completing,

    /// Captured. `charged_cents` and `charge_id` are set.
    Completed,

    /// Settlement failed and was refunded. `refund_id` is set.
    Refunded,

    /// Settlement failed; refund pending or escalated to operators.
    Failed,
}

impl BillingStatus {
    /// Whether this status releases the stream's active-billing slot.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::PaymentFailed | Self::Completed | Self::Refunded | Self::Failed
        )
    }

    /// Snake-case name, as used in API responses and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PaymentPending => "payment_pending",
            Self::PaymentFailed => "payment_failed",
            Self::Active => "active",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }
}

/// An illegal state-machine edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: {event} from {}", from.as_str())]
pub struct TransitionError {
    /// The status the session was in.
    pub from: BillingStatus,
    /// The event that was rejected.
    pub event: &'static str,
}

/// A single rate-meter observation. Ephemeral; carried only in
/// `BILLING_UPDATED` events, never persisted beyond the session's running
/// `accrued_cents`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateMeterTick {
    /// The stream session ticked.
    pub stream_session_id: StreamSessionId,
    /// Elapsed call seconds at the tick.
    pub elapsed_secs: u64,
    /// Accrued charge at the tick, in cents.
    pub accrued_cents: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_session() -> BillingSession {
        let mut s = BillingSession::open(
            StreamSessionId::generate(),
            UserId::generate(),
            UserId::generate(),
            None,
            2500,
            None,
        );
        s.begin_authorization().unwrap();
        s.activate("pi_test".into()).unwrap();
        s
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut s = active_session();
        assert_eq!(s.status, BillingStatus::Active);
        assert!(s.started_at.is_some());

        s.begin_settlement(180, 2500, "ended").unwrap();
        assert_eq!(s.status, BillingStatus::Completing);
        assert_eq!(s.duration_secs, Some(180));

        s.complete("ch_test".into()).unwrap();
        assert_eq!(s.status, BillingStatus::Completed);
        assert_eq!(s.charged_cents, Some(2500));
        assert!(s.is_terminal());
    }

    #[test]
    fn authorize_failure_is_terminal_without_charge() {
        let mut s = BillingSession::open(
            StreamSessionId::generate(),
            UserId::generate(),
            UserId::generate(),
            None,
            2500,
            None,
        );
        s.begin_authorization().unwrap();
        s.fail_payment("card_declined").unwrap();

        assert_eq!(s.status, BillingStatus::PaymentFailed);
        assert!(s.is_terminal());
        assert!(s.charged_cents.is_none());
        assert!(s.charge_id.is_none());
    }

    #[test]
    fn capture_failure_then_refund() {
        let mut s = active_session();
        s.begin_settlement(120, 2500, "ended").unwrap();
        s.fail_capture("gateway_unavailable").unwrap();
        assert_eq!(s.status, BillingStatus::Failed);
        assert!(s.charged_cents.is_none());

        s.mark_refunded("re_test".into()).unwrap();
        assert_eq!(s.status, BillingStatus::Refunded);
        assert_eq!(s.refund_id.as_deref(), Some("re_test"));
    }

    #[test]
    fn double_settlement_is_rejected() {
        let mut s = active_session();
        s.begin_settlement(180, 2500, "ended").unwrap();

        let err = s.begin_settlement(185, 2600, "ended again").unwrap_err();
        assert_eq!(err.from, BillingStatus::Completing);
        assert_eq!(s.duration_secs, Some(180));
    }

    #[test]
    fn complete_requires_completing() {
        let mut s = active_session();
        let err = s.complete("ch_test".into()).unwrap_err();
        assert_eq!(err.from, BillingStatus::Active);
        assert!(s.charged_cents.is_none());
    }

    #[test]
    fn tick_is_monotonic() {
        let mut s = active_session();
        s.record_tick(2600).unwrap();
        assert_eq!(s.accrued_cents, 2600);

        // A regressed observation never lowers the accrual.
        s.record_tick(2550).unwrap();
        assert_eq!(s.accrued_cents, 2600);
    }

    #[test]
    fn tick_after_settlement_is_rejected() {
        let mut s = active_session();
        s.begin_settlement(60, 2500, "ended").unwrap();
        assert!(s.record_tick(9999).is_err());
    }

    #[test]
    fn open_starts_accrual_at_bid_amount() {
        let s = BillingSession::open(
            StreamSessionId::generate(),
            UserId::generate(),
            UserId::generate(),
            None,
            2500,
            Some(100),
        );
        assert_eq!(s.accrued_cents, 2500);
        assert_eq!(s.status, BillingStatus::Created);
    }
}
