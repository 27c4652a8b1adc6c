//! Reconciliation audit records.
//!
//! Every corrective action taken on a billing session appends a record
//! here. The trail is append-only and retained indefinitely for dispute
//! resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{BillingSessionId, StreamSessionId};

/// One entry in the reconciliation audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    /// Unique record ID (ULID for time-ordering).
    pub id: Ulid,

    /// The billing session reconciled.
    pub billing_session_id: BillingSessionId,

    /// The stream session it billed.
    pub stream_session_id: StreamSessionId,

    /// What was detected.
    pub condition: DetectedCondition,

    /// What was done about it.
    pub action: ReconcileAction,

    /// Human-actionable detail (gateway error text, durations, ids).
    pub detail: Option<String>,

    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

impl ReconciliationRecord {
    /// Create a new record for a session.
    #[must_use]
    pub fn new(
        billing_session_id: BillingSessionId,
        stream_session_id: StreamSessionId,
        condition: DetectedCondition,
        action: ReconcileAction,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            billing_session_id,
            stream_session_id,
            condition,
            action,
            detail,
            created_at: Utc::now(),
        }
    }
}

/// The condition that triggered reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedCondition {
    /// Session sat in `PaymentPending` past the staleness threshold.
    StuckPending,

    /// Session sat in `Active` past the staleness threshold with no end
    /// signal (client disconnect without teardown).
    StuckActive,

    /// Session sat in `Completing` past the staleness threshold.
    StuckCompleting,

    /// The gateway capture failed at settlement.
    CaptureFailed,

    /// A reconciliation refund attempt failed.
    RefundFailed,

    /// A duplicate end-of-call signal arrived for a settling or settled
    /// session.
    DoubleEnd,

    /// A gateway webhook disagreed with locally recorded state.
    WebhookMismatch,
}

/// The corrective action taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Funds were released back to the explorer.
    Refunded,

    /// The session was moved to `PaymentFailed` (nothing was charged).
    MarkedPaymentFailed,

    /// A stuck session was force-ended and settled.
    ForcedCompletion,

    /// Automatic correction failed; operators must follow up.
    Escalated,

    /// The signal was absorbed as a no-op.
    Ignored,
}
