//! Billing event types published to call participants.
//!
//! Events are idempotent notifications of a session's *current* state,
//! never commands: each one carries the running totals, so a subscriber
//! that misses intermediate `BILLING_UPDATED` ticks still converges on the
//! correct final state when `BILLING_COMPLETED` arrives.

use serde::{Deserialize, Serialize};

use crate::{BillingSessionId, StreamSessionId};

/// A billing-state transition notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingEvent {
    /// Authorization succeeded; the meter is running.
    BillingStarted {
        /// The stream session.
        session_id: StreamSessionId,
        /// The billing session tracking the charge.
        billing_session_id: BillingSessionId,
        /// Flat bid amount in cents.
        bid_amount_cents: i64,
    },

    /// A rate-meter tick updated the accrued charge.
    BillingUpdated {
        /// The stream session.
        session_id: StreamSessionId,
        /// Accrued charge so far, in cents.
        total_charged_cents: i64,
        /// Elapsed call seconds at the tick.
        duration_secs: u64,
    },

    /// Capture succeeded; the session is settled.
    BillingCompleted {
        /// The stream session.
        session_id: StreamSessionId,
        /// Final captured amount in cents.
        final_amount_cents: i64,
        /// Final call duration in seconds.
        duration_secs: u64,
    },

    /// Authorization or settlement failed.
    PaymentFailed {
        /// The stream session.
        session_id: StreamSessionId,
        /// Failure reason, suitable for display.
        reason: String,
    },

    /// Reconciliation refunded the session.
    RefundProcessed {
        /// The stream session.
        session_id: StreamSessionId,
        /// Gateway refund id.
        refund_id: String,
    },
}

impl BillingEvent {
    /// The stream session this event concerns.
    #[must_use]
    pub const fn session_id(&self) -> StreamSessionId {
        match self {
            Self::BillingStarted { session_id, .. }
            | Self::BillingUpdated { session_id, .. }
            | Self::BillingCompleted { session_id, .. }
            | Self::PaymentFailed { session_id, .. }
            | Self::RefundProcessed { session_id, .. } => *session_id,
        }
    }

    /// The wire tag, as used in payloads and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BillingStarted { .. } => "BILLING_STARTED",
            Self::BillingUpdated { .. } => "BILLING_UPDATED",
            Self::BillingCompleted { .. } => "BILLING_COMPLETED",
            Self::PaymentFailed { .. } => "PAYMENT_FAILED",
            Self::RefundProcessed { .. } => "REFUND_PROCESSED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_screaming_snake_tags() {
        let event = BillingEvent::BillingStarted {
            session_id: StreamSessionId::generate(),
            billing_session_id: BillingSessionId::generate(),
            bid_amount_cents: 2500,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "BILLING_STARTED");
        assert_eq!(json["bid_amount_cents"], 2500);
    }

    #[test]
    fn event_roundtrip() {
        let event = BillingEvent::BillingCompleted {
            session_id: StreamSessionId::generate(),
            final_amount_cents: 2500,
            duration_secs: 180,
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: BillingEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn kind_matches_wire_tag() {
        let event = BillingEvent::PaymentFailed {
            session_id: StreamSessionId::generate(),
            reason: "card_declined".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
    }
}
