//! Bid types for callbill.
//!
//! An explorer places a bid against a stream session; the influencer
//! accepts or rejects it. Acceptance is what creates a billing session.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{BidId, StreamSessionId, UserId};

/// An explorer's monetary offer to start a paid call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    /// Unique bid ID (ULID for time-ordering).
    pub id: BidId,

    /// The stream session the bid targets.
    pub stream_session_id: StreamSessionId,

    /// The bidding explorer.
    pub explorer_id: UserId,

    /// The influencer being bid on.
    pub influencer_id: UserId,

    /// Offered amount in cents. Always positive.
    pub amount_cents: i64,

    /// Optional per-minute overage rate in cents.
    pub rate_per_minute_cents: Option<i64>,

    /// Current lifecycle status.
    pub status: BidStatus,

    /// When the bid was placed.
    pub created_at: DateTime<Utc>,

    /// When an unresolved bid lapses.
    pub expires_at: DateTime<Utc>,

    /// When the bid was accepted, rejected, or expired.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Bid {
    /// Create a new open bid.
    #[must_use]
    pub fn new(
        stream_session_id: StreamSessionId,
        explorer_id: UserId,
        influencer_id: UserId,
        amount_cents: i64,
        rate_per_minute_cents: Option<i64>,
        ttl_secs: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: BidId::generate(),
            stream_session_id,
            explorer_id,
            influencer_id,
            amount_cents,
            rate_per_minute_cents,
            status: BidStatus::Open,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            resolved_at: None,
        }
    }

    /// Whether the bid can still be resolved by the influencer.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == BidStatus::Open
    }

    /// Whether the bid's TTL has lapsed (only meaningful for open bids).
    #[must_use]
    pub fn is_past_ttl(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && now > self.expires_at
    }

    /// Mark the bid accepted.
    pub fn accept(&mut self) {
        self.status = BidStatus::Accepted;
        self.resolved_at = Some(Utc::now());
    }

    /// Mark the bid rejected.
    pub fn reject(&mut self) {
        self.status = BidStatus::Rejected;
        self.resolved_at = Some(Utc::now());
    }

    /// Mark the bid expired.
    pub fn expire(&mut self) {
        self.status = BidStatus::Expired;
        self.resolved_at = Some(Utc::now());
    }
}

/// Bid lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    /// Awaiting the influencer's decision.
    Open,

    /// Accepted; a billing session was created.
    Accepted,

    /// Declined by the influencer.
    Rejected,

    /// TTL lapsed before resolution.
    Expired,
}
