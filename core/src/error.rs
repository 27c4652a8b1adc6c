//! Error types for callbill core operations.

use crate::ids::StreamSessionId;
use crate::session::TransitionError;

/// Result type for billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Errors that can occur in the billing pipeline.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Bid amount must be positive.
    #[error("invalid amount: {amount_cents} cents")]
    InvalidAmount {
        /// The rejected amount in cents.
        amount_cents: i64,
    },

    /// The stream is not accepting bids.
    #[error("stream session {0} is not accepting bids")]
    SessionNotAcceptingBids(StreamSessionId),

    /// Bid lookup failed.
    #[error("bid not found: {0}")]
    BidNotFound(String),

    /// The bid was already rejected or expired.
    #[error("bid already resolved: {0}")]
    BidAlreadyResolved(String),

    /// A non-terminal billing session already exists for the stream.
    #[error("stream session {0} already has active billing")]
    SessionHasActiveBilling(StreamSessionId),

    /// No billing session exists for the stream.
    #[error("no billing session for stream session {0}")]
    SessionNotFound(StreamSessionId),

    /// An illegal state-machine edge was requested.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The payment gateway failed.
    #[error("payment gateway error: {0}")]
    Gateway(String),

    /// Storage failed.
    #[error("storage error: {0}")]
    Storage(String),
}
