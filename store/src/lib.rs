//! `RocksDB` storage layer for callbill.
//!
//! This crate provides persistent storage for bids, billing sessions, and
//! reconciliation records using `RocksDB` with column families for
//! indexing.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `bids`: Bid records, keyed by `bid_id` (ULID)
//! - `bids_by_stream`: Index for listing a stream's bids
//! - `sessions`: Billing sessions, keyed by `session_id` (ULID)
//! - `sessions_by_user`: Index for listing a user's sessions (both parties)
//! - `active_by_stream`: The stream's single non-terminal session, if any
//! - `reconciliations`: Append-only reconciliation audit trail
//!
//! The `active_by_stream` family is what enforces the at-most-one-active
//! invariant at the storage boundary: [`Store::create_session`] refuses to
//! claim an occupied slot, and terminal updates release it in the same
//! write batch as the session record.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;

use callbill_core::{
    Bid, BidId, BillingSession, BillingSessionId, ReconciliationRecord, StreamSessionId, UserId,
};

/// The storage trait defining all database operations.
///
/// Abstracts the storage layer so the service can run against `RocksDB` in
/// production and a temporary database in tests.
pub trait Store: Send + Sync {
    // =========================================================================
    // Bid Operations
    // =========================================================================

    /// Insert or update a bid record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_bid(&self, bid: &Bid) -> Result<()>;

    /// Get a bid by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_bid(&self, bid_id: &BidId) -> Result<Option<Bid>>;

    /// List all bids for a stream session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_bids_by_stream(&self, stream_session_id: &StreamSessionId) -> Result<Vec<Bid>>;

    /// List every bid currently in `Open` status. Used by the expiry sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_open_bids(&self) -> Result<Vec<Bid>>;

    // =========================================================================
    // Billing Session Operations
    // =========================================================================

    /// Insert a new billing session and claim its stream's active slot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ActiveSessionExists`] if a non-terminal
    /// session already holds the slot, or an error if the database
    /// operation fails.
    fn create_session(&self, session: &BillingSession) -> Result<()>;

    /// Update an existing billing session. A terminal session releases its
    /// stream's active slot atomically with the record write.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn update_session(&self, session: &BillingSession) -> Result<()>;

    /// Get a billing session by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_session(&self, session_id: &BillingSessionId) -> Result<Option<BillingSession>>;

    /// Get the stream's non-terminal session, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_active_session(
        &self,
        stream_session_id: &StreamSessionId,
    ) -> Result<Option<BillingSession>>;

    /// Get the stream's most recent session, terminal or not. Used by
    /// reconciliation, which must reach sessions that already released
    /// the active slot (e.g. `Failed` awaiting refund).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_latest_session_for_stream(
        &self,
        stream_session_id: &StreamSessionId,
    ) -> Result<Option<BillingSession>>;

    /// List every non-terminal session. Used by the staleness sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_active_sessions(&self) -> Result<Vec<BillingSession>>;

    /// List a user's billing sessions, most recent first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_sessions_by_user(&self, user_id: &UserId, limit: usize)
        -> Result<Vec<BillingSession>>;

    // =========================================================================
    // Reconciliation Operations
    // =========================================================================

    /// Append a reconciliation record to the audit trail.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn append_reconciliation(&self, record: &ReconciliationRecord) -> Result<()>;

    /// List a session's reconciliation records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_reconciliations(
        &self,
        session_id: &BillingSessionId,
    ) -> Result<Vec<ReconciliationRecord>>;
}
