//! Database schema definitions and column families.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Bid records, keyed by `bid_id` (ULID).
    pub const BIDS: &str = "bids";

    /// Index: bids by stream, keyed by `stream_session_id || bid_id`.
    /// Value is empty (index only).
    pub const BIDS_BY_STREAM: &str = "bids_by_stream";

    /// Billing sessions, keyed by `session_id` (ULID).
    pub const SESSIONS: &str = "sessions";

    /// Index: sessions by user, keyed by `user_id || session_id`.
    /// Written for both the explorer and the influencer. Value is empty.
    pub const SESSIONS_BY_USER: &str = "sessions_by_user";

    /// Index: sessions by stream, keyed by `stream_session_id || session_id`.
    /// Value is empty. Lets reconciliation find a stream's latest session
    /// even after it left the active slot.
    pub const SESSIONS_BY_STREAM: &str = "sessions_by_stream";

    /// The stream's non-terminal session, keyed by `stream_session_id`.
    /// Value is the 16-byte `session_id`. Present iff billing is active.
    pub const ACTIVE_BY_STREAM: &str = "active_by_stream";

    /// Reconciliation audit trail, keyed by `session_id || record_id`.
    pub const RECONCILIATIONS: &str = "reconciliations";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::BIDS,
        cf::BIDS_BY_STREAM,
        cf::SESSIONS,
        cf::SESSIONS_BY_USER,
        cf::SESSIONS_BY_STREAM,
        cf::ACTIVE_BY_STREAM,
        cf::RECONCILIATIONS,
    ]
}
