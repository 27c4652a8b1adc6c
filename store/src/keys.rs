//! Key encoding utilities for `RocksDB`.
//!
//! All composite keys concatenate fixed-width 16-byte components, so
//! prefix iteration needs no delimiter handling. ULID components are
//! time-ordered, which makes a reverse prefix walk a most-recent-first
//! listing.

use ulid::Ulid;

use callbill_core::{BidId, BillingSessionId, StreamSessionId, UserId};

/// Create a bid key from a bid ID.
#[must_use]
pub fn bid_key(bid_id: &BidId) -> Vec<u8> {
    bid_id.to_bytes().to_vec()
}

/// Create a stream-bid index key.
///
/// Format: `stream_session_id (16 bytes) || bid_id (16 bytes)`
#[must_use]
pub fn stream_bid_key(stream_session_id: &StreamSessionId, bid_id: &BidId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(stream_session_id.as_bytes());
    key.extend_from_slice(&bid_id.to_bytes());
    key
}

/// Create a prefix for iterating a stream's bids.
#[must_use]
pub fn stream_bids_prefix(stream_session_id: &StreamSessionId) -> Vec<u8> {
    stream_session_id.as_bytes().to_vec()
}

/// Create a session key from a billing session ID.
#[must_use]
pub fn session_key(session_id: &BillingSessionId) -> Vec<u8> {
    session_id.to_bytes().to_vec()
}

/// Create a user-session index key.
///
/// Format: `user_id (16 bytes) || session_id (16 bytes)`
#[must_use]
pub fn user_session_key(user_id: &UserId, session_id: &BillingSessionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&session_id.to_bytes());
    key
}

/// Create a prefix for iterating a user's sessions.
#[must_use]
pub fn user_sessions_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// The exclusive upper bound of a user's session index range, for reverse
/// (most-recent-first) iteration.
#[must_use]
pub fn user_sessions_upper_bound(user_id: &UserId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&[0xFF; 16]);
    key
}

/// Extract the session ID from a composite index key (`prefix || session_id`).
///
/// # Panics
///
/// Panics if the key is not at least 32 bytes.
#[must_use]
pub fn extract_session_id_from_index_key(key: &[u8]) -> BillingSessionId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[16..32]);
    BillingSessionId::from_bytes(bytes).expect("valid ULID bytes")
}

/// Extract the bid ID from a stream-bid index key.
///
/// # Panics
///
/// Panics if the key is not at least 32 bytes.
#[must_use]
pub fn extract_bid_id_from_stream_key(key: &[u8]) -> BidId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[16..32]);
    BidId::from_bytes(bytes).expect("valid ULID bytes")
}

/// Create a stream-session index key.
///
/// Format: `stream_session_id (16 bytes) || session_id (16 bytes)`
#[must_use]
pub fn stream_session_key(
    stream_session_id: &StreamSessionId,
    session_id: &BillingSessionId,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(stream_session_id.as_bytes());
    key.extend_from_slice(&session_id.to_bytes());
    key
}

/// Create a prefix for iterating a stream's sessions.
#[must_use]
pub fn stream_sessions_prefix(stream_session_id: &StreamSessionId) -> Vec<u8> {
    stream_session_id.as_bytes().to_vec()
}

/// The exclusive upper bound of a stream's session index range, for
/// reverse (most-recent-first) iteration.
#[must_use]
pub fn stream_sessions_upper_bound(stream_session_id: &StreamSessionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(stream_session_id.as_bytes());
    key.extend_from_slice(&[0xFF; 16]);
    key
}

/// Create the active-session key for a stream.
#[must_use]
pub fn active_stream_key(stream_session_id: &StreamSessionId) -> Vec<u8> {
    stream_session_id.as_bytes().to_vec()
}

/// Create a reconciliation key.
///
/// Format: `session_id (16 bytes) || record_id (16 bytes)`
#[must_use]
pub fn reconciliation_key(session_id: &BillingSessionId, record_id: &Ulid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(&session_id.to_bytes());
    key.extend_from_slice(&record_id.to_bytes());
    key
}

/// Create a prefix for iterating a session's reconciliation records.
#[must_use]
pub fn reconciliations_prefix(session_id: &BillingSessionId) -> Vec<u8> {
    session_id.to_bytes().to_vec()
}
