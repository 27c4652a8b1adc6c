//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store`
//! trait.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use callbill_core::{
    Bid, BidId, BillingSession, BillingSessionId, ReconciliationRecord, StreamSessionId, UserId,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Collect all values under a key prefix in one column family.
    fn collect_prefix<T: serde::de::DeserializeOwned>(
        &self,
        cf_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut items = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            items.push((key.to_vec(), Self::deserialize(&value)?));
        }

        Ok(items)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Bid Operations
    // =========================================================================

    fn put_bid(&self, bid: &Bid) -> Result<()> {
        let cf_bids = self.cf(cf::BIDS)?;
        let cf_by_stream = self.cf(cf::BIDS_BY_STREAM)?;

        let bid_key = keys::bid_key(&bid.id);
        let stream_key = keys::stream_bid_key(&bid.stream_session_id, &bid.id);
        let value = Self::serialize(bid)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_bids, &bid_key, &value);
        batch.put_cf(&cf_by_stream, &stream_key, []); // Index entry (empty value)

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn get_bid(&self, bid_id: &BidId) -> Result<Option<Bid>> {
        let cf = self.cf(cf::BIDS)?;
        let key = keys::bid_key(bid_id);

        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn list_bids_by_stream(&self, stream_session_id: &StreamSessionId) -> Result<Vec<Bid>> {
        let cf_by_stream = self.cf(cf::BIDS_BY_STREAM)?;
        let prefix = keys::stream_bids_prefix(stream_session_id);

        let iter = self
            .db
            .iterator_cf(&cf_by_stream, IteratorMode::From(&prefix, Direction::Forward));

        let mut bids = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }

            let bid_id = keys::extract_bid_id_from_stream_key(&key);
            if let Some(bid) = self.get_bid(&bid_id)? {
                bids.push(bid);
            }
        }

        Ok(bids)
    }

    fn list_open_bids(&self) -> Result<Vec<Bid>> {
        let cf = self.cf(cf::BIDS)?;
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);

        let mut bids = Vec::new();
        for item in iter {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let bid: Bid = Self::deserialize(&value)?;
            if bid.is_open() {
                bids.push(bid);
            }
        }

        Ok(bids)
    }

    // =========================================================================
    // Billing Session Operations
    // =========================================================================

    fn create_session(&self, session: &BillingSession) -> Result<()> {
        let cf_active = self.cf(cf::ACTIVE_BY_STREAM)?;
        let active_key = keys::active_stream_key(&session.stream_session_id);

        // The active slot is the uniqueness guard: one non-terminal session
        // per stream.
        let occupied = self
            .db
            .get_cf(&cf_active, &active_key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .is_some();
        if occupied {
            return Err(StoreError::ActiveSessionExists {
                stream_session_id: session.stream_session_id,
            });
        }

        let cf_sessions = self.cf(cf::SESSIONS)?;
        let cf_by_user = self.cf(cf::SESSIONS_BY_USER)?;

        let session_key = keys::session_key(&session.id);
        let value = Self::serialize(session)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_sessions, &session_key, &value);
        batch.put_cf(
            &cf_by_user,
            keys::user_session_key(&session.explorer_id, &session.id),
            [],
        );
        batch.put_cf(
            &cf_by_user,
            keys::user_session_key(&session.influencer_id, &session.id),
            [],
        );
        batch.put_cf(
            &self.cf(cf::SESSIONS_BY_STREAM)?,
            keys::stream_session_key(&session.stream_session_id, &session.id),
            [],
        );
        if !session.is_terminal() {
            batch.put_cf(&cf_active, &active_key, session.id.to_bytes());
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn update_session(&self, session: &BillingSession) -> Result<()> {
        let cf_sessions = self.cf(cf::SESSIONS)?;
        let cf_active = self.cf(cf::ACTIVE_BY_STREAM)?;

        let session_key = keys::session_key(&session.id);
        let active_key = keys::active_stream_key(&session.stream_session_id);
        let value = Self::serialize(session)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_sessions, &session_key, &value);

        if session.is_terminal() {
            // Release the slot only if this session holds it; a newer
            // session may have claimed the stream already.
            let holder = self
                .db
                .get_cf(&cf_active, &active_key)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            if holder.as_deref() == Some(session.id.to_bytes().as_slice()) {
                batch.delete_cf(&cf_active, &active_key);
            }
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn get_session(&self, session_id: &BillingSessionId) -> Result<Option<BillingSession>> {
        let cf = self.cf(cf::SESSIONS)?;
        let key = keys::session_key(session_id);

        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn get_active_session(
        &self,
        stream_session_id: &StreamSessionId,
    ) -> Result<Option<BillingSession>> {
        let cf_active = self.cf(cf::ACTIVE_BY_STREAM)?;
        let active_key = keys::active_stream_key(stream_session_id);

        let Some(id_bytes) = self
            .db
            .get_cf(&cf_active, active_key)
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };

        let mut bytes = [0u8; 16];
        if id_bytes.len() != 16 {
            return Err(StoreError::Database("corrupt active-session entry".into()));
        }
        bytes.copy_from_slice(&id_bytes);
        let session_id = BillingSessionId::from_bytes(bytes)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        self.get_session(&session_id)
    }

    fn get_latest_session_for_stream(
        &self,
        stream_session_id: &StreamSessionId,
    ) -> Result<Option<BillingSession>> {
        let cf_by_stream = self.cf(cf::SESSIONS_BY_STREAM)?;
        let prefix = keys::stream_sessions_prefix(stream_session_id);
        let upper = keys::stream_sessions_upper_bound(stream_session_id);

        let iter = self
            .db
            .iterator_cf(&cf_by_stream, IteratorMode::From(&upper, Direction::Reverse));

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                return Ok(None);
            }
            let session_id = keys::extract_session_id_from_index_key(&key);
            return self.get_session(&session_id);
        }

        Ok(None)
    }

    fn list_active_sessions(&self) -> Result<Vec<BillingSession>> {
        let cf_active = self.cf(cf::ACTIVE_BY_STREAM)?;
        let iter = self.db.iterator_cf(&cf_active, IteratorMode::Start);

        let mut sessions = Vec::new();
        for item in iter {
            let (_, id_bytes) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if id_bytes.len() != 16 {
                continue;
            }
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&id_bytes);
            let session_id = BillingSessionId::from_bytes(bytes)
                .map_err(|e| StoreError::Database(e.to_string()))?;

            if let Some(session) = self.get_session(&session_id)? {
                sessions.push(session);
            }
        }

        Ok(sessions)
    }

    fn list_sessions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<BillingSession>> {
        let cf_by_user = self.cf(cf::SESSIONS_BY_USER)?;
        let prefix = keys::user_sessions_prefix(user_id);
        let upper = keys::user_sessions_upper_bound(user_id);

        // ULID session ids are time-ordered, so walking the index in
        // reverse from the range's upper bound yields newest first.
        let iter = self
            .db
            .iterator_cf(&cf_by_user, IteratorMode::From(&upper, Direction::Reverse));

        let mut sessions = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            if sessions.len() >= limit {
                break;
            }

            let session_id = keys::extract_session_id_from_index_key(&key);
            if let Some(session) = self.get_session(&session_id)? {
                sessions.push(session);
            }
        }

        Ok(sessions)
    }

    // =========================================================================
    // Reconciliation Operations
    // =========================================================================

    fn append_reconciliation(&self, record: &ReconciliationRecord) -> Result<()> {
        let cf = self.cf(cf::RECONCILIATIONS)?;
        let key = keys::reconciliation_key(&record.billing_session_id, &record.id);
        let value = Self::serialize(record)?;

        self.db
            .put_cf(&cf, key, value)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn list_reconciliations(
        &self,
        session_id: &BillingSessionId,
    ) -> Result<Vec<ReconciliationRecord>> {
        let prefix = keys::reconciliations_prefix(session_id);
        Ok(self
            .collect_prefix::<ReconciliationRecord>(cf::RECONCILIATIONS, &prefix)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }
}
