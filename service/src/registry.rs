//! Bid placement and resolution.
//!
//! The registry validates bids against the stream's billing state and
//! turns an accepted bid into a `Created` billing session. Acceptance
//! is first-wins: claiming the stream's active slot is what decides the
//! race, and the losing sibling bids are rejected in the same pass.

use std::sync::Arc;

use chrono::Utc;

use callbill_core::{
    Bid, BidId, BidStatus, BillingError, BillingSession, Result, StreamSessionId, UserId,
};
use callbill_store::Store;

use crate::manager::BillingManager;

/// Manages the bid lifecycle for stream sessions.
pub struct BidRegistry {
    store: Arc<dyn Store>,
    manager: Arc<BillingManager>,
    bid_ttl_secs: i64,
}

impl BidRegistry {
    /// Create a registry with the given bid time-to-live.
    pub fn new(store: Arc<dyn Store>, manager: Arc<BillingManager>, bid_ttl_secs: i64) -> Self {
        Self {
            store,
            manager,
            bid_ttl_secs,
        }
    }

    /// Place a bid against a stream session.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::InvalidAmount`] for non-positive amounts
    /// and [`BillingError::SessionNotAcceptingBids`] while the stream
    /// has active billing.
    pub fn place_bid(
        &self,
        stream_session_id: StreamSessionId,
        explorer_id: UserId,
        influencer_id: UserId,
        amount_cents: i64,
        rate_per_minute_cents: Option<i64>,
    ) -> Result<Bid> {
        if amount_cents <= 0 {
            return Err(BillingError::InvalidAmount { amount_cents });
        }
        if let Some(rate) = rate_per_minute_cents {
            if rate < 0 {
                return Err(BillingError::InvalidAmount { amount_cents: rate });
            }
        }

        // A stream currently being billed is not taking offers.
        if self
            .store
            .get_active_session(&stream_session_id)
            .map_err(storage_err)?
            .is_some()
        {
            return Err(BillingError::SessionNotAcceptingBids(stream_session_id));
        }

        let bid = Bid::new(
            stream_session_id,
            explorer_id,
            influencer_id,
            amount_cents,
            rate_per_minute_cents,
            self.bid_ttl_secs,
        );
        self.store.put_bid(&bid).map_err(storage_err)?;

        tracing::info!(
            bid_id = %bid.id,
            stream_session_id = %stream_session_id,
            amount_cents,
            "Bid placed"
        );
        Ok(bid)
    }

    /// Accept a bid, creating a `Created` billing session and rejecting
    /// the stream's other open bids.
    ///
    /// Idempotent: re-accepting an already accepted bid returns it with
    /// the session it produced.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::BidNotFound`] for unknown ids,
    /// [`BillingError::BidAlreadyResolved`] for rejected or expired
    /// bids, and [`BillingError::SessionHasActiveBilling`] if another
    /// bid won the stream first.
    pub fn accept_bid(&self, bid_id: &BidId) -> Result<(Bid, BillingSession)> {
        let mut bid = self
            .store
            .get_bid(bid_id)
            .map_err(storage_err)?
            .ok_or_else(|| BillingError::BidNotFound(bid_id.to_string()))?;

        match bid.status {
            BidStatus::Accepted => {
                let session = self
                    .manager
                    .latest_session(&bid.stream_session_id)?
                    .ok_or(BillingError::SessionNotFound(bid.stream_session_id))?;
                return Ok((bid, session));
            }
            BidStatus::Rejected | BidStatus::Expired => {
                return Err(BillingError::BidAlreadyResolved(bid_id.to_string()));
            }
            BidStatus::Open => {}
        }

        if bid.is_past_ttl(Utc::now()) {
            bid.expire();
            self.store.put_bid(&bid).map_err(storage_err)?;
            return Err(BillingError::BidAlreadyResolved(bid_id.to_string()));
        }

        // Claiming the active slot decides acceptance races.
        let session = self.manager.open(
            bid.stream_session_id,
            bid.explorer_id,
            bid.influencer_id,
            Some(bid.id),
            bid.amount_cents,
            bid.rate_per_minute_cents,
        )?;

        bid.accept();
        self.store.put_bid(&bid).map_err(storage_err)?;
        self.reject_siblings(&bid)?;

        tracing::info!(
            bid_id = %bid.id,
            billing_session_id = %session.id,
            "Bid accepted"
        );
        Ok((bid, session))
    }

    /// Reject a bid. Rejecting an already rejected bid is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::BidNotFound`] for unknown ids and
    /// [`BillingError::BidAlreadyResolved`] for accepted or expired
    /// bids.
    pub fn reject_bid(&self, bid_id: &BidId) -> Result<Bid> {
        let mut bid = self
            .store
            .get_bid(bid_id)
            .map_err(storage_err)?
            .ok_or_else(|| BillingError::BidNotFound(bid_id.to_string()))?;

        match bid.status {
            BidStatus::Rejected => Ok(bid),
            BidStatus::Open => {
                bid.reject();
                self.store.put_bid(&bid).map_err(storage_err)?;
                tracing::info!(bid_id = %bid.id, "Bid rejected");
                Ok(bid)
            }
            BidStatus::Accepted | BidStatus::Expired => {
                Err(BillingError::BidAlreadyResolved(bid_id.to_string()))
            }
        }
    }

    /// Get a bid by id.
    ///
    /// # Errors
    ///
    /// Returns [`BillingError::BidNotFound`] for unknown ids.
    pub fn get_bid(&self, bid_id: &BidId) -> Result<Bid> {
        self.store
            .get_bid(bid_id)
            .map_err(storage_err)?
            .ok_or_else(|| BillingError::BidNotFound(bid_id.to_string()))
    }

    /// List a stream's bids, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn list_bids(&self, stream_session_id: &StreamSessionId) -> Result<Vec<Bid>> {
        self.store
            .list_bids_by_stream(stream_session_id)
            .map_err(storage_err)
    }

    /// Expire open bids whose TTL has lapsed. Returns how many were
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn expire_open_bids(&self) -> Result<usize> {
        let now = Utc::now();
        let mut expired = 0;

        for mut bid in self.store.list_open_bids().map_err(storage_err)? {
            if bid.is_past_ttl(now) {
                bid.expire();
                self.store.put_bid(&bid).map_err(storage_err)?;
                expired += 1;
            }
        }

        if expired > 0 {
            tracing::info!(count = expired, "Expired lapsed bids");
        }
        Ok(expired)
    }

    /// Reject the stream's remaining open bids after one was accepted.
    fn reject_siblings(&self, winner: &Bid) -> Result<()> {
        for mut sibling in self
            .store
            .list_bids_by_stream(&winner.stream_session_id)
            .map_err(storage_err)?
        {
            if sibling.id != winner.id && sibling.is_open() {
                sibling.reject();
                self.store.put_bid(&sibling).map_err(storage_err)?;
            }
        }
        Ok(())
    }
}

fn storage_err(err: callbill_store::StoreError) -> BillingError {
    BillingError::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::EventBroadcaster;
    use crate::gateway::FakeGateway;
    use callbill_core::BillingStatus;
    use callbill_store::RocksStore;
    use tempfile::TempDir;

    struct Fixture {
        registry: BidRegistry,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let manager = Arc::new(BillingManager::new(
            store.clone(),
            Arc::new(FakeGateway::new()),
            Arc::new(EventBroadcaster::new()),
        ));
        Fixture {
            registry: BidRegistry::new(store, manager, 300),
            _dir: dir,
        }
    }

    fn parties() -> (StreamSessionId, UserId, UserId) {
        (
            StreamSessionId::generate(),
            UserId::generate(),
            UserId::generate(),
        )
    }

    #[test]
    fn accepting_a_bid_opens_billing() {
        let fx = fixture();
        let (stream, explorer, influencer) = parties();

        let bid = fx
            .registry
            .place_bid(stream, explorer, influencer, 2500, None)
            .unwrap();
        let (bid, session) = fx.registry.accept_bid(&bid.id).unwrap();

        assert_eq!(bid.status, BidStatus::Accepted);
        assert_eq!(session.status, BillingStatus::Created);
        assert_eq!(session.bid_amount_cents, 2500);
        assert_eq!(session.bid_id, Some(bid.id));
    }

    #[test]
    fn accept_rejects_sibling_bids() {
        let fx = fixture();
        let (stream, _, influencer) = parties();

        let winner = fx
            .registry
            .place_bid(stream, UserId::generate(), influencer, 2500, None)
            .unwrap();
        let loser = fx
            .registry
            .place_bid(stream, UserId::generate(), influencer, 2000, None)
            .unwrap();

        fx.registry.accept_bid(&winner.id).unwrap();

        let loser = fx.registry.get_bid(&loser.id).unwrap();
        assert_eq!(loser.status, BidStatus::Rejected);
    }

    #[test]
    fn accept_is_idempotent() {
        let fx = fixture();
        let (stream, explorer, influencer) = parties();

        let bid = fx
            .registry
            .place_bid(stream, explorer, influencer, 2500, None)
            .unwrap();
        let (_, first) = fx.registry.accept_bid(&bid.id).unwrap();
        let (_, second) = fx.registry.accept_bid(&bid.id).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn bids_refused_while_billing_active() {
        let fx = fixture();
        let (stream, explorer, influencer) = parties();

        let bid = fx
            .registry
            .place_bid(stream, explorer, influencer, 2500, None)
            .unwrap();
        fx.registry.accept_bid(&bid.id).unwrap();

        let err = fx
            .registry
            .place_bid(stream, UserId::generate(), influencer, 9000, None)
            .unwrap_err();
        assert!(matches!(err, BillingError::SessionNotAcceptingBids(_)));
    }

    #[test]
    fn rejected_bid_cannot_be_accepted() {
        let fx = fixture();
        let (stream, explorer, influencer) = parties();

        let bid = fx
            .registry
            .place_bid(stream, explorer, influencer, 2500, None)
            .unwrap();
        fx.registry.reject_bid(&bid.id).unwrap();

        let err = fx.registry.accept_bid(&bid.id).unwrap_err();
        assert!(matches!(err, BillingError::BidAlreadyResolved(_)));
    }

    #[test]
    fn zero_amount_rejected() {
        let fx = fixture();
        let (stream, explorer, influencer) = parties();

        let err = fx
            .registry
            .place_bid(stream, explorer, influencer, 0, None)
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidAmount { .. }));
    }

    #[test]
    fn expiry_sweep_only_touches_lapsed_bids() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let manager = Arc::new(BillingManager::new(
            store.clone(),
            Arc::new(FakeGateway::new()),
            Arc::new(EventBroadcaster::new()),
        ));
        let registry = BidRegistry::new(store, manager, 0);
        let (stream, explorer, influencer) = parties();

        let bid = registry
            .place_bid(stream, explorer, influencer, 2500, None)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert_eq!(registry.expire_open_bids().unwrap(), 1);
        let bid = registry.get_bid(&bid.id).unwrap();
        assert_eq!(bid.status, BidStatus::Expired);
    }
}
