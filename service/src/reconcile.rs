//! Background reconciliation sweep.
//!
//! The sweeper periodically expires lapsed bids and pushes stale
//! billing sessions through [`BillingManager::reconcile`]. A session is
//! stale when its `updated_at` has not moved for longer than the
//! configured staleness threshold, which covers clients that
//! disconnect without sending an end-of-call signal and gateway calls
//! that never came back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use callbill_store::Store;

use crate::manager::BillingManager;
use crate::registry::BidRegistry;

/// Periodic reconciliation driver.
pub struct Sweeper {
    store: Arc<dyn Store>,
    manager: Arc<BillingManager>,
    registry: Arc<BidRegistry>,
    staleness_threshold: chrono::Duration,
    interval: Duration,
}

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Bids expired this pass.
    pub bids_expired: usize,
    /// Stale sessions pushed through reconciliation.
    pub sessions_reconciled: usize,
    /// Reconciliations that themselves failed (logged and left for the
    /// next pass).
    pub failures: usize,
}

impl Sweeper {
    /// Create a sweeper over the billing pipeline.
    pub fn new(
        store: Arc<dyn Store>,
        manager: Arc<BillingManager>,
        registry: Arc<BidRegistry>,
        staleness_threshold_seconds: i64,
        interval_seconds: u64,
    ) -> Self {
        Self {
            store,
            manager,
            registry,
            staleness_threshold: chrono::Duration::seconds(staleness_threshold_seconds),
            interval: Duration::from_secs(interval_seconds),
        }
    }

    /// Run the sweep loop forever. Spawn this on the runtime.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = self.sweep_once().await;
            if report != SweepReport::default() {
                tracing::info!(
                    bids_expired = report.bids_expired,
                    sessions_reconciled = report.sessions_reconciled,
                    failures = report.failures,
                    "Reconciliation sweep complete"
                );
            }
        }
    }

    /// Run a single sweep pass.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.registry.expire_open_bids() {
            Ok(count) => report.bids_expired = count,
            Err(err) => {
                tracing::error!(error = %err, "Bid expiry sweep failed");
                report.failures += 1;
            }
        }

        let sessions = match self.store.list_active_sessions() {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::error!(error = %err, "Could not list active sessions");
                report.failures += 1;
                return report;
            }
        };

        let cutoff = Utc::now() - self.staleness_threshold;
        for session in sessions {
            if session.updated_at > cutoff {
                continue;
            }

            tracing::warn!(
                billing_session_id = %session.id,
                stream_session_id = %session.stream_session_id,
                status = session.status.as_str(),
                updated_at = %session.updated_at,
                "Stale billing session detected"
            );

            match self.manager.reconcile(session.stream_session_id).await {
                Ok(_) => report.sessions_reconciled += 1,
                Err(err) => {
                    tracing::error!(
                        billing_session_id = %session.id,
                        error = %err,
                        "Reconciliation failed; will retry next sweep"
                    );
                    report.failures += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::EventBroadcaster;
    use crate::gateway::FakeGateway;
    use callbill_core::{BillingStatus, StreamSessionId, UserId};
    use callbill_store::RocksStore;
    use tempfile::TempDir;

    struct Fixture {
        sweeper: Sweeper,
        manager: Arc<BillingManager>,
        registry: Arc<BidRegistry>,
        _dir: TempDir,
    }

    fn fixture(staleness_secs: i64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let manager = Arc::new(BillingManager::new(
            store.clone(),
            Arc::new(FakeGateway::new()),
            Arc::new(EventBroadcaster::new()),
        ));
        let registry = Arc::new(BidRegistry::new(store.clone(), manager.clone(), 0));
        let sweeper = Sweeper::new(
            store,
            manager.clone(),
            registry.clone(),
            staleness_secs,
            60,
        );
        Fixture {
            sweeper,
            manager,
            registry,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn fresh_sessions_are_left_alone() {
        let fx = fixture(300);
        let stream = StreamSessionId::generate();
        fx.manager
            .open(stream, UserId::generate(), UserId::generate(), None, 2500, None)
            .unwrap();

        let report = fx.sweeper.sweep_once().await;
        assert_eq!(report.sessions_reconciled, 0);

        let session = fx.manager.latest_session(&stream).unwrap().unwrap();
        assert_eq!(session.status, BillingStatus::Created);
    }

    #[tokio::test]
    async fn stale_active_session_is_settled() {
        // Zero threshold makes every session immediately stale.
        let fx = fixture(0);
        let stream = StreamSessionId::generate();
        fx.manager
            .open(stream, UserId::generate(), UserId::generate(), None, 2500, None)
            .unwrap();
        fx.manager.start_call_billing(stream).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = fx.sweeper.sweep_once().await;
        assert_eq!(report.sessions_reconciled, 1);

        let session = fx.manager.latest_session(&stream).unwrap().unwrap();
        assert_eq!(session.status, BillingStatus::Completed);
    }

    #[tokio::test]
    async fn lapsed_bids_expire_during_sweep() {
        let fx = fixture(300);
        let stream = StreamSessionId::generate();
        fx.registry
            .place_bid(stream, UserId::generate(), UserId::generate(), 2500, None)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = fx.sweeper.sweep_once().await;
        assert_eq!(report.bids_expired, 1);
    }
}
