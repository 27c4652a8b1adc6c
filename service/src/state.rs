//! Shared application state.

use std::sync::Arc;

use callbill_store::Store;

use crate::broadcaster::EventBroadcaster;
use crate::config::ServiceConfig;
use crate::gateway::PaymentGateway;
use crate::manager::BillingManager;
use crate::registry::BidRegistry;

/// Shared application state for all HTTP handlers.
pub struct AppState {
    /// Service configuration.
    pub config: ServiceConfig,

    /// Storage layer.
    pub store: Arc<dyn Store>,

    /// Payment gateway.
    pub gateway: Arc<dyn PaymentGateway>,

    /// Billing event fan-out.
    pub broadcaster: Arc<EventBroadcaster>,

    /// Billing session orchestration.
    pub manager: Arc<BillingManager>,

    /// Bid lifecycle.
    pub registry: Arc<BidRegistry>,
}

impl AppState {
    /// Wire the billing pipeline over the given store and gateway.
    #[must_use]
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Arc<Self> {
        let broadcaster = Arc::new(EventBroadcaster::new());
        let manager = Arc::new(BillingManager::new(
            store.clone(),
            gateway.clone(),
            broadcaster.clone(),
        ));
        let registry = Arc::new(BidRegistry::new(
            store.clone(),
            manager.clone(),
            config.bid_ttl_seconds,
        ));

        Arc::new(Self {
            config,
            store,
            gateway,
            broadcaster,
            manager,
            registry,
        })
    }
}
