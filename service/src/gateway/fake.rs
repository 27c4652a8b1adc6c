//! In-memory payment gateway for tests and local development.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;

use callbill_core::BillingSessionId;

use super::{GatewayError, PaymentGateway, RefundTarget};

/// Gateway that settles everything in memory.
///
/// Failures are scripted per operation; counters record how many times
/// each operation ran so tests can assert capture happens at most once
/// per session.
#[derive(Debug, Default)]
pub struct FakeGateway {
    fail_authorize: AtomicBool,
    fail_capture: AtomicBool,
    fail_refund: AtomicBool,
    authorize_calls: AtomicU64,
    capture_calls: AtomicU64,
    refund_calls: AtomicU64,
}

impl FakeGateway {
    /// Create a gateway that approves everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent authorize calls fail with a decline.
    pub fn fail_authorize(&self, fail: bool) {
        self.fail_authorize.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent capture calls fail with a decline.
    pub fn fail_capture(&self, fail: bool) {
        self.fail_capture.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent refund calls fail as unavailable.
    pub fn fail_refund(&self, fail: bool) {
        self.fail_refund.store(fail, Ordering::SeqCst);
    }

    /// How many authorize calls were made.
    #[must_use]
    pub fn authorize_calls(&self) -> u64 {
        self.authorize_calls.load(Ordering::SeqCst)
    }

    /// How many capture calls were made.
    #[must_use]
    pub fn capture_calls(&self) -> u64 {
        self.capture_calls.load(Ordering::SeqCst)
    }

    /// How many refund calls were made.
    #[must_use]
    pub fn refund_calls(&self) -> u64 {
        self.refund_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn authorize(
        &self,
        session_id: &BillingSessionId,
        _amount_cents: i64,
    ) -> Result<String, GatewayError> {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_authorize.load(Ordering::SeqCst) {
            return Err(GatewayError::Declined("card_declined".into()));
        }
        Ok(format!("pi_fake_{session_id}"))
    }

    async fn capture(&self, intent_id: &str, _amount_cents: i64) -> Result<String, GatewayError> {
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(GatewayError::Declined("capture_declined".into()));
        }
        Ok(format!("ch_fake_{intent_id}"))
    }

    async fn refund(&self, target: RefundTarget<'_>) -> Result<String, GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_refund.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("fake outage".into()));
        }
        match target {
            RefundTarget::Charge(charge_id) => Ok(format!("re_fake_{charge_id}")),
            RefundTarget::Intent(intent_id) => Ok(intent_id.to_string()),
        }
    }

    async fn health_check(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    fn verify_webhook(&self, _payload: &str, _signature: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}
