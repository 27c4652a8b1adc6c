//! Payment gateway abstraction.
//!
//! The gateway is the only external money seam: a capability trait with
//! two-phase authorize/capture plus refund, so the billing manager never
//! sees provider-specific types. `StripeGateway` backs production;
//! [`FakeGateway`] backs tests and gateway-less deployments.

use async_trait::async_trait;

use callbill_core::BillingSessionId;

pub mod fake;
pub mod stripe;

pub use fake::FakeGateway;
pub use stripe::StripeGateway;

/// What a refund targets: a captured charge, or an uncaptured
/// authorization (released by cancelling the intent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundTarget<'a> {
    /// A captured charge id.
    Charge(&'a str),
    /// An uncaptured payment intent id.
    Intent(&'a str),
}

/// Payment provider capability.
///
/// Every operation is fallible and bounded by the implementation's
/// request timeout; a timeout surfaces as [`GatewayError::Timeout`] and
/// is treated as failure, never success.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Reserve funds for a session. Idempotent per `session_id`: the
    /// implementation keys the request on the session so a retry cannot
    /// create a second reservation.
    async fn authorize(
        &self,
        session_id: &BillingSessionId,
        amount_cents: i64,
    ) -> Result<String, GatewayError>;

    /// Capture a reserved amount. Returns the charge id.
    async fn capture(&self, intent_id: &str, amount_cents: i64) -> Result<String, GatewayError>;

    /// Release funds back to the payer. Returns the refund id.
    async fn refund(&self, target: RefundTarget<'_>) -> Result<String, GatewayError>;

    /// Liveness of the gateway connection.
    async fn health_check(&self) -> Result<(), GatewayError>;

    /// Verify a provider webhook signature over the raw payload.
    fn verify_webhook(&self, payload: &str, signature: &str) -> Result<(), GatewayError>;
}

/// Errors from gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider rejected the request.
    #[error("gateway API error: {code} - {message}")]
    Api {
        /// Provider error code.
        code: String,
        /// Provider error message.
        message: String,
    },

    /// The payment was declined; retrying will not help.
    #[error("payment declined: {0}")]
    Declined(String),

    /// The provider is unavailable (5xx).
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    /// The bounded request timeout elapsed.
    #[error("gateway request timed out")]
    Timeout,

    /// Webhook signature verification failed.
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// The gateway is not configured for this operation.
    #[error("gateway configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    /// Whether a single idempotent retry is worthwhile.
    ///
    /// Declines and API rejections are final; transport failures,
    /// timeouts, and provider unavailability may be transient.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout | Self::Unavailable(_) => true,
            Self::Api { .. }
            | Self::Declined(_)
            | Self::InvalidSignature
            | Self::Configuration(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declines_are_not_retryable() {
        assert!(!GatewayError::Declined("card_declined".into()).is_retryable());
        assert!(!GatewayError::Api {
            code: "invalid_request".into(),
            message: "bad param".into(),
        }
        .is_retryable());
    }

    #[test]
    fn timeouts_and_outages_are_retryable() {
        assert!(GatewayError::Timeout.is_retryable());
        assert!(GatewayError::Unavailable("503".into()).is_retryable());
    }
}
