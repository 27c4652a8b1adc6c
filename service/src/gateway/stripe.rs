//! Stripe payment gateway adapter.
//!
//! Uses manual-capture `PaymentIntents` for the two-phase flow: authorize
//! creates an intent with `capture_method=manual`, settlement captures
//! it, and reconciliation either refunds the charge or cancels the
//! uncaptured intent. All mutating requests carry an idempotency key
//! derived from stable ids, so the manager's single automatic retry can
//! never double-charge.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use callbill_core::BillingSessionId;

use super::{GatewayError, PaymentGateway, RefundTarget};

/// Stripe API client.
#[derive(Debug, Clone)]
pub struct StripeGateway {
    client: Client,
    base_url: String,
    api_key: String,
    webhook_secret: Option<String>,
}

impl StripeGateway {
    /// Stripe API base URL.
    const BASE_URL: &'static str = "https://api.stripe.com/v1";

    /// Create a new Stripe gateway.
    ///
    /// # Arguments
    ///
    /// * `api_key` - Stripe secret API key (`sk_test_...` or `sk_live_...`)
    /// * `webhook_secret` - Optional webhook signing secret (`whsec_...`)
    /// * `timeout` - Bound on each request; elapsing maps to
    ///   [`GatewayError::Timeout`]
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be built.
    #[must_use]
    pub fn new(api_key: impl Into<String>, webhook_secret: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: Self::BASE_URL.to_string(),
            api_key: api_key.into(),
            webhook_secret,
        }
    }

    /// Override the API base URL (tests only).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Verify a Stripe webhook signature header.
    ///
    /// Header format: `t=timestamp,v1=signature[,v1=signature2,...]`; the
    /// signed payload is `{timestamp}.{body}`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Configuration`] if no webhook secret is
    /// configured, or [`GatewayError::InvalidSignature`] if no candidate
    /// signature matches.
    pub fn verify_webhook_signature(
        &self,
        payload: &str,
        signature: &str,
    ) -> Result<(), GatewayError> {
        let secret = self.webhook_secret.as_ref().ok_or_else(|| {
            GatewayError::Configuration("webhook secret not configured".into())
        })?;

        let mut timestamp: Option<&str> = None;
        let mut signatures: Vec<&str> = Vec::new();

        for part in signature.split(',') {
            let mut kv = part.splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some("t"), Some(ts)) => timestamp = Some(ts),
                (Some("v1"), Some(sig)) => signatures.push(sig),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| GatewayError::Configuration("missing signature timestamp".into()))?;

        if signatures.is_empty() {
            return Err(GatewayError::InvalidSignature);
        }

        let signed_payload = format!("{timestamp}.{payload}");
        let expected = crate::crypto::hmac_sha256_hex(secret, &signed_payload);

        let valid = signatures
            .iter()
            .any(|sig| crate::crypto::constant_time_eq(&expected, sig));

        if valid {
            Ok(())
        } else {
            Err(GatewayError::InvalidSignature)
        }
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        idempotency_key: Option<String>,
    ) -> Result<T, GatewayError> {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(params);

        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Http(e)
            }
        })?;

        Self::handle_response(response).await
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        if status.is_server_error() {
            return Err(GatewayError::Unavailable(status.to_string()));
        }

        let error_body: Result<StripeErrorResponse, _> = response.json().await;
        match error_body {
            Ok(body) if body.error.code.as_deref() == Some("card_declined") => {
                Err(GatewayError::Declined(body.error.message))
            }
            Ok(body) => Err(GatewayError::Api {
                code: body.error.code.unwrap_or_else(|| body.error.error_type),
                message: body.error.message,
            }),
            Err(_) => Err(GatewayError::Api {
                code: "unknown".into(),
                message: format!("HTTP {status}"),
            }),
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn authorize(
        &self,
        session_id: &BillingSessionId,
        amount_cents: i64,
    ) -> Result<String, GatewayError> {
        tracing::debug!(
            billing_session_id = %session_id,
            amount_cents,
            "Creating manual-capture payment intent"
        );

        let params = [
            ("amount", amount_cents.to_string()),
            ("currency", "usd".to_string()),
            ("capture_method", "manual".to_string()),
            ("confirm", "true".to_string()),
            ("metadata[billing_session_id]", session_id.to_string()),
        ];

        let intent: PaymentIntent = self
            .post_form(
                "/payment_intents",
                &params,
                Some(format!("authorize-{session_id}")),
            )
            .await?;

        Ok(intent.id)
    }

    async fn capture(&self, intent_id: &str, amount_cents: i64) -> Result<String, GatewayError> {
        tracing::debug!(intent_id, amount_cents, "Capturing payment intent");

        let params = [("amount_to_capture", amount_cents.to_string())];

        let intent: PaymentIntent = self
            .post_form(
                &format!("/payment_intents/{intent_id}/capture"),
                &params,
                Some(format!("capture-{intent_id}")),
            )
            .await?;

        intent
            .latest_charge
            .ok_or_else(|| GatewayError::Api {
                code: "missing_charge".into(),
                message: format!("captured intent {intent_id} has no charge"),
            })
    }

    async fn refund(&self, target: RefundTarget<'_>) -> Result<String, GatewayError> {
        match target {
            RefundTarget::Charge(charge_id) => {
                tracing::debug!(charge_id, "Refunding captured charge");
                let params = [("charge", charge_id.to_string())];
                let refund: Refund = self
                    .post_form("/refunds", &params, Some(format!("refund-{charge_id}")))
                    .await?;
                Ok(refund.id)
            }
            RefundTarget::Intent(intent_id) => {
                tracing::debug!(intent_id, "Cancelling uncaptured payment intent");
                let intent: PaymentIntent = self
                    .post_form(
                        &format!("/payment_intents/{intent_id}/cancel"),
                        &[],
                        Some(format!("cancel-{intent_id}")),
                    )
                    .await?;
                Ok(intent.id)
            }
        }
    }

    async fn health_check(&self) -> Result<(), GatewayError> {
        let response = self
            .client
            .get(format!("{}/balance", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Http(e)
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::Unavailable(response.status().to_string()))
        }
    }

    fn verify_webhook(&self, payload: &str, signature: &str) -> Result<(), GatewayError> {
        self.verify_webhook_signature(payload, signature)
    }
}

/// Stripe payment intent (the fields we read).
#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    #[serde(default)]
    latest_charge: Option<String>,
}

/// Stripe refund (the fields we read).
#[derive(Debug, Deserialize)]
struct Refund {
    id: String,
}

/// Stripe error envelope.
#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}
