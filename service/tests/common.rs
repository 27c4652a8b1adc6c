//! Common test utilities for callbill integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use axum::Router;
use axum_test::TestServer;
use tempfile::TempDir;

use callbill_core::UserId;
use callbill_service::gateway::FakeGateway;
use callbill_service::{create_router, AppState, ServiceConfig};
use callbill_store::RocksStore;

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// Shared state, for driving the pipeline directly.
    pub state: Arc<AppState>,
    /// The fake gateway, for scripting failures and counting calls.
    pub gateway: Arc<FakeGateway>,
    /// Temporary directory for the database (kept alive for test duration).
    pub _temp_dir: TempDir,
    /// An explorer user for authenticated requests.
    pub explorer_id: UserId,
    /// An influencer user for authenticated requests.
    pub influencer_id: UserId,
    /// The service API key for call-layer requests.
    pub service_api_key: String,
}

impl TestHarness {
    /// Create a new test harness with a fresh database and fake gateway.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(RocksStore::open(temp_dir.path()).expect("Failed to open store"));
        let gateway = Arc::new(FakeGateway::new());

        let service_api_key = "test-service-key".to_string();

        let config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            data_dir: temp_dir.path().to_string_lossy().to_string(),
            service_api_key: Some(service_api_key.clone()),
            stripe_api_key: None,
            stripe_webhook_secret: None,
            gateway_timeout_seconds: 5,
            staleness_threshold_seconds: 300,
            sweep_interval_seconds: 60,
            bid_ttl_seconds: 300,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        };

        let state = AppState::new(config, store, gateway.clone());
        let router: Router = create_router(state.clone());

        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            state,
            gateway,
            _temp_dir: temp_dir,
            explorer_id: UserId::generate(),
            influencer_id: UserId::generate(),
            service_api_key,
        }
    }

    /// Authorization header for the harness explorer.
    pub fn explorer_auth_header(&self) -> String {
        Self::bearer(&self.explorer_id)
    }

    /// Authorization header for the harness influencer.
    pub fn influencer_auth_header(&self) -> String {
        Self::bearer(&self.influencer_id)
    }

    /// Authorization header for an arbitrary user.
    pub fn bearer(user_id: &UserId) -> String {
        format!("Bearer user-token:{user_id}")
    }

    /// Place a bid as the explorer and return its id and the stream it
    /// targets.
    pub async fn place_bid(&self, amount_cents: i64) -> (String, String) {
        let stream_session_id = callbill_core::StreamSessionId::generate().to_string();
        let bid_id = self
            .place_bid_on(&stream_session_id, amount_cents, None)
            .await;
        (bid_id, stream_session_id)
    }

    /// Place a bid on a specific stream, returning the bid id.
    pub async fn place_bid_on(
        &self,
        stream_session_id: &str,
        amount_cents: i64,
        rate_per_minute_cents: Option<i64>,
    ) -> String {
        let response = self
            .server
            .post("/v1/bids")
            .add_header("authorization", self.explorer_auth_header())
            .json(&serde_json::json!({
                "stream_session_id": stream_session_id,
                "influencer_id": self.influencer_id.to_string(),
                "amount_cents": amount_cents,
                "rate_per_minute_cents": rate_per_minute_cents,
            }))
            .await;
        response.assert_status(axum::http::StatusCode::CREATED);
        let body: serde_json::Value = response.json();
        body["id"].as_str().unwrap().to_string()
    }

    /// Accept a previously placed bid as the influencer.
    pub async fn accept_bid(&self, bid_id: &str) {
        self.server
            .post(&format!("/v1/bids/{bid_id}/accept"))
            .add_header("authorization", self.influencer_auth_header())
            .await
            .assert_status_ok();
    }

    /// Place and accept a bid, returning the stream session id with a
    /// `created` billing session behind it.
    pub async fn accepted_bid(&self, amount_cents: i64) -> String {
        let (bid_id, stream_session_id) = self.place_bid(amount_cents).await;
        self.accept_bid(&bid_id).await;
        stream_session_id
    }

    /// Place and accept a bid carrying a per-minute overage rate.
    pub async fn accepted_bid_with_rate(
        &self,
        amount_cents: i64,
        rate_per_minute_cents: i64,
    ) -> String {
        let stream_session_id = callbill_core::StreamSessionId::generate().to_string();
        let bid_id = self
            .place_bid_on(&stream_session_id, amount_cents, Some(rate_per_minute_cents))
            .await;
        self.accept_bid(&bid_id).await;
        stream_session_id
    }

    /// Send a call-layer billing signal.
    pub async fn billing_signal(
        &self,
        endpoint: &str,
        stream_session_id: &str,
    ) -> axum_test::TestResponse {
        self.billing_signal_with(endpoint, serde_json::json!({ "session_id": stream_session_id }))
            .await
    }

    /// Send a call-layer billing signal with a caller-built payload.
    pub async fn billing_signal_with(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> axum_test::TestResponse {
        self.server
            .post(&format!("/v1/billing/{endpoint}"))
            .add_header("x-api-key", self.service_api_key.clone())
            .add_header("x-service-name", "call-layer")
            .json(&body)
            .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
