//! Callbill service entry point.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use callbill_service::{create_router, AppState, ServiceConfig};
use callbill_store::RocksStore;

use callbill_service::gateway::{FakeGateway, PaymentGateway, StripeGateway};
use callbill_service::reconcile::Sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env();
    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        "Starting callbill service"
    );

    let store = Arc::new(RocksStore::open(&config.data_dir)?);

    let gateway: Arc<dyn PaymentGateway> = match &config.stripe_api_key {
        Some(api_key) => Arc::new(StripeGateway::new(
            api_key,
            config.stripe_webhook_secret.clone(),
            Duration::from_secs(config.gateway_timeout_seconds),
        )),
        None => {
            tracing::warn!("No Stripe API key configured; using the in-memory fake gateway");
            Arc::new(FakeGateway::new())
        }
    };

    let state = AppState::new(config.clone(), store.clone(), gateway);

    let sweeper = Sweeper::new(
        store,
        state.manager.clone(),
        state.registry.clone(),
        config.staleness_threshold_seconds,
        config.sweep_interval_seconds,
    );
    tokio::spawn(sweeper.run());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "Listening");
    axum::serve(listener, create_router(state)).await?;

    Ok(())
}
