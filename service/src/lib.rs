//! Callbill service library.
//!
//! This crate wires the bid-to-settlement pipeline together:
//!
//! - [`registry::BidRegistry`] — open bids per stream, acceptance
//! - [`manager::BillingManager`] — the billing session state machine
//! - [`gateway`] — the payment gateway capability (Stripe or fake)
//! - [`broadcaster::EventBroadcaster`] — transition events to both parties
//! - [`reconcile::Sweeper`] — stuck-session detection and refunds
//!
//! plus the axum HTTP/WebSocket surface in [`routes`], [`handlers`], and
//! [`ws`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod broadcaster;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod manager;
pub mod reconcile;
pub mod registry;
pub mod routes;
pub mod state;
pub mod ws;

pub use config::ServiceConfig;
pub use routes::create_router;
pub use state::AppState;
