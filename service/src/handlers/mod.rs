//! HTTP request handlers.

pub mod bids;
pub mod billing;
pub mod health;
pub mod webhooks;
