//! Core types and utilities for callbill.
//!
//! This crate provides the foundational types of the bid-to-settlement
//! billing pipeline:
//!
//! - **Identifiers**: `UserId`, `StreamSessionId`, `BidId`, `BillingSessionId`
//! - **Bids**: `Bid`, `BidStatus`
//! - **Sessions**: `BillingSession`, `BillingStatus`, `RateMeterTick`
//! - **Metering**: `RateMeter`
//! - **Events**: `BillingEvent`
//! - **Reconciliation**: `ReconciliationRecord`, `DetectedCondition`
//!
//! # Money
//!
//! All amounts are `i64` minor units (cents). A $25.00 bid is stored as
//! `2500`. Conversion to decimal strings happens only at the presentation
//! boundary, never in accrual or settlement math.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bid;
pub mod error;
pub mod event;
pub mod ids;
pub mod meter;
pub mod reconcile;
pub mod session;

pub use bid::{Bid, BidStatus};
pub use error::{BillingError, Result};
pub use event::BillingEvent;
pub use ids::{BidId, BillingSessionId, IdError, StreamSessionId, UserId};
pub use meter::RateMeter;
pub use reconcile::{DetectedCondition, ReconcileAction, ReconciliationRecord};
pub use session::{BillingSession, BillingStatus, RateMeterTick, TransitionError};
