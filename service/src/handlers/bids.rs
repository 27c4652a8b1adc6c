//! Bid endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use callbill_core::{Bid, BidId, BillingSession, StreamSessionId, UserId};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Request to place a bid.
#[derive(Debug, Deserialize)]
pub struct PlaceBidRequest {
    /// The stream session to bid on.
    pub stream_session_id: StreamSessionId,
    /// The influencer being bid on.
    pub influencer_id: UserId,
    /// Offered amount in cents.
    pub amount_cents: i64,
    /// Optional per-minute overage rate in cents.
    #[serde(default)]
    pub rate_per_minute_cents: Option<i64>,
}

/// Response for an accepted bid: the bid plus the billing session it
/// opened.
#[derive(Debug, Serialize)]
pub struct AcceptBidResponse {
    /// The accepted bid.
    pub bid: Bid,
    /// The `created` billing session awaiting the call start signal.
    pub billing_session: BillingSession,
}

/// Query parameters for listing bids.
#[derive(Debug, Deserialize)]
pub struct ListBidsQuery {
    /// The stream session to list bids for.
    pub stream_session_id: StreamSessionId,
}

/// `POST /v1/bids` - place a bid as the authenticated explorer.
pub async fn place_bid(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<PlaceBidRequest>,
) -> Result<(StatusCode, Json<Bid>), ApiError> {
    let bid = state.registry.place_bid(
        req.stream_session_id,
        user.user_id,
        req.influencer_id,
        req.amount_cents,
        req.rate_per_minute_cents,
    )?;
    Ok((StatusCode::CREATED, Json(bid)))
}

/// `POST /v1/bids/{id}/accept` - accept a bid as its influencer.
pub async fn accept_bid(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(bid_id): Path<BidId>,
) -> Result<Json<AcceptBidResponse>, ApiError> {
    let bid = state.registry.get_bid(&bid_id)?;
    if bid.influencer_id != user.user_id {
        return Err(ApiError::Forbidden);
    }

    let (bid, billing_session) = state.registry.accept_bid(&bid_id)?;
    Ok(Json(AcceptBidResponse {
        bid,
        billing_session,
    }))
}

/// `POST /v1/bids/{id}/reject` - reject a bid as its influencer.
pub async fn reject_bid(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(bid_id): Path<BidId>,
) -> Result<Json<Bid>, ApiError> {
    let bid = state.registry.get_bid(&bid_id)?;
    if bid.influencer_id != user.user_id {
        return Err(ApiError::Forbidden);
    }

    let bid = state.registry.reject_bid(&bid_id)?;
    Ok(Json(bid))
}

/// `GET /v1/bids?stream_session_id=...` - list a stream's bids.
pub async fn list_bids(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Query(query): Query<ListBidsQuery>,
) -> Result<Json<Vec<Bid>>, ApiError> {
    let bids = state.registry.list_bids(&query.stream_session_id)?;
    Ok(Json(bids))
}
