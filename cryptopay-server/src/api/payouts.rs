//! `POST /payments/payout`: send a creator payout (operators only).

use axum::{Json, extract::State};
use cryptopay_sdk::objects::{CreatePayoutRequest, PayoutResponse};

use super::error::ApiError;
use super::extractors::BearerToken;
use crate::state::AppState;

pub(super) async fn create_payout(
    state: State<AppState>,
    BearerToken(token): BearerToken,
    Json(body): Json<CreatePayoutRequest>,
) -> Result<Json<PayoutResponse>, ApiError> {
    let settings = state.payout_settings().await;
    let payout = state
        .payouts
        .create(token.as_deref(), body, &settings)
        .await?;
    Ok(Json(payout.to_response()))
}
