//! Quote endpoints.
//!
//! - `GET /prices`      – USD spot price per supported currency
//! - `GET /min-amounts` – buffered minimum payable USD amount per currency
//!
//! Both carry an `X-Cache` freshness header and a `Cache-Control` max-age
//! matching the server-side TTL.

use axum::{
    Json,
    extract::State,
    http::header::CACHE_CONTROL,
    response::IntoResponse,
};
use cryptopay_core::quotes::{MIN_AMOUNT_TTL, SPOT_PRICE_TTL};
use cryptopay_sdk::objects::{
    CACHE_STATUS_HEADER, MinAmountsResponse, SpotPricesResponse, UsdPrice,
};

use super::error::ApiError;
use crate::state::AppState;

fn max_age(ttl: time::Duration) -> String {
    format!("public, max-age={}", ttl.whole_seconds())
}

/// `GET /prices`
pub(super) async fn get_prices(state: State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let cached = state.quotes.spot_prices().await?;
    let body = SpotPricesResponse {
        prices: cached
            .value
            .iter()
            .map(|(currency, usd)| (*currency, UsdPrice { usd: *usd }))
            .collect(),
        updated_at: cached.fetched_at.unix_timestamp(),
    };
    Ok((
        [
            (CACHE_STATUS_HEADER, cached.freshness.as_str().to_owned()),
            (CACHE_CONTROL.as_str(), max_age(SPOT_PRICE_TTL)),
        ],
        Json(body),
    ))
}

/// `GET /min-amounts`
///
/// Never fails: unknown or unreachable minimums degrade to the safe floor.
pub(super) async fn get_min_amounts(state: State<AppState>) -> impl IntoResponse {
    let cached = state.quotes.minimum_amounts().await;
    (
        [
            (CACHE_STATUS_HEADER, cached.freshness.as_str().to_owned()),
            (CACHE_CONTROL.as_str(), max_age(MIN_AMOUNT_TTL)),
        ],
        Json(MinAmountsResponse(cached.value)),
    )
}
