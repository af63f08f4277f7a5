//! HTTP API.
//!
//! # Endpoints
//!
//! - `GET  /prices`, `GET /min-amounts`              – quotes (public)
//! - `POST /payments/create`, `GET /payments/{id}`   – sessions (bearer auth)
//! - `GET  /payments/{id}/ws`                        – status stream (bearer auth)
//! - `POST /payments/payout`                         – creator payout (operators)
//! - `POST /payments/webhook`, `/payments/payout-webhook` – processor callbacks (signed)

use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

pub mod error;
pub mod extractors;
mod payments;
mod payouts;
mod quotes;
mod webhooks;

/// Build the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/prices", get(quotes::get_prices))
        .route("/min-amounts", get(quotes::get_min_amounts))
        .route("/payments/webhook", post(webhooks::payment_webhook))
        .route("/payments/payout-webhook", post(webhooks::payout_webhook))
        .route("/payments/payout", post(payouts::create_payout))
        .merge(payments::router())
}
