//! Payment session endpoints.
//!
//! # Endpoints
//!
//! - `POST /payments/create`   – create (or replay) a payment session
//! - `GET  /payments/{id}`     – read the caller's session
//! - `GET  /payments/{id}/ws`  – WebSocket status stream

use axum::{
    Router,
    routing::{get, post},
};
use cryptopay_core::entities::payment_sessions::PaymentSession;
use cryptopay_core::store::PaymentStore;
use uuid::Uuid;

use crate::state::AppState;

mod create;
mod get;
mod ws;

/// Build the payments router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/payments/create", post(create::create_payment))
        .route("/payments/{id}", get(get::get_payment))
        .route("/payments/{id}/ws", get(ws::payment_status_ws))
}

/// Load a session, hiding sessions owned by someone else.
async fn owned_session(
    store: &dyn PaymentStore,
    user_id: Uuid,
    id: Uuid,
) -> Result<Option<PaymentSession>, sqlx::Error> {
    Ok(store.session(id).await?.filter(|s| s.user_id == user_id))
}
