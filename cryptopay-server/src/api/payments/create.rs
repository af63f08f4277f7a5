use axum::{Json, extract::State};
use cryptopay_sdk::objects::{CreatePaymentRequest, PaymentSessionResponse};

use crate::api::error::ApiError;
use crate::api::extractors::{BearerToken, IdempotencyKey};
use crate::state::AppState;

/// `POST /payments/create`: create a payment session.
///
/// A repeated `Idempotency-Key` from the same user returns the session
/// created by the first request.
pub(super) async fn create_payment(
    state: State<AppState>,
    BearerToken(token): BearerToken,
    IdempotencyKey(key): IdempotencyKey,
    Json(body): Json<CreatePaymentRequest>,
) -> Result<Json<PaymentSessionResponse>, ApiError> {
    let settings = state.session_settings().await;
    let session = state
        .sessions
        .create(token.as_deref(), body, key.as_deref(), &settings)
        .await?;
    Ok(Json(session.to_response()))
}
