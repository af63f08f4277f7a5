//! Processor callback endpoints.
//!
//! - `POST /payments/webhook`        – inbound payment status (IPN)
//! - `POST /payments/payout-webhook` – payout / withdrawal status
//!
//! Both are signed with the shared IPN secret in `x-nowpayments-sig`.
//! Every verified callback gets a 200; only a bad signature (403) or a
//! malformed body (400) is rejected.

use axum::{Json, body::Bytes, extract::State, http::HeaderMap};
use cryptopay_sdk::objects::WebhookAck;
use cryptopay_sdk::signature::IPN_SIGNATURE_HEADER;

use super::error::ApiError;
use crate::state::AppState;

fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(IPN_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
}

/// `POST /payments/webhook`
pub(super) async fn payment_webhook(
    state: State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let secret = state.ipn_secret().await;
    let ack = state
        .reconciler
        .handle_payment(secret.as_deref(), &body, signature_header(&headers))
        .await?;
    Ok(Json(ack))
}

/// `POST /payments/payout-webhook`
pub(super) async fn payout_webhook(
    state: State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let secret = state.ipn_secret().await;
    let ack = state
        .reconciler
        .handle_payout(secret.as_deref(), &body, signature_header(&headers))
        .await?;
    Ok(Json(ack))
}
