use axum::{
    Json,
    extract::{Path, State},
};
use cryptopay_sdk::objects::PaymentSessionResponse;
use uuid::Uuid;

use super::owned_session;
use crate::api::error::ApiError;
use crate::api::extractors::CurrentUser;
use crate::state::AppState;

/// `GET /payments/{id}`: the poll path's read.
pub(super) async fn get_payment(
    state: State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentSessionResponse>, ApiError> {
    let session = owned_session(state.store.as_ref(), user.id, id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(session.to_response()))
}
