//! Custom Axum extractors for request authentication.
//!
//! Provides:
//! - `BearerToken`: the raw `Authorization: Bearer` token, if any. Session
//!   creation hands it to the session creator, which verifies it.
//! - `CurrentUser`: a verified user (used by the read and stream endpoints).
//! - `IdempotencyKey`: the optional `Idempotency-Key` header.

use std::convert::Infallible;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use cryptopay_core::upstream::AuthenticatedUser;
use cryptopay_sdk::objects::IDEMPOTENCY_KEY_HEADER;

use super::error::ApiError;
use crate::state::AppState;

pub struct BearerToken(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer)
            .map(str::to_owned);
        Ok(BearerToken(token))
    }
}

fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

pub struct CurrentUser(pub AuthenticatedUser);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Ok(BearerToken(token)) = BearerToken::from_request_parts(parts, state).await;
        let token = token.ok_or(ApiError::Unauthenticated)?;
        let user = state.auth.verify(&token).await?;
        Ok(CurrentUser(user))
    }
}

/// The raw header value. Validation belongs to the session creator.
pub struct IdempotencyKey(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for IdempotencyKey {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // A non-ASCII value is passed through as-is so it fails validation
        // instead of silently becoming "no key".
        let key = parts
            .headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
        Ok(IdempotencyKey(key))
    }
}
