//! Mapping of domain errors to HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use cryptopay_core::payout::CreatePayoutError;
use cryptopay_core::quotes::QuoteError;
use cryptopay_core::reconciler::ReconcileError;
use cryptopay_core::session::CreateSessionError;
use cryptopay_core::upstream::AuthError;
use cryptopay_sdk::objects::ApiErrorBody;

/// Errors that can occur in API handlers.
#[derive(Debug)]
pub enum ApiError {
    /// Missing, invalid or expired bearer token.
    Unauthenticated,
    /// The auth service could not be reached.
    AuthUnavailable(AuthError),
    /// Unknown resource, or one the caller does not own.
    NotFound,
    CreateSession(CreateSessionError),
    CreatePayout(CreatePayoutError),
    Quotes(QuoteError),
    Callback(ReconcileError),
    /// A database query failed.
    Database(sqlx::Error),
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        if e.is_unauthenticated() {
            ApiError::Unauthenticated
        } else {
            ApiError::AuthUnavailable(e)
        }
    }
}

impl From<CreateSessionError> for ApiError {
    fn from(e: CreateSessionError) -> Self {
        ApiError::CreateSession(e)
    }
}

impl From<CreatePayoutError> for ApiError {
    fn from(e: CreatePayoutError) -> Self {
        ApiError::CreatePayout(e)
    }
}

impl From<QuoteError> for ApiError {
    fn from(e: QuoteError) -> Self {
        ApiError::Quotes(e)
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        ApiError::Callback(e)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Database(e)
    }
}

fn body(status: StatusCode, error: impl Into<String>, retryable: bool) -> Response {
    (
        status,
        Json(ApiErrorBody {
            error: error.into(),
            retryable,
        }),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthenticated => body(StatusCode::UNAUTHORIZED, "authentication required", false),
            ApiError::AuthUnavailable(e) => {
                tracing::warn!(error = %e, "Auth service unavailable");
                body(StatusCode::SERVICE_UNAVAILABLE, "auth service unavailable", true)
            }
            ApiError::NotFound => body(StatusCode::NOT_FOUND, "payment not found", false),
            ApiError::CreateSession(e) => create_session_response(e),
            ApiError::CreatePayout(e) => create_payout_response(e),
            ApiError::Quotes(e) => {
                tracing::error!(error = %e, "Quote lookup failed");
                body(StatusCode::SERVICE_UNAVAILABLE, e.to_string(), e.is_retryable())
            }
            ApiError::Callback(e) => {
                let status = if e.is_forbidden() {
                    StatusCode::FORBIDDEN
                } else {
                    StatusCode::BAD_REQUEST
                };
                body(status, e.to_string(), false)
            }
            ApiError::Database(e) => {
                tracing::error!(error = %e, "API database error");
                body(StatusCode::INTERNAL_SERVER_ERROR, "internal server error", true)
            }
        }
    }
}

fn create_session_response(e: CreateSessionError) -> Response {
    let retryable = e.is_retryable();
    let status = match &e {
        CreateSessionError::InvalidAmount(_)
        | CreateSessionError::UnsupportedCurrency(_)
        | CreateSessionError::BelowMinimum { .. }
        | CreateSessionError::InvalidIdempotencyKey => StatusCode::BAD_REQUEST,
        CreateSessionError::IdempotencyConflict | CreateSessionError::SessionInFlight => {
            StatusCode::CONFLICT
        }
        CreateSessionError::Unauthenticated => StatusCode::UNAUTHORIZED,
        CreateSessionError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        CreateSessionError::Database(db) => {
            tracing::error!(error = %db, "Session creation database error");
            return body(StatusCode::INTERNAL_SERVER_ERROR, "internal server error", retryable);
        }
    };
    body(status, e.to_string(), retryable)
}

fn create_payout_response(e: CreatePayoutError) -> Response {
    let status = match &e {
        CreatePayoutError::Unauthenticated => StatusCode::UNAUTHORIZED,
        CreatePayoutError::Forbidden => StatusCode::FORBIDDEN,
        CreatePayoutError::InvalidAmount
        | CreatePayoutError::InvalidCurrency(_)
        | CreatePayoutError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        CreatePayoutError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        CreatePayoutError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
    };
    body(status, e.to_string(), e.is_retryable())
}
