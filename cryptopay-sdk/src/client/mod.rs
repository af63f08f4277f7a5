//! HTTP / WebSocket client for the payment API and the status watcher.
//!
//! Gated behind the `client` cargo feature so downstream crates that only
//! need the shared types do not pull in `reqwest`.

mod payments;
mod watcher;

pub use payments::{PaymentClient, QuoteBundle};
pub use watcher::{
    PaymentWatcher, ReconnectPolicy, StatusSource, StatusStream, WatcherConfig, WatcherSnapshot,
};

use reqwest::StatusCode;

use crate::objects::ApiErrorBody;

/// Errors produced by the SDK client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure (DNS, TLS, connection reset, …).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket handshake or stream failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The server returned a non-2xx status code.
    #[error("api error: status {status}, body: {body}")]
    Api { status: StatusCode, body: String },

    /// The status stream reported an error frame.
    #[error("stream error {code}: {reason}")]
    Stream { code: u16, reason: String },

    /// Response body could not be deserialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The base URL could not be joined with the endpoint path.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    /// The idempotency key is empty, too long, or not visible ASCII.
    #[error("invalid idempotency key")]
    InvalidIdempotencyKey,
}

impl ClientError {
    /// Whether retrying the same call may succeed.
    ///
    /// Uses the server's `retryable` flag when the body carries one.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(_) | ClientError::WebSocket(_) => true,
            ClientError::Api { status, body } => serde_json::from_str::<ApiErrorBody>(body)
                .map(|b| b.retryable)
                .unwrap_or_else(|_| {
                    status.is_server_error()
                        || *status == StatusCode::TOO_MANY_REQUESTS
                        || *status == StatusCode::REQUEST_TIMEOUT
                }),
            ClientError::Stream { code, .. } => *code == crate::objects::ws::WsCloseCode::INTERNAL_ERROR,
            ClientError::Json(_) | ClientError::Url(_) | ClientError::InvalidIdempotencyKey => false,
        }
    }

    /// The server's error message, if the body carried one.
    pub fn api_message(&self) -> Option<String> {
        match self {
            ClientError::Api { body, .. } => serde_json::from_str::<ApiErrorBody>(body)
                .ok()
                .map(|b| b.error),
            _ => None,
        }
    }
}
