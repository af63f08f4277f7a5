//! WebSocket message types for the payment status stream.
//!
//! The `GET /payments/{id}/ws` endpoint upgrades to a WebSocket
//! connection and pushes [`WsServerMessage`] JSON frames.
//!
//! # Protocol
//!
//! 1. The server sends a [`WsServerMessage::StatusUpdate`] with the
//!    current session projection immediately after the upgrade.
//! 2. Subsequent [`WsServerMessage::StatusUpdate`] frames are sent
//!    whenever the session's status changes.
//! 3. After a terminal status (`finished`, `expired`, `failed`,
//!    `refunded`) the server sends a normal close frame.
//! 4. If the session is unknown or an internal error occurs during the
//!    handshake phase, the server sends a close frame with an
//!    application-defined close code (see [`WsCloseCode`]).

use serde::{Deserialize, Serialize};

use super::payment::PaymentSessionResponse;

/// Server-to-client WebSocket message.
///
/// ```json
/// {"type":"status_update","payment":{ ... }}
/// {"type":"error","code":4004,"reason":"payment not found"}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    /// A session snapshot (sent as the first frame and on every change).
    StatusUpdate { payment: PaymentSessionResponse },

    /// A server-side error. The server may still send a close frame
    /// afterwards.
    Error { code: u16, reason: String },
}

/// Well-known WebSocket close codes used by the payment status stream.
///
/// Codes in the 4000-4999 range are reserved for application use by
/// [RFC 6455 §7.4.2](https://www.rfc-editor.org/rfc/rfc6455#section-7.4.2).
pub struct WsCloseCode;

impl WsCloseCode {
    /// Normal closure after a terminal status has been delivered.
    pub const NORMAL: u16 = 1000;

    pub const INTERNAL_ERROR: u16 = 1011;

    /// The requested session does not exist or belongs to someone else.
    pub const PAYMENT_NOT_FOUND: u16 = 4004;
}
