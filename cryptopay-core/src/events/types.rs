//! Event type definitions.
//!
//! Events carry the projection the client sees, so subscribers can forward
//! them without another read.

use cryptopay_sdk::objects::PaymentSessionResponse;
use uuid::Uuid;

/// Emitted when the reconciler wrote a new status for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentStatusChanged {
    /// Owner of the session; push subscribers only see their own sessions.
    pub user_id: Uuid,
    pub session: PaymentSessionResponse,
}

impl PaymentStatusChanged {
    pub fn session_id(&self) -> Uuid {
        self.session.id
    }
}
