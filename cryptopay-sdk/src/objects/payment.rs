//! Payment session request / response types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::currency::CryptoCurrency;

/// Header carrying the client-chosen idempotency key on session creation.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Maximum accepted idempotency key length.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// The business purpose of a payment. Determines which entitlement is
/// granted once the payment settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Subscription,
    Tip,
    PpvPost,
    MessageUnlock,
    PaymentRequest,
    PlusSubscription,
    CustomRequest,
}

impl PaymentType {
    pub const ALL: [PaymentType; 7] = [
        PaymentType::Subscription,
        PaymentType::Tip,
        PaymentType::PpvPost,
        PaymentType::MessageUnlock,
        PaymentType::PaymentRequest,
        PaymentType::PlusSubscription,
        PaymentType::CustomRequest,
    ];

    /// Look up a payment type by its snake_case name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PaymentType::Subscription => "subscription",
            PaymentType::Tip => "tip",
            PaymentType::PpvPost => "ppv_post",
            PaymentType::MessageUnlock => "message_unlock",
            PaymentType::PaymentRequest => "payment_request",
            PaymentType::PlusSubscription => "plus_subscription",
            PaymentType::CustomRequest => "custom_request",
        }
    }
}

impl std::fmt::Display for PaymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processor-reported payment status.
///
/// `Finished` is the only success terminal. `Expired`, `Failed` and
/// `Refunded` are failure terminals. Everything else is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Waiting,
    Confirming,
    Confirmed,
    Sending,
    PartiallyPaid,
    Finished,
    Failed,
    Refunded,
    Expired,
}

impl PaymentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::Waiting => "waiting",
            PaymentStatus::Confirming => "confirming",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Sending => "sending",
            PaymentStatus::PartiallyPaid => "partially_paid",
            PaymentStatus::Finished => "finished",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Expired => "expired",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Finished
                | PaymentStatus::Failed
                | PaymentStatus::Refunded
                | PaymentStatus::Expired
        )
    }

    /// Position along the lifecycle. Used server-side to reject updates
    /// that would move a session backwards.
    pub const fn rank(self) -> u8 {
        match self {
            PaymentStatus::Created => 0,
            PaymentStatus::Waiting | PaymentStatus::PartiallyPaid => 1,
            PaymentStatus::Confirming => 2,
            PaymentStatus::Confirmed => 3,
            PaymentStatus::Sending => 4,
            PaymentStatus::Finished
            | PaymentStatus::Failed
            | PaymentStatus::Refunded
            | PaymentStatus::Expired => 5,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown payment status: {0}")]
pub struct UnknownStatus(pub String);

impl std::str::FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.to_ascii_lowercase().as_str() {
            "created" => PaymentStatus::Created,
            "waiting" => PaymentStatus::Waiting,
            "confirming" => PaymentStatus::Confirming,
            "confirmed" => PaymentStatus::Confirmed,
            "sending" => PaymentStatus::Sending,
            "partially_paid" => PaymentStatus::PartiallyPaid,
            "finished" => PaymentStatus::Finished,
            "failed" => PaymentStatus::Failed,
            "refunded" => PaymentStatus::Refunded,
            "expired" => PaymentStatus::Expired,
            _ => return Err(UnknownStatus(s.to_owned())),
        };
        Ok(status)
    }
}

/// Opaque key-value description of the entitlement target
/// (`creator_id`, `post_id`, `conversation_id`, ...).
pub type PaymentMetadata = serde_json::Map<String, serde_json::Value>;

/// Request body of `POST /payments/create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub usd_amount: Decimal,
    pub crypto_currency: CryptoCurrency,
    pub payment_type: PaymentType,
    #[serde(default)]
    pub metadata: PaymentMetadata,
}

/// Read-only projection of a payment session.
///
/// Returned by session creation, the status read endpoint and the
/// WebSocket stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSessionResponse {
    pub id: Uuid,
    pub pay_address: Option<String>,
    pub pay_amount: Option<Decimal>,
    pub pay_currency: CryptoCurrency,
    pub usd_amount: Decimal,
    pub status: PaymentStatus,
    pub payment_type: PaymentType,
    /// Unix timestamp.
    pub created_at: i64,
    /// Unix timestamp.
    pub expires_at: i64,
    pub tx_hash: Option<String>,
    pub is_processed: bool,
}

/// Check an idempotency key for length and charset (visible ASCII).
pub fn is_valid_idempotency_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_IDEMPOTENCY_KEY_LEN
        && key.bytes().all(|b| b.is_ascii_graphic())
}
