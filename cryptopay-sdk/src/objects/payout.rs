//! Creator payout request / response types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::objects::PayoutStatus;

/// Currency payouts are sent in unless the request names another.
pub const DEFAULT_PAYOUT_CURRENCY: &str = "usdttrc20";

/// Body of `POST /payments/payout`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePayoutRequest {
    /// Destination wallet.
    pub address: String,
    pub amount: Decimal,
    /// Processor currency code.
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Caller's reference for the payout, sent to the processor as the
    /// withdrawal's external id.
    #[serde(default)]
    pub reference: Option<String>,
}

fn default_currency() -> String {
    DEFAULT_PAYOUT_CURRENCY.to_owned()
}

/// A recorded payout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutResponse {
    /// The processor's withdrawal id; payout callbacks are keyed on it.
    pub withdrawal_id: String,
    pub batch_withdrawal_id: Option<String>,
    pub currency: String,
    pub amount: Decimal,
    pub address: Option<String>,
    pub status: PayoutStatus,
    /// Unix timestamp.
    pub created_at: i64,
}

/// Processor currency codes are short lowercase alphanumerics.
pub fn is_valid_payout_currency(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= 16
        && code
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
