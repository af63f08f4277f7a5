//! Inbound processor callbacks (IPN) and the acknowledgement we send back.
//!
//! Both callback kinds arrive as arbitrary JSON objects whose signature is
//! computed over the canonicalized object (see [`crate::signature`]), so
//! they are parsed from a [`serde_json::Value`] after verification rather
//! than deserialized straight from the body.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Errors for callbacks missing their identifier or status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedNotification {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

/// Inbound payment notification (`POST /payments/webhook`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotification {
    pub payment_id: String,
    /// Raw status string as sent by the processor.
    pub payment_status: String,
    pub pay_address: Option<String>,
    pub pay_amount: Option<Decimal>,
    pub actually_paid: Option<Decimal>,
    pub outcome_amount: Option<Decimal>,
    pub order_id: Option<String>,
    pub tx_hash: Option<String>,
}

impl PaymentNotification {
    pub fn from_value(value: &Value) -> Result<Self, MalformedNotification> {
        let object = value.as_object().ok_or(MalformedNotification::NotAnObject)?;
        let payment_id = identifier(object.get("payment_id"))
            .ok_or(MalformedNotification::MissingField("payment_id"))?;
        let payment_status = non_empty_str(object.get("payment_status"))
            .ok_or(MalformedNotification::MissingField("payment_status"))?;

        Ok(Self {
            payment_id,
            payment_status,
            pay_address: non_empty_str(object.get("pay_address")),
            pay_amount: decimal(object.get("pay_amount")),
            actually_paid: decimal(object.get("actually_paid")),
            outcome_amount: decimal(object.get("outcome_amount")),
            order_id: identifier(object.get("order_id")),
            tx_hash: non_empty_str(object.get("payin_hash"))
                .or_else(|| non_empty_str(object.get("hash"))),
        })
    }
}

/// Processor data kept on a payment for out-of-band reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderData {
    pub payment_status: String,
    pub actually_paid: Option<Decimal>,
    pub outcome_amount: Option<Decimal>,
    pub pay_amount: Option<Decimal>,
    pub pay_address: Option<String>,
    pub order_id: Option<String>,
    /// RFC 3339 receive time.
    pub ipn_received_at: String,
    /// The callback body as received.
    pub raw_webhook: Value,
}

impl PaymentNotification {
    /// Everything the callback reported, with the raw body it came in.
    pub fn provider_data(&self, raw: &Value, received_at: String) -> ProviderData {
        ProviderData {
            payment_status: self.payment_status.clone(),
            actually_paid: self.actually_paid,
            outcome_amount: self.outcome_amount,
            pay_amount: self.pay_amount,
            pay_address: self.pay_address.clone(),
            order_id: self.order_id.clone(),
            ipn_received_at: received_at,
            raw_webhook: raw.clone(),
        }
    }
}

/// Payout / withdrawal notification (`POST /payments/payout-webhook`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutNotification {
    pub withdrawal_id: String,
    pub status: String,
    pub tx_hash: Option<String>,
    pub batch_withdrawal_id: Option<String>,
    pub currency: Option<String>,
    pub amount: Option<Decimal>,
}

impl PayoutNotification {
    pub fn from_value(value: &Value) -> Result<Self, MalformedNotification> {
        let object = value.as_object().ok_or(MalformedNotification::NotAnObject)?;
        let withdrawal_id =
            identifier(object.get("id")).ok_or(MalformedNotification::MissingField("id"))?;
        let status =
            non_empty_str(object.get("status")).ok_or(MalformedNotification::MissingField("status"))?;

        Ok(Self {
            withdrawal_id,
            status,
            tx_hash: non_empty_str(object.get("hash")),
            batch_withdrawal_id: identifier(object.get("batch_withdrawal_id")),
            currency: non_empty_str(object.get("currency")),
            amount: decimal(object.get("amount")),
        })
    }
}

/// Processor payout statuses:
/// `CREATING -> WAITING -> PROCESSING -> SENDING -> FINISHED | FAILED | REJECTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Creating,
    Waiting,
    Processing,
    Sending,
    Finished,
    Failed,
    Rejected,
}

impl PayoutStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            PayoutStatus::Creating => "creating",
            PayoutStatus::Waiting => "waiting",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Sending => "sending",
            PayoutStatus::Finished => "finished",
            PayoutStatus::Failed => "failed",
            PayoutStatus::Rejected => "rejected",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            PayoutStatus::Finished | PayoutStatus::Failed | PayoutStatus::Rejected
        )
    }

    pub const fn rank(self) -> u8 {
        match self {
            PayoutStatus::Creating => 0,
            PayoutStatus::Waiting => 1,
            PayoutStatus::Processing => 2,
            PayoutStatus::Sending => 3,
            PayoutStatus::Finished | PayoutStatus::Failed | PayoutStatus::Rejected => 4,
        }
    }
}

impl std::fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutStatus {
    type Err = crate::objects::payment::UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.to_ascii_lowercase().as_str() {
            "creating" => PayoutStatus::Creating,
            "waiting" => PayoutStatus::Waiting,
            "processing" => PayoutStatus::Processing,
            "sending" => PayoutStatus::Sending,
            "finished" => PayoutStatus::Finished,
            "failed" => PayoutStatus::Failed,
            "rejected" => PayoutStatus::Rejected,
            _ => return Err(crate::objects::payment::UnknownStatus(s.to_owned())),
        };
        Ok(status)
    }
}

/// Result of an authoritative status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The transition was written.
    Applied,
    /// The record already carries this status; nothing changed.
    AlreadyApplied,
    /// The record is terminal or further along; the update was dropped.
    StaleIgnored,
    /// No record matches the identifier.
    NotFound,
}

/// Body returned to the processor for every non-rejected callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ApplyOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

fn identifier(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn decimal(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}
