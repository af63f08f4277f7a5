//! Payment processor API (NOWPayments-compatible).

use std::sync::Arc;

use async_trait::async_trait;
use cryptopay_sdk::currency::CryptoCurrency;
use cryptopay_sdk::objects::{PaymentStatus, PayoutStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::RwLock;
use url::Url;

use crate::config::ProcessorConfig;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No API key is configured.
    #[error("payment processor is not configured")]
    NotConfigured,

    #[error("payment processor request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("payment processor rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The processor refused the amount as below its minimum.
    #[error("amount is below the processor minimum: {message}")]
    AmountTooSmall { message: String },

    #[error("unexpected payment processor response: {0}")]
    Malformed(String),

    #[error("invalid payment processor url: {0}")]
    Url(#[from] url::ParseError),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Request(_) => true,
            GatewayError::Rejected { status, .. } => *status >= 500 || *status == 429,
            GatewayError::NotConfigured
            | GatewayError::AmountTooSmall { .. }
            | GatewayError::Malformed(_)
            | GatewayError::Url(_) => false,
        }
    }
}

/// A payment to open with the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPaymentRequest {
    /// Our reference, echoed back in callbacks as `order_id`.
    pub order_id: String,
    pub usd_amount: Decimal,
    pub currency: CryptoCurrency,
    pub description: String,
    pub ipn_callback_url: Option<Url>,
}

/// What the processor returned for a new payment.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPayment {
    pub payment_id: String,
    pub pay_address: String,
    pub pay_amount: Decimal,
    pub status: PaymentStatus,
    /// Processor-quoted expiry, when it sends one.
    pub expires_at: Option<OffsetDateTime>,
}

/// A single withdrawal sent through the processor's mass-payout API.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPayoutRequest {
    pub address: String,
    /// Processor currency code, e.g. `usdttrc20`.
    pub currency: String,
    pub amount: Decimal,
    pub description: String,
    /// Our reference for the withdrawal.
    pub external_id: String,
    pub ipn_callback_url: Option<Url>,
}

/// What the processor returned for a new withdrawal.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPayout {
    pub batch_withdrawal_id: Option<String>,
    /// The id payout callbacks are keyed on.
    pub withdrawal_id: String,
    pub status: PayoutStatus,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayPayment, GatewayError>;

    /// The processor's raw minimum payable USD amount for `currency`,
    /// `None` when it does not report one.
    async fn min_amount(&self, currency: CryptoCurrency) -> Result<Option<Decimal>, GatewayError>;

    /// Ask the processor whether `address` can receive `currency`. A
    /// refusal is [`GatewayError::Rejected`] with a 4xx status.
    async fn validate_address(&self, address: &str, currency: &str) -> Result<(), GatewayError>;

    async fn create_payout(
        &self,
        request: &GatewayPayoutRequest,
    ) -> Result<GatewayPayout, GatewayError>;
}

pub struct NowPaymentsGateway {
    http: reqwest::Client,
    config: Arc<RwLock<ProcessorConfig>>,
}

#[derive(Debug, Serialize)]
struct CreatePaymentBody<'a> {
    #[serde(with = "rust_decimal::serde::float")]
    price_amount: Decimal,
    price_currency: &'static str,
    pay_currency: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipn_callback_url: Option<&'a str>,
    order_id: &'a str,
    order_description: &'a str,
    is_fee_paid_by_user: bool,
}

#[derive(Debug, Deserialize)]
struct CreatePaymentResponse {
    payment_id: Value,
    pay_address: Option<String>,
    pay_amount: Option<Value>,
    payment_status: Option<String>,
    expiration_estimate_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MinAmountResponse {
    #[serde(default, with = "rust_decimal::serde::float_option")]
    fiat_equivalent: Option<Decimal>,
}

#[derive(Debug, Serialize)]
struct ValidateAddressBody<'a> {
    address: &'a str,
    currency: &'a str,
    extra_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct LoginBody<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct CreatePayoutBody<'a> {
    payout_description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipn_callback_url: Option<&'a str>,
    withdrawals: [WithdrawalBody<'a>; 1],
}

#[derive(Debug, Serialize)]
struct WithdrawalBody<'a> {
    address: &'a str,
    currency: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    unique_external_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipn_callback_url: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CreatePayoutResponse {
    id: Option<Value>,
    #[serde(default)]
    withdrawals: Vec<WithdrawalResponse>,
}

#[derive(Debug, Deserialize)]
struct WithdrawalResponse {
    id: Option<Value>,
    batch_withdrawal_id: Option<Value>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    message: String,
}

impl NowPaymentsGateway {
    pub fn new(http: reqwest::Client, config: Arc<RwLock<ProcessorConfig>>) -> Self {
        Self { http, config }
    }

    async fn endpoint(&self, path: &str) -> Result<(Url, String), GatewayError> {
        let config = self.config.read().await;
        let api_key = config.api_key.clone().ok_or(GatewayError::NotConfigured)?;
        Ok((config.api_base.join(path)?, api_key))
    }
}

#[async_trait]
impl PaymentGateway for NowPaymentsGateway {
    #[tracing::instrument(skip_all, err, name = "HTTP:CreateProcessorPayment")]
    async fn create_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayPayment, GatewayError> {
        let (url, api_key) = self.endpoint("payment").await?;
        let body = CreatePaymentBody {
            price_amount: request.usd_amount,
            price_currency: "usd",
            pay_currency: request.currency.info().processor_code,
            ipn_callback_url: request.ipn_callback_url.as_ref().map(Url::as_str),
            order_id: &request.order_id,
            order_description: &request.description,
            is_fee_paid_by_user: true,
        };

        let response = self
            .http
            .post(url)
            .header("x-api-key", api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorResponse>()
                .await
                .map(|e| e.message)
                .unwrap_or_default();
            return Err(classify_rejection(status.as_u16(), message));
        }

        parse_created_payment(response.json().await?)
    }

    #[tracing::instrument(skip_all, err, name = "HTTP:ProcessorMinAmount")]
    async fn min_amount(&self, currency: CryptoCurrency) -> Result<Option<Decimal>, GatewayError> {
        let (url, api_key) = self.endpoint("min-amount").await?;
        let code = currency.info().processor_code;
        let response = self
            .http
            .get(url)
            .query(&[
                ("currency_from", code),
                ("currency_to", code),
                ("fiat_equivalent", "usd"),
            ])
            .header("x-api-key", api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: String::new(),
            });
        }
        let body: MinAmountResponse = response.json().await?;
        Ok(body.fiat_equivalent)
    }

    #[tracing::instrument(skip_all, err, name = "HTTP:ValidatePayoutAddress")]
    async fn validate_address(&self, address: &str, currency: &str) -> Result<(), GatewayError> {
        let (url, api_key) = self.endpoint("payout/validate-address").await?;
        let response = self
            .http
            .post(url)
            .header("x-api-key", api_key)
            .json(&ValidateAddressBody {
                address,
                currency,
                extra_id: None,
            })
            .send()
            .await?;
        rejection(response).await.map(|_| ())
    }

    #[tracing::instrument(skip_all, err, name = "HTTP:CreateProcessorPayout")]
    async fn create_payout(
        &self,
        request: &GatewayPayoutRequest,
    ) -> Result<GatewayPayout, GatewayError> {
        let credentials = self
            .config
            .read()
            .await
            .payout_credentials
            .clone()
            .ok_or(GatewayError::NotConfigured)?;

        let (url, _) = self.endpoint("auth").await?;
        let response = self
            .http
            .post(url)
            .json(&LoginBody {
                email: &credentials.email,
                password: &credentials.password,
            })
            .send()
            .await?;
        let login: LoginResponse = rejection(response).await?.json().await?;

        let (url, api_key) = self.endpoint("payout").await?;
        let callback = request.ipn_callback_url.as_ref().map(Url::as_str);
        let body = CreatePayoutBody {
            payout_description: &request.description,
            ipn_callback_url: callback,
            withdrawals: [WithdrawalBody {
                address: &request.address,
                currency: &request.currency,
                amount: request.amount,
                unique_external_id: &request.external_id,
                ipn_callback_url: callback,
            }],
        };
        let response = self
            .http
            .post(url)
            .header("x-api-key", api_key)
            .bearer_auth(login.token)
            .json(&body)
            .send()
            .await?;

        parse_created_payout(rejection(response).await?.json().await?)
    }
}

/// Pass a successful response through, or turn it into a rejection.
async fn rejection(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.message)
        .unwrap_or_default();
    Err(GatewayError::Rejected {
        status: status.as_u16(),
        message,
    })
}

/// Processor ids arrive as either numbers or strings.
fn id_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_created_payout(body: CreatePayoutResponse) -> Result<GatewayPayout, GatewayError> {
    let withdrawal = body
        .withdrawals
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::Malformed("payout has no withdrawals".to_owned()))?;
    let withdrawal_id = id_text(withdrawal.id)
        .ok_or_else(|| GatewayError::Malformed("missing withdrawal id".to_owned()))?;
    let status = withdrawal
        .status
        .as_deref()
        .and_then(|s| s.parse::<PayoutStatus>().ok())
        .unwrap_or(PayoutStatus::Waiting);
    Ok(GatewayPayout {
        batch_withdrawal_id: id_text(withdrawal.batch_withdrawal_id).or_else(|| id_text(body.id)),
        withdrawal_id,
        status,
    })
}

fn classify_rejection(status: u16, message: String) -> GatewayError {
    let lower = message.to_ascii_lowercase();
    if status == 400 && (lower.contains("small") || lower.contains("minimum")) {
        GatewayError::AmountTooSmall { message }
    } else {
        GatewayError::Rejected { status, message }
    }
}

fn parse_created_payment(body: CreatePaymentResponse) -> Result<GatewayPayment, GatewayError> {
    let payment_id = match body.payment_id {
        Value::String(s) if !s.is_empty() => s,
        Value::Number(n) => n.to_string(),
        other => return Err(GatewayError::Malformed(format!("payment_id: {other}"))),
    };
    let pay_address = body
        .pay_address
        .filter(|a| !a.is_empty())
        .ok_or_else(|| GatewayError::Malformed("missing pay_address".to_owned()))?;
    let pay_amount = match body.pay_amount {
        Some(Value::Number(n)) => {
            let text = n.to_string();
            text.parse::<Decimal>()
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Some(Value::String(s)) => s.parse::<Decimal>().ok(),
        _ => None,
    }
    .ok_or_else(|| GatewayError::Malformed("missing pay_amount".to_owned()))?;

    let status = body
        .payment_status
        .as_deref()
        .and_then(|s| s.parse::<PaymentStatus>().ok())
        .unwrap_or(PaymentStatus::Waiting);
    let expires_at = body
        .expiration_estimate_date
        .as_deref()
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());

    Ok(GatewayPayment {
        payment_id,
        pay_address,
        pay_amount,
        status,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_payment_parses_numeric_ids_and_expiry() {
        let body: CreatePaymentResponse = serde_json::from_str(
            r#"{
                "payment_id": 5745459419,
                "payment_status": "waiting",
                "pay_address": "0xabc",
                "pay_amount": 0.01003,
                "expiration_estimate_date": "2024-01-01T00:30:00.000Z"
            }"#,
        )
        .unwrap();
        let payment = parse_created_payment(body).unwrap();
        assert_eq!(payment.payment_id, "5745459419");
        assert_eq!(payment.pay_amount, Decimal::new(1003, 5));
        assert_eq!(payment.status, PaymentStatus::Waiting);
        assert_eq!(payment.expires_at.unwrap().unix_timestamp(), 1_704_069_000);
    }

    #[test]
    fn created_payment_without_address_is_malformed() {
        let body: CreatePaymentResponse =
            serde_json::from_str(r#"{"payment_id": "1", "pay_amount": 1}"#).unwrap();
        assert!(matches!(
            parse_created_payment(body),
            Err(GatewayError::Malformed(_))
        ));
    }

    #[test]
    fn small_amount_rejections_are_recognised() {
        assert!(matches!(
            classify_rejection(400, "Amount is too small".to_owned()),
            GatewayError::AmountTooSmall { .. }
        ));
        let other = classify_rejection(503, "maintenance".to_owned());
        assert!(other.is_retryable());
    }

    #[test]
    fn created_payout_takes_the_first_withdrawal() {
        let body: CreatePayoutResponse = serde_json::from_str(
            r#"{
                "id": "5000000713",
                "withdrawals": [{
                    "id": 5000000000,
                    "batch_withdrawal_id": "5000000713",
                    "address": "TEmGwPeRTPiLFLVfBxXkSP91yc5GMNQhfS",
                    "currency": "usdttrc20",
                    "amount": "50",
                    "status": "WAITING"
                }]
            }"#,
        )
        .unwrap();
        let payout = parse_created_payout(body).unwrap();
        assert_eq!(payout.withdrawal_id, "5000000000");
        assert_eq!(payout.batch_withdrawal_id.as_deref(), Some("5000000713"));
        assert_eq!(payout.status, PayoutStatus::Waiting);
    }

    #[test]
    fn payout_without_withdrawals_is_malformed() {
        let body: CreatePayoutResponse =
            serde_json::from_str(r#"{"id": 1, "withdrawals": []}"#).unwrap();
        assert!(matches!(
            parse_created_payout(body),
            Err(GatewayError::Malformed(_))
        ));
    }

    #[test]
    fn payout_body_carries_one_withdrawal() {
        let callback = "https://pay.example.com/payments/payout-webhook";
        let body = CreatePayoutBody {
            payout_description: "creator payout",
            ipn_callback_url: Some(callback),
            withdrawals: [WithdrawalBody {
                address: "T-addr",
                currency: "usdttrc20",
                amount: Decimal::new(1250, 2),
                unique_external_id: "p-1",
                ipn_callback_url: Some(callback),
            }],
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["withdrawals"][0]["amount"], serde_json::json!(12.5));
        assert_eq!(value["withdrawals"][0]["unique_external_id"], "p-1");
        assert_eq!(value["ipn_callback_url"], callback);
    }
}
