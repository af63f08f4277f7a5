pub mod error;
pub mod payment;
pub mod payout;
pub mod quotes;
pub mod webhook;
pub mod ws;

pub use error::ApiErrorBody;
pub use payment::{
    CreatePaymentRequest, IDEMPOTENCY_KEY_HEADER, PaymentMetadata, PaymentSessionResponse,
    PaymentStatus, PaymentType, UnknownStatus,
};
pub use payout::{CreatePayoutRequest, DEFAULT_PAYOUT_CURRENCY, PayoutResponse};
pub use quotes::{
    CACHE_STATUS_HEADER, Freshness, MinAmountsResponse, Quote, SpotPricesResponse, UsdPrice,
    join_quotes,
};
pub use webhook::{
    ApplyOutcome, MalformedNotification, PaymentNotification, PayoutNotification, PayoutStatus,
    ProviderData, WebhookAck,
};
