//! Payment processor and price feed configuration.

use url::Url;
use uuid::Uuid;

/// Payment processor (NOWPayments-compatible) settings.
#[derive(Clone)]
pub struct ProcessorConfig {
    /// Base URL of the processor API, e.g. `https://api.nowpayments.io/v1/`.
    pub api_base: Url,
    /// Where the processor should deliver payment callbacks.
    pub ipn_callback_url: Option<Url>,
    /// Session lifetime used when the processor does not quote one.
    pub payment_window_minutes: u32,
    /// Processor API key. Absent means quotes fall back to safe defaults
    /// and session creation reports the upstream as unavailable.
    pub api_key: Option<String>,
    /// Shared callback secret. Absent means every callback is rejected.
    pub ipn_secret: Option<Box<[u8]>>,
    /// Where the processor should deliver payout callbacks.
    pub payout_callback_url: Option<Url>,
    /// Users allowed to send payouts.
    pub payout_operators: Vec<Uuid>,
    /// Account login for the mass-payout API. Absent disables payouts.
    pub payout_credentials: Option<PayoutCredentials>,
}

/// Processor account login, exchanged for a short-lived bearer token
/// before each payout.
#[derive(Clone)]
pub struct PayoutCredentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for PayoutCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayoutCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl ProcessorConfig {
    /// The callback secret, if one is configured and non-empty.
    pub fn ipn_secret_bytes(&self) -> Option<&[u8]> {
        self.ipn_secret.as_deref().filter(|s| !s.is_empty())
    }

    pub fn payment_window(&self) -> time::Duration {
        time::Duration::minutes(i64::from(self.payment_window_minutes))
    }
}

impl std::fmt::Debug for ProcessorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorConfig")
            .field("api_base", &self.api_base.as_str())
            .field("ipn_callback_url", &self.ipn_callback_url.as_ref().map(Url::as_str))
            .field("payment_window_minutes", &self.payment_window_minutes)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("ipn_secret", &self.ipn_secret.as_ref().map(|_| "<redacted>"))
            .field(
                "payout_callback_url",
                &self.payout_callback_url.as_ref().map(Url::as_str),
            )
            .field("payout_operators", &self.payout_operators)
            .field("payout_credentials", &self.payout_credentials)
            .finish()
    }
}

/// Spot price feed (CoinGecko-compatible `simple/price` endpoint).
#[derive(Debug, Clone)]
pub struct PricesConfig {
    pub api_url: Url,
}
