//! TOML file configuration structures.
//!
//! These structs directly map to the `cryptopay-config.toml` file format.
//! Secrets never live in the file; see [`super::Secrets`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use url::Url;
use uuid::Uuid;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub prices: PricesConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Payment processor section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_processor_api")]
    pub api_base: Url,
    /// Public URL of `POST /payments/webhook`, passed to the processor.
    #[serde(default)]
    pub ipn_callback_url: Option<Url>,
    #[serde(default = "default_payment_window")]
    pub payment_window_minutes: u32,
    /// Public URL of `POST /payments/payout-webhook`.
    #[serde(default)]
    pub payout_callback_url: Option<Url>,
    /// User ids allowed to call `POST /payments/payout`.
    #[serde(default)]
    pub payout_operators: Vec<Uuid>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            api_base: default_processor_api(),
            ipn_callback_url: None,
            payment_window_minutes: default_payment_window(),
            payout_callback_url: None,
            payout_operators: Vec::new(),
        }
    }
}

fn default_processor_api() -> Url {
    Url::parse("https://api.nowpayments.io/v1/").expect("valid default URL")
}

fn default_payment_window() -> u32 {
    30
}

/// Spot price feed section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricesConfig {
    #[serde(default = "default_prices_api")]
    pub api_url: Url,
}

impl Default for PricesConfig {
    fn default() -> Self {
        Self {
            api_url: default_prices_api(),
        }
    }
}

fn default_prices_api() -> Url {
    Url::parse("https://api.coingecko.com/api/v3/simple/price").expect("valid default URL")
}

/// USD amount bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_tip_min")]
    pub tip_min_usd: Decimal,
    #[serde(default = "default_max")]
    pub tip_max_usd: Decimal,
    #[serde(default = "default_max")]
    pub max_usd: Decimal,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            tip_min_usd: default_tip_min(),
            tip_max_usd: default_max(),
            max_usd: default_max(),
        }
    }
}

fn default_tip_min() -> Decimal {
    Decimal::ONE
}

fn default_max() -> Decimal {
    Decimal::new(10_000, 0)
}

/// Bearer token verification section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub supabase_url: Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    12
}
