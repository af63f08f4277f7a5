//! Supported cryptocurrencies and their static attributes.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// All cryptocurrencies a payment can be made in.
///
/// Serialized by its short id (`"btc"`, `"usdt"`, ...), which is also the
/// key used by the price and minimum-amount endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoCurrency {
    Btc,
    Eth,
    Usdt,
    Usdc,
    Sol,
    Ltc,
    Doge,
    Bnb,
    Xrp,
    Trx,
}

/// Static per-currency data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrencyInfo {
    pub name: &'static str,
    pub symbol: &'static str,
    /// Identifier used by the spot price feed.
    pub price_feed_id: &'static str,
    /// Currency code understood by the payment processor (network-qualified
    /// for tokens, e.g. TRC-20 USDT).
    pub processor_code: &'static str,
    /// Decimal places shown to the user.
    pub decimals: u32,
}

impl CryptoCurrency {
    /// Catalog order. Presentation order is derived from this by
    /// [`crate::intent::payment_options`].
    pub const ALL: [CryptoCurrency; 10] = [
        CryptoCurrency::Btc,
        CryptoCurrency::Eth,
        CryptoCurrency::Usdt,
        CryptoCurrency::Usdc,
        CryptoCurrency::Sol,
        CryptoCurrency::Ltc,
        CryptoCurrency::Doge,
        CryptoCurrency::Bnb,
        CryptoCurrency::Xrp,
        CryptoCurrency::Trx,
    ];

    pub const fn info(self) -> CurrencyInfo {
        let (name, symbol, price_feed_id, processor_code, decimals) = match self {
            CryptoCurrency::Btc => ("Bitcoin", "BTC", "bitcoin", "btc", 8),
            CryptoCurrency::Eth => ("Ethereum", "ETH", "ethereum", "eth", 8),
            CryptoCurrency::Usdt => ("Tether", "USDT", "tether", "usdttrc20", 2),
            CryptoCurrency::Usdc => ("USD Coin", "USDC", "usd-coin", "usdcmatic", 2),
            CryptoCurrency::Sol => ("Solana", "SOL", "solana", "sol", 6),
            CryptoCurrency::Ltc => ("Litecoin", "LTC", "litecoin", "ltc", 8),
            CryptoCurrency::Doge => ("Dogecoin", "DOGE", "dogecoin", "doge", 4),
            CryptoCurrency::Bnb => ("BNB", "BNB", "binancecoin", "bnbbsc", 6),
            CryptoCurrency::Xrp => ("XRP", "XRP", "ripple", "xrp", 6),
            CryptoCurrency::Trx => ("TRON", "TRX", "tron", "trx", 6),
        };
        CurrencyInfo {
            name,
            symbol,
            price_feed_id,
            processor_code,
            decimals,
        }
    }

    /// Short id, identical to the serde representation.
    pub const fn id(self) -> &'static str {
        match self {
            CryptoCurrency::Btc => "btc",
            CryptoCurrency::Eth => "eth",
            CryptoCurrency::Usdt => "usdt",
            CryptoCurrency::Usdc => "usdc",
            CryptoCurrency::Sol => "sol",
            CryptoCurrency::Ltc => "ltc",
            CryptoCurrency::Doge => "doge",
            CryptoCurrency::Bnb => "bnb",
            CryptoCurrency::Xrp => "xrp",
            CryptoCurrency::Trx => "trx",
        }
    }

    pub const fn is_stablecoin(self) -> bool {
        matches!(self, CryptoCurrency::Usdt | CryptoCurrency::Usdc)
    }

    /// Look up a currency by its short id.
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.id() == id)
    }

    /// Look up a currency by its price feed identifier.
    pub fn from_price_feed_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.info().price_feed_id == id)
    }
}

impl std::fmt::Display for CryptoCurrency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Minimum payable amount used when the processor cannot be asked.
pub const SAFE_MINIMUM_USD: Decimal = Decimal::from_parts(50, 0, 0, false, 2);

/// Apply the +10% safety buffer to a processor minimum, rounding up to cents.
pub fn buffered_minimum(raw_minimum_usd: Decimal) -> Decimal {
    let buffered = raw_minimum_usd * Decimal::new(110, 2);
    buffered.round_dp_with_strategy(2, rust_decimal::RoundingStrategy::AwayFromZero)
}
