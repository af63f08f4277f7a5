//! Spot price and minimum amount payloads.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::currency::CryptoCurrency;

/// Header annotating how fresh a quote response is.
pub const CACHE_STATUS_HEADER: &str = "X-Cache";

/// Freshness of a cached quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Freshness {
    /// Served from cache within its TTL.
    Hit,
    /// Fetched from upstream for this request.
    Miss,
    /// Upstream failed; served a last-known-good value past its TTL.
    Stale,
    /// No upstream available; served the safe constant floor.
    Fallback,
}

impl Freshness {
    pub const fn as_str(self) -> &'static str {
        match self {
            Freshness::Hit => "HIT",
            Freshness::Miss => "MISS",
            Freshness::Stale => "STALE",
            Freshness::Fallback => "FALLBACK",
        }
    }

    /// Parse an `X-Cache` header value.
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "HIT" => Some(Freshness::Hit),
            "MISS" => Some(Freshness::Miss),
            "STALE" => Some(Freshness::Stale),
            "FALLBACK" => Some(Freshness::Fallback),
            _ => None,
        }
    }

    /// Combine the freshness of several values into the weakest one.
    pub fn weakest(self, other: Freshness) -> Freshness {
        fn weight(f: Freshness) -> u8 {
            match f {
                Freshness::Hit => 0,
                Freshness::Miss => 1,
                Freshness::Stale => 2,
                Freshness::Fallback => 3,
            }
        }
        if weight(other) > weight(self) { other } else { self }
    }
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A USD price as it appears on the wire: `{"usd": 97000.0}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsdPrice {
    #[serde(with = "rust_decimal::serde::float")]
    pub usd: Decimal,
}

/// Body of `GET /prices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotPricesResponse {
    #[serde(flatten)]
    pub prices: BTreeMap<CryptoCurrency, UsdPrice>,
    /// Unix timestamp of the upstream fetch that produced these prices.
    #[serde(rename = "_updated")]
    pub updated_at: i64,
}

/// Body of `GET /min-amounts`: currency id to minimum payable USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinAmountsResponse(
    #[serde(with = "min_amounts_float")] pub BTreeMap<CryptoCurrency, Decimal>,
);

mod min_amounts_float {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    use crate::currency::CryptoCurrency;

    #[derive(Serialize, Deserialize)]
    struct Float(#[serde(with = "rust_decimal::serde::float")] Decimal);

    pub fn serialize<S: Serializer>(
        value: &BTreeMap<CryptoCurrency, Decimal>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let map: BTreeMap<CryptoCurrency, Float> =
            value.iter().map(|(k, v)| (*k, Float(*v))).collect();
        map.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<CryptoCurrency, Decimal>, D::Error> {
        let map = BTreeMap::<CryptoCurrency, Float>::deserialize(deserializer)?;
        Ok(map.into_iter().map(|(k, Float(v))| (k, v)).collect())
    }
}

/// Everything needed to price a payment in one currency.
///
/// Ephemeral: recomputed from the quote cache, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub currency: CryptoCurrency,
    /// `None` when the price feed has no price for this currency.
    pub spot_price_usd: Option<Decimal>,
    /// Already includes the safety buffer over the processor minimum.
    pub minimum_payable_usd: Decimal,
    /// Unix timestamp.
    pub fetched_at: i64,
}

/// Join the two quote endpoints into one [`Quote`] per currency in
/// `currencies`. Currencies missing from `minimums` get the safe floor.
pub fn join_quotes(
    currencies: &[CryptoCurrency],
    prices: &SpotPricesResponse,
    minimums: &MinAmountsResponse,
) -> Vec<Quote> {
    currencies
        .iter()
        .map(|&currency| Quote {
            currency,
            spot_price_usd: prices.prices.get(&currency).map(|p| p.usd),
            minimum_payable_usd: minimums
                .0
                .get(&currency)
                .copied()
                .unwrap_or(crate::currency::SAFE_MINIMUM_USD),
            fetched_at: prices.updated_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prices_serialize_as_numbers_keyed_by_id() {
        let mut prices = BTreeMap::new();
        prices.insert(
            CryptoCurrency::Btc,
            UsdPrice {
                usd: Decimal::new(97000, 0),
            },
        );
        let body = SpotPricesResponse {
            prices,
            updated_at: 1_700_000_000,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["btc"]["usd"], serde_json::json!(97000.0));
        assert_eq!(json["_updated"], serde_json::json!(1_700_000_000));
    }

    #[test]
    fn min_amounts_round_trip() {
        let json = r#"{"btc":1.65,"usdt":0.55}"#;
        let parsed: MinAmountsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.0[&CryptoCurrency::Usdt], Decimal::new(55, 2));
        let back = serde_json::to_value(&parsed).unwrap();
        assert_eq!(back["btc"], serde_json::json!(1.65));
    }

    #[test]
    fn join_fills_missing_minimums_with_floor() {
        let mut prices = BTreeMap::new();
        prices.insert(CryptoCurrency::Eth, UsdPrice { usd: Decimal::new(2500, 0) });
        let prices = SpotPricesResponse { prices, updated_at: 10 };
        let minimums = MinAmountsResponse(BTreeMap::new());
        let quotes = join_quotes(&[CryptoCurrency::Eth, CryptoCurrency::Sol], &prices, &minimums);
        assert_eq!(quotes[0].spot_price_usd, Some(Decimal::new(2500, 0)));
        assert_eq!(quotes[1].spot_price_usd, None);
        assert_eq!(quotes[1].minimum_payable_usd, crate::currency::SAFE_MINIMUM_USD);
    }

    #[test]
    fn freshness_header_parses() {
        assert_eq!(Freshness::from_header("stale"), Some(Freshness::Stale));
        assert_eq!(Freshness::from_header("nope"), None);
    }

    #[test]
    fn weakest_freshness_wins() {
        assert_eq!(Freshness::Hit.weakest(Freshness::Stale), Freshness::Stale);
        assert_eq!(Freshness::Fallback.weakest(Freshness::Miss), Freshness::Fallback);
    }
}
