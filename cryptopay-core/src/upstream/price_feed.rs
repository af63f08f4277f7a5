//! Spot price feed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use cryptopay_sdk::currency::CryptoCurrency;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::PricesConfig;

#[derive(Debug, thiserror::Error)]
pub enum PriceFeedError {
    #[error("price feed request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("price feed returned status {0}")]
    Status(u16),
}

/// Source of USD spot prices.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// USD price per currency. Currencies the feed does not know are absent.
    async fn usd_prices(
        &self,
        currencies: &[CryptoCurrency],
    ) -> Result<BTreeMap<CryptoCurrency, Decimal>, PriceFeedError>;
}

/// CoinGecko-compatible `simple/price` client.
pub struct CoinGeckoFeed {
    http: reqwest::Client,
    config: Arc<RwLock<PricesConfig>>,
}

#[derive(Debug, Deserialize)]
struct UsdEntry {
    #[serde(default, with = "rust_decimal::serde::float_option")]
    usd: Option<Decimal>,
}

impl CoinGeckoFeed {
    pub fn new(http: reqwest::Client, config: Arc<RwLock<PricesConfig>>) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl PriceFeed for CoinGeckoFeed {
    #[tracing::instrument(skip_all, err, name = "HTTP:PriceFeed")]
    async fn usd_prices(
        &self,
        currencies: &[CryptoCurrency],
    ) -> Result<BTreeMap<CryptoCurrency, Decimal>, PriceFeedError> {
        let url = self.config.read().await.api_url.clone();
        let ids = currencies
            .iter()
            .map(|c| c.info().price_feed_id)
            .collect::<Vec<_>>()
            .join(",");

        let response = self
            .http
            .get(url)
            .query(&[("ids", ids.as_str()), ("vs_currencies", "usd")])
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PriceFeedError::Status(response.status().as_u16()));
        }

        let body: HashMap<String, UsdEntry> = response.json().await?;
        Ok(collect_prices(body))
    }
}

fn collect_prices(body: HashMap<String, UsdEntry>) -> BTreeMap<CryptoCurrency, Decimal> {
    body.into_iter()
        .filter_map(|(feed_id, entry)| {
            let Some(currency) = CryptoCurrency::from_price_feed_id(&feed_id) else {
                warn!(feed_id = %feed_id, "Price feed returned an unknown asset");
                return None;
            };
            entry.usd.map(|usd| (currency, usd))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_body_maps_to_currencies() {
        let body: HashMap<String, UsdEntry> = serde_json::from_str(
            r#"{"bitcoin":{"usd":97000.5},"tether":{"usd":1.0},"dogecoin":{},"mystery":{"usd":3}}"#,
        )
        .unwrap();
        let prices = collect_prices(body);
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[&CryptoCurrency::Btc], Decimal::new(970005, 1));
        assert_eq!(prices[&CryptoCurrency::Usdt], Decimal::ONE);
    }
}
