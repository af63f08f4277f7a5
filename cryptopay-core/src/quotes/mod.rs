//! Spot price and minimum payable amount cache.
//!
//! Spot prices and processor minimums live in two independent
//! [`SingleFlightCache`]s with their own TTLs. Both serve the last good value
//! when upstream fails. Minimums additionally degrade to
//! [`SAFE_MINIMUM_USD`] when nothing was ever cached, so a missing processor
//! key never takes the checkout down.

mod single_flight;

pub use single_flight::{Cached, SingleFlightCache};

use std::collections::BTreeMap;
use std::sync::Arc;

use cryptopay_sdk::currency::{CryptoCurrency, SAFE_MINIMUM_USD, buffered_minimum};
use cryptopay_sdk::objects::{Freshness, Quote};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::upstream::{GatewayError, PaymentGateway, PriceFeed, PriceFeedError};
use crate::utils::Clock;

pub const SPOT_PRICE_TTL: time::Duration = time::Duration::seconds(60);
pub const MIN_AMOUNT_TTL: time::Duration = time::Duration::seconds(300);

pub type PriceTable = BTreeMap<CryptoCurrency, Decimal>;

#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    /// The feed failed and no price was ever cached.
    #[error("spot prices are unavailable: {0}")]
    PricesUnavailable(#[from] PriceFeedError),
}

impl QuoteError {
    pub fn is_retryable(&self) -> bool {
        true
    }
}

pub struct QuoteCache {
    feed: Arc<dyn PriceFeed>,
    gateway: Arc<dyn PaymentGateway>,
    currencies: Vec<CryptoCurrency>,
    prices: SingleFlightCache<(), PriceTable>,
    minimums: SingleFlightCache<CryptoCurrency, Decimal>,
    clock: Arc<dyn Clock>,
}

impl QuoteCache {
    pub fn new(
        feed: Arc<dyn PriceFeed>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            feed,
            gateway,
            currencies: CryptoCurrency::ALL.to_vec(),
            prices: SingleFlightCache::new(SPOT_PRICE_TTL, clock.clone()),
            minimums: SingleFlightCache::new(MIN_AMOUNT_TTL, clock.clone()),
            clock,
        }
    }

    /// Currencies quoted by this cache, in catalog order.
    pub fn currencies(&self) -> &[CryptoCurrency] {
        &self.currencies
    }

    /// USD spot price for every supported currency.
    pub async fn spot_prices(&self) -> Result<Cached<PriceTable>, QuoteError> {
        let cached = self
            .prices
            .get_or_fetch(&(), || self.feed.usd_prices(&self.currencies))
            .await?;
        if cached.freshness == Freshness::Stale {
            warn!(
                fetched_at = %cached.fetched_at,
                "Price feed unavailable, serving last known prices"
            );
        }
        Ok(cached)
    }

    /// Buffered minimum payable USD amount for `currency`. Never fails.
    pub async fn minimum_payable(&self, currency: CryptoCurrency) -> Cached<Decimal> {
        let gateway = &self.gateway;
        let result = self
            .minimums
            .get_or_fetch(&currency, || async move {
                let raw = gateway.min_amount(currency).await?;
                Ok::<_, GatewayError>(raw.map(buffered_minimum).unwrap_or(SAFE_MINIMUM_USD))
            })
            .await;

        match result {
            Ok(cached) => {
                if cached.freshness == Freshness::Stale {
                    warn!(%currency, "Minimum amount lookup failed, serving last known value");
                }
                cached
            }
            Err(GatewayError::NotConfigured) => {
                debug!(%currency, "Processor not configured, using safe minimum");
                self.floor()
            }
            Err(e) => {
                warn!(%currency, error = %e, "Minimum amount lookup failed, using safe minimum");
                self.floor()
            }
        }
    }

    /// Minimums for every supported currency, looked up concurrently.
    ///
    /// The freshness is the weakest of the individual lookups and
    /// `fetched_at` the oldest.
    pub async fn minimum_amounts(&self) -> Cached<PriceTable> {
        let lookups = join_all(self.currencies.iter().map(|&c| async move {
            (c, self.minimum_payable(c).await)
        }))
        .await;

        let mut freshness = Freshness::Hit;
        let mut fetched_at = self.clock.now();
        let mut value = BTreeMap::new();
        for (currency, cached) in lookups {
            freshness = freshness.weakest(cached.freshness);
            fetched_at = fetched_at.min(cached.fetched_at);
            value.insert(currency, cached.value);
        }
        Cached {
            value,
            freshness,
            fetched_at,
        }
    }

    /// Spot price and minimum for a single currency.
    pub async fn quote(&self, currency: CryptoCurrency) -> Result<Quote, QuoteError> {
        let (prices, minimum) = tokio::join!(self.spot_prices(), self.minimum_payable(currency));
        let prices = prices?;
        Ok(Quote {
            currency,
            spot_price_usd: prices.value.get(&currency).copied(),
            minimum_payable_usd: minimum.value,
            fetched_at: prices.fetched_at.unix_timestamp(),
        })
    }

    fn floor(&self) -> Cached<Decimal> {
        Cached {
            value: SAFE_MINIMUM_USD,
            freshness: Freshness::Fallback,
            fetched_at: self.clock.now(),
        }
    }
}
