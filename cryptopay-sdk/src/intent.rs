//! Payment intent building: crypto estimates, minimum-amount gating,
//! currency ordering and amount formatting.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::currency::CryptoCurrency;
use crate::objects::payment::{CreatePaymentRequest, PaymentMetadata, PaymentType};
use crate::objects::quotes::Quote;

/// Per payment-type USD bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountLimits {
    pub tip_min_usd: Decimal,
    pub tip_max_usd: Decimal,
    /// Upper bound for every other payment type.
    pub max_usd: Decimal,
}

impl Default for AmountLimits {
    fn default() -> Self {
        Self {
            tip_min_usd: Decimal::ONE,
            tip_max_usd: Decimal::new(10_000, 0),
            max_usd: Decimal::new(10_000, 0),
        }
    }
}

impl AmountLimits {
    /// Check `usd_amount` against the bounds for `payment_type`.
    pub fn check(&self, payment_type: PaymentType, usd_amount: Decimal) -> Result<(), IntentError> {
        if usd_amount <= Decimal::ZERO {
            return Err(IntentError::NonPositiveAmount);
        }
        let (min, max) = match payment_type {
            PaymentType::Tip => (Some(self.tip_min_usd), self.tip_max_usd),
            _ => (None, self.max_usd),
        };
        if let Some(min) = min {
            if usd_amount < min {
                return Err(IntentError::OutOfBounds { min, max });
            }
        }
        if usd_amount > max {
            return Err(IntentError::OutOfBounds {
                min: min.unwrap_or(Decimal::ZERO),
                max,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IntentError {
    #[error("amount must be greater than zero")]
    NonPositiveAmount,
    #[error("amount must be between ${min} and ${max}")]
    OutOfBounds { min: Decimal, max: Decimal },
    #[error("minimum for this currency is ${minimum} USD")]
    BelowMinimum { minimum: Decimal },
}

/// A validated, not yet submitted payment.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentIntent {
    pub usd_amount: Decimal,
    pub currency: CryptoCurrency,
    pub payment_type: PaymentType,
    pub metadata: PaymentMetadata,
}

impl PaymentIntent {
    /// Build an intent, enforcing the amount bounds and the currency minimum.
    pub fn new(
        usd_amount: Decimal,
        quote: &Quote,
        payment_type: PaymentType,
        metadata: PaymentMetadata,
        limits: &AmountLimits,
    ) -> Result<Self, IntentError> {
        limits.check(payment_type, usd_amount)?;
        if !is_payable(usd_amount, quote) {
            return Err(IntentError::BelowMinimum {
                minimum: quote.minimum_payable_usd,
            });
        }
        Ok(Self {
            usd_amount,
            currency: quote.currency,
            payment_type,
            metadata,
        })
    }

    pub fn into_request(self) -> CreatePaymentRequest {
        CreatePaymentRequest {
            usd_amount: self.usd_amount,
            crypto_currency: self.currency,
            payment_type: self.payment_type,
            metadata: self.metadata,
        }
    }
}

/// Estimated crypto amount for `usd_amount`, or `None` when the price is
/// unknown, zero or negative.
pub fn estimate(usd_amount: Decimal, quote: &Quote) -> Option<Decimal> {
    let price = quote.spot_price_usd?;
    if price <= Decimal::ZERO {
        return None;
    }
    usd_amount.checked_div(price)
}

/// Whether `usd_amount` meets the buffered minimum for the quote's currency.
pub fn is_payable(usd_amount: Decimal, quote: &Quote) -> bool {
    usd_amount >= quote.minimum_payable_usd
}

/// One selectable row of the currency picker.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentOption {
    pub currency: CryptoCurrency,
    pub estimated_amount: Option<Decimal>,
    pub payable: bool,
}

/// Currency picker rows: stablecoins first, otherwise in the order the
/// quotes were given (stable sort).
pub fn payment_options(usd_amount: Decimal, quotes: &[Quote]) -> Vec<PaymentOption> {
    let mut options: Vec<PaymentOption> = quotes
        .iter()
        .map(|q| PaymentOption {
            currency: q.currency,
            estimated_amount: estimate(usd_amount, q),
            payable: is_payable(usd_amount, q),
        })
        .collect();
    options.sort_by_key(|o| !o.currency.is_stablecoin());
    options
}

/// Format a crypto amount for display.
///
/// Stablecoins always show exactly two decimals. Other currencies are
/// rounded to their display precision with trailing zeros removed, and the
/// decimal point dropped when nothing remains after it.
pub fn format_crypto_amount(amount: Decimal, currency: CryptoCurrency) -> String {
    if currency.is_stablecoin() {
        let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        return format!("{rounded:.2}");
    }
    let decimals = currency.info().decimals as usize;
    let rounded =
        amount.round_dp_with_strategy(decimals as u32, RoundingStrategy::MidpointAwayFromZero);
    let fixed = format!("{rounded:.decimals$}");
    if !fixed.contains('.') {
        return fixed;
    }
    fixed
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_owned()
}
