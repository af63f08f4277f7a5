//! In-process fakes for the upstream adapters.
//!
//! Enabled for this crate's tests and, through the `test-util` feature, for
//! dependants that drive the full stack without network access.
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use cryptopay_sdk::currency::CryptoCurrency;
use cryptopay_sdk::objects::{PaymentStatus, PayoutStatus};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::quotes::PriceTable;
use crate::upstream::{
    AuthError, AuthenticatedUser, GatewayError, GatewayPayment, GatewayPaymentRequest,
    GatewayPayout, GatewayPayoutRequest, PaymentGateway, PriceFeed, PriceFeedError,
    TokenVerifier,
};

/// Price feed with a fixed table and a failure switch.
#[derive(Default)]
pub struct FakeFeed {
    pub prices: Mutex<PriceTable>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeFeed {
    pub fn with(prices: &[(CryptoCurrency, i64)]) -> Self {
        let feed = Self::default();
        {
            let mut table = feed.prices.lock().unwrap();
            for (c, p) in prices {
                table.insert(*c, Decimal::new(*p, 0));
            }
        }
        feed
    }
}

#[async_trait]
impl PriceFeed for FakeFeed {
    async fn usd_prices(&self, _: &[CryptoCurrency]) -> Result<PriceTable, PriceFeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(PriceFeedError::Status(503));
        }
        Ok(self.prices.lock().unwrap().clone())
    }
}

/// Payment processor whose behaviour is switched per test.
pub struct FakeGateway {
    pub configured: AtomicBool,
    pub fail: AtomicBool,
    pub reject_small: AtomicBool,
    /// Raw (unbuffered) minimum reported for every currency.
    pub raw_minimum: Mutex<Option<Decimal>>,
    pub created: Mutex<Vec<GatewayPaymentRequest>>,
    pub min_calls: AtomicUsize,
    /// Addresses the processor refuses to pay out to.
    pub invalid_addresses: Mutex<Vec<String>>,
    pub payouts: Mutex<Vec<GatewayPayoutRequest>>,
    next_id: AtomicUsize,
    next_withdrawal: AtomicUsize,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            configured: AtomicBool::new(true),
            fail: AtomicBool::new(false),
            reject_small: AtomicBool::new(false),
            raw_minimum: Mutex::new(Some(Decimal::new(50, 2))),
            created: Mutex::new(Vec::new()),
            min_calls: AtomicUsize::new(0),
            invalid_addresses: Mutex::new(Vec::new()),
            payouts: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1000),
            next_withdrawal: AtomicUsize::new(5000),
        }
    }
}

impl FakeGateway {
    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Processor payment id of the `n`th created payment.
    pub fn payment_id(n: usize) -> String {
        (1000 + n).to_string()
    }

    pub fn payout_count(&self) -> usize {
        self.payouts.lock().unwrap().len()
    }

    /// Withdrawal id of the `n`th created payout.
    pub fn withdrawal_id(n: usize) -> String {
        (5000 + n).to_string()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_payment(
        &self,
        request: &GatewayPaymentRequest,
    ) -> Result<GatewayPayment, GatewayError> {
        if !self.configured.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConfigured);
        }
        if self.reject_small.load(Ordering::SeqCst) {
            return Err(GatewayError::AmountTooSmall {
                message: "amountTo is too small".to_owned(),
            });
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 502,
                message: "bad gateway".to_owned(),
            });
        }
        // Yield so concurrent creators interleave.
        tokio::task::yield_now().await;
        self.created.lock().unwrap().push(request.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(GatewayPayment {
            payment_id: id.to_string(),
            pay_address: format!("addr-{id}"),
            pay_amount: Decimal::new(1, 2),
            status: PaymentStatus::Waiting,
            expires_at: None,
        })
    }

    async fn min_amount(&self, _: CryptoCurrency) -> Result<Option<Decimal>, GatewayError> {
        self.min_calls.fetch_add(1, Ordering::SeqCst);
        if !self.configured.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConfigured);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 503,
                message: String::new(),
            });
        }
        Ok(*self.raw_minimum.lock().unwrap())
    }

    async fn validate_address(&self, address: &str, _: &str) -> Result<(), GatewayError> {
        if !self.configured.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConfigured);
        }
        if self
            .invalid_addresses
            .lock()
            .unwrap()
            .iter()
            .any(|a| a == address)
        {
            return Err(GatewayError::Rejected {
                status: 400,
                message: "Invalid payout_address".to_owned(),
            });
        }
        Ok(())
    }

    async fn create_payout(
        &self,
        request: &GatewayPayoutRequest,
    ) -> Result<GatewayPayout, GatewayError> {
        if !self.configured.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConfigured);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 502,
                message: "bad gateway".to_owned(),
            });
        }
        self.payouts.lock().unwrap().push(request.clone());
        let id = self.next_withdrawal.fetch_add(1, Ordering::SeqCst);
        Ok(GatewayPayout {
            batch_withdrawal_id: Some(format!("batch-{id}")),
            withdrawal_id: id.to_string(),
            status: PayoutStatus::Waiting,
        })
    }
}

/// Token verifier backed by a fixed token table.
#[derive(Default)]
pub struct FakeVerifier {
    tokens: Mutex<HashMap<String, Uuid>>,
    pub unavailable: AtomicBool,
}

impl FakeVerifier {
    /// Register `token` for a fresh user and return the user's id.
    pub fn issue(&self, token: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.issue_as(token, id);
        id
    }

    /// Register `token` for the user `id`.
    pub fn issue_as(&self, token: &str, id: Uuid) {
        self.tokens.lock().unwrap().insert(token.to_owned(), id);
    }
}

#[async_trait]
impl TokenVerifier for FakeVerifier {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuthError::Status(503));
        }
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .map(|id| AuthenticatedUser {
                id: *id,
                email: None,
            })
            .ok_or(AuthError::InvalidToken)
    }
}
