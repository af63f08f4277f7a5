//! Creator payouts through the processor's mass-payout API.
//!
//! Only configured operators may send a payout. The destination is checked
//! with the processor first; the withdrawal it accepts is stored under its
//! withdrawal id so payout callbacks can find it.

use std::sync::Arc;

use cryptopay_sdk::objects::CreatePayoutRequest;
use cryptopay_sdk::objects::payout::is_valid_payout_currency;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::entities::payouts::PayoutRequest;
use crate::store::PaymentStore;
use crate::upstream::{GatewayError, GatewayPayoutRequest, PaymentGateway, TokenVerifier};
use crate::utils::Clock;

#[derive(Debug, thiserror::Error)]
pub enum CreatePayoutError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("payout access required")]
    Forbidden,

    #[error("payout amount must be positive")]
    InvalidAmount,

    #[error("unsupported payout currency: {0}")]
    InvalidCurrency(String),

    #[error("invalid wallet address: {0}")]
    InvalidAddress(String),

    #[error("payouts are not configured")]
    NotConfigured,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl CreatePayoutError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CreatePayoutError::UpstreamUnavailable(_))
    }
}

/// Per-request settings read from the live config.
#[derive(Debug, Clone, Default)]
pub struct PayoutSettings {
    pub operators: Vec<Uuid>,
    pub ipn_callback_url: Option<Url>,
}

pub struct PayoutCreator {
    store: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    auth: Arc<dyn TokenVerifier>,
    clock: Arc<dyn Clock>,
}

impl PayoutCreator {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        auth: Arc<dyn TokenVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            auth,
            clock,
        }
    }

    /// Send a payout and record the withdrawal.
    ///
    /// Once the processor has accepted the withdrawal the payout is
    /// returned even if recording it fails; the failure is logged for
    /// follow-up since repeating the call would pay twice.
    pub async fn create(
        &self,
        token: Option<&str>,
        request: CreatePayoutRequest,
        settings: &PayoutSettings,
    ) -> Result<PayoutRequest, CreatePayoutError> {
        let token = token.ok_or(CreatePayoutError::Unauthenticated)?;
        let user = self.auth.verify(token).await.map_err(|e| {
            if e.is_unauthenticated() {
                CreatePayoutError::Unauthenticated
            } else {
                CreatePayoutError::UpstreamUnavailable(e.to_string())
            }
        })?;
        if !settings.operators.contains(&user.id) {
            warn!(user_id = %user.id, "Payout attempted by a non-operator");
            return Err(CreatePayoutError::Forbidden);
        }

        if request.amount <= Decimal::ZERO {
            return Err(CreatePayoutError::InvalidAmount);
        }
        if !is_valid_payout_currency(&request.currency) {
            return Err(CreatePayoutError::InvalidCurrency(request.currency));
        }
        let address = request.address.trim();
        if address.is_empty() {
            return Err(CreatePayoutError::InvalidAddress(
                "address is required".to_owned(),
            ));
        }

        self.gateway
            .validate_address(address, &request.currency)
            .await
            .map_err(|e| match e {
                GatewayError::Rejected { status, message } if (400..500).contains(&status) => {
                    CreatePayoutError::InvalidAddress(message)
                }
                other => gateway_unavailable(other),
            })?;

        let external_id = request
            .reference
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let gateway_request = GatewayPayoutRequest {
            address: address.to_owned(),
            currency: request.currency.clone(),
            amount: request.amount,
            description: format!("Creator payout {external_id}"),
            external_id,
            ipn_callback_url: settings.ipn_callback_url.clone(),
        };
        let sent = self
            .gateway
            .create_payout(&gateway_request)
            .await
            .map_err(gateway_unavailable)?;

        let now = self.clock.now_primitive();
        let payout = PayoutRequest {
            withdrawal_id: sent.withdrawal_id,
            batch_withdrawal_id: sent.batch_withdrawal_id,
            currency: request.currency,
            amount: request.amount,
            address: Some(gateway_request.address),
            requested_by: Some(user.id),
            status: sent.status,
            tx_hash: None,
            created_at: now,
            updated_at: now,
        };
        match self.store.record_payout(payout.clone()).await {
            Ok(true) => info!(
                withdrawal_id = %payout.withdrawal_id,
                operator = %user.id,
                amount = %payout.amount,
                currency = %payout.currency,
                "Payout sent"
            ),
            Ok(false) => warn!(
                withdrawal_id = %payout.withdrawal_id,
                "Payout withdrawal was already recorded"
            ),
            Err(e) => error!(
                withdrawal_id = %payout.withdrawal_id,
                batch_withdrawal_id = ?payout.batch_withdrawal_id,
                amount = %payout.amount,
                currency = %payout.currency,
                error = %e,
                needs_investigation = true,
                "Failed to record payout the processor accepted"
            ),
        }
        Ok(payout)
    }
}

fn gateway_unavailable(e: GatewayError) -> CreatePayoutError {
    match e {
        GatewayError::NotConfigured => CreatePayoutError::NotConfigured,
        other => {
            warn!(error = %other, "Processor payout call failed");
            CreatePayoutError::UpstreamUnavailable(other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{FakeGateway, FakeVerifier};
    use crate::utils::ManualClock;
    use cryptopay_sdk::objects::{DEFAULT_PAYOUT_CURRENCY, PayoutStatus};
    use std::sync::atomic::Ordering;

    struct Harness {
        creator: PayoutCreator,
        store: Arc<MemoryStore>,
        gateway: Arc<FakeGateway>,
        settings: PayoutSettings,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::default());
        let auth = Arc::new(FakeVerifier::default());
        let operator = auth.issue("operator");
        auth.issue("creator");
        let creator = PayoutCreator::new(
            store.clone(),
            gateway.clone(),
            auth,
            Arc::new(ManualClock::default()),
        );
        Harness {
            creator,
            store,
            gateway,
            settings: PayoutSettings {
                operators: vec![operator],
                ipn_callback_url: None,
            },
        }
    }

    fn payout(address: &str, amount: i64) -> CreatePayoutRequest {
        CreatePayoutRequest {
            address: address.to_owned(),
            amount: Decimal::new(amount, 0),
            currency: DEFAULT_PAYOUT_CURRENCY.to_owned(),
            reference: Some("req-1".to_owned()),
        }
    }

    #[tokio::test]
    async fn operator_payout_is_recorded_under_the_withdrawal_id() {
        let h = harness();
        let sent = h
            .creator
            .create(Some("operator"), payout("T-addr", 50), &h.settings)
            .await
            .unwrap();
        assert_eq!(sent.withdrawal_id, FakeGateway::withdrawal_id(0));
        assert_eq!(sent.status, PayoutStatus::Waiting);

        let stored = h.store.payout(&sent.withdrawal_id).unwrap();
        assert_eq!(stored.amount, Decimal::new(50, 0));
        assert_eq!(stored.address.as_deref(), Some("T-addr"));

        let requests = h.gateway.payouts.lock().unwrap();
        assert_eq!(requests[0].external_id, "req-1");
        assert_eq!(requests[0].currency, "usdttrc20");
    }

    #[tokio::test]
    async fn only_operators_may_send_payouts() {
        let h = harness();
        let err = h
            .creator
            .create(Some("creator"), payout("T-addr", 50), &h.settings)
            .await
            .unwrap_err();
        assert!(matches!(err, CreatePayoutError::Forbidden));

        let err = h
            .creator
            .create(None, payout("T-addr", 50), &h.settings)
            .await
            .unwrap_err();
        assert!(matches!(err, CreatePayoutError::Unauthenticated));
        assert_eq!(h.gateway.payout_count(), 0);
    }

    #[tokio::test]
    async fn refused_addresses_never_reach_the_payout_call() {
        let h = harness();
        h.gateway
            .invalid_addresses
            .lock()
            .unwrap()
            .push("bad-addr".to_owned());
        let err = h
            .creator
            .create(Some("operator"), payout("bad-addr", 50), &h.settings)
            .await
            .unwrap_err();
        assert!(matches!(err, CreatePayoutError::InvalidAddress(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.gateway.payout_count(), 0);

        let err = h
            .creator
            .create(Some("operator"), payout("T-addr", 0), &h.settings)
            .await
            .unwrap_err();
        assert!(matches!(err, CreatePayoutError::InvalidAmount));
    }

    #[tokio::test]
    async fn processor_outage_is_retryable_and_records_nothing() {
        let h = harness();
        h.gateway.fail.store(true, Ordering::SeqCst);
        let err = h
            .creator
            .create(Some("operator"), payout("T-addr", 50), &h.settings)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(h.store.payout(&FakeGateway::withdrawal_id(0)).is_none());

        h.gateway.fail.store(false, Ordering::SeqCst);
        h.gateway.configured.store(false, Ordering::SeqCst);
        let err = h
            .creator
            .create(Some("operator"), payout("T-addr", 50), &h.settings)
            .await
            .unwrap_err();
        assert!(matches!(err, CreatePayoutError::NotConfigured));
    }

    #[tokio::test]
    async fn accepted_payout_is_returned_when_recording_fails() {
        let h = harness();
        h.store.set_failing(true);
        let sent = h
            .creator
            .create(Some("operator"), payout("T-addr", 50), &h.settings)
            .await
            .unwrap();
        assert_eq!(sent.withdrawal_id, FakeGateway::withdrawal_id(0));
        assert_eq!(h.gateway.payout_count(), 1);
    }
}
