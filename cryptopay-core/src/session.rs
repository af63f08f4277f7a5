//! Payment session creation.
//!
//! A session row is claimed under `(user, idempotency key)` before the
//! processor is called, so a retried or double-clicked request finds the
//! claim and never opens a second processor payment. A failed processor call
//! releases the claim so the same key can be retried.
//!
//! Once the processor has returned a payment the claim is never released.
//! If recording it fails, the attachment is held in memory and the next
//! request with the same key writes it instead of calling the processor
//! again. A claim left unattached for longer than the payment window (a
//! crash between claim and attach) is taken over by the next request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cryptopay_sdk::currency::CryptoCurrency;
use cryptopay_sdk::intent::{AmountLimits, IntentError};
use cryptopay_sdk::objects::payment::is_valid_idempotency_key;
use cryptopay_sdk::objects::{CreatePaymentRequest, PaymentStatus};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::entities::payment_sessions::{
    ClaimOutcome, NewSessionClaim, PaymentSession, ProcessorAttachment,
};
use crate::quotes::QuoteCache;
use crate::store::PaymentStore;
use crate::upstream::{
    AuthenticatedUser, GatewayError, GatewayPaymentRequest, PaymentGateway, TokenVerifier,
};
use crate::utils::{Clock, to_primitive};

#[derive(Debug, thiserror::Error)]
pub enum CreateSessionError {
    #[error("{0}")]
    InvalidAmount(IntentError),

    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(CryptoCurrency),

    #[error("minimum for {currency} is ${minimum} USD")]
    BelowMinimum {
        currency: CryptoCurrency,
        minimum: Decimal,
    },

    #[error("idempotency key was already used for a different payment")]
    IdempotencyConflict,

    #[error("a payment for this idempotency key is still being created")]
    SessionInFlight,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("idempotency key must be 1-128 visible ASCII characters")]
    InvalidIdempotencyKey,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl CreateSessionError {
    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CreateSessionError::SessionInFlight
                | CreateSessionError::UpstreamUnavailable(_)
                | CreateSessionError::Database(_)
        )
    }
}

/// Per-request settings read from the live config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub limits: AmountLimits,
    /// Session lifetime when the processor does not quote an expiry.
    pub payment_window: time::Duration,
    pub ipn_callback_url: Option<Url>,
}

pub struct SessionCreator {
    store: Arc<dyn PaymentStore>,
    gateway: Arc<dyn PaymentGateway>,
    quotes: Arc<QuoteCache>,
    auth: Arc<dyn TokenVerifier>,
    clock: Arc<dyn Clock>,
    /// Processor payments whose attach write failed, by session id.
    unrecorded: Mutex<HashMap<Uuid, ProcessorAttachment>>,
}

/// A claimed key: either ours to drive through the processor, or already
/// carrying a processor payment.
enum Reservation {
    Fresh(PaymentSession),
    Settled(PaymentSession),
}

impl SessionCreator {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        quotes: Arc<QuoteCache>,
        auth: Arc<dyn TokenVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            quotes,
            auth,
            clock,
            unrecorded: Mutex::new(HashMap::new()),
        }
    }

    /// Create a payment session, or return the one already created for
    /// `idempotency_key`.
    ///
    /// Without a key a fresh one is generated and the request is not
    /// deduplicated.
    pub async fn create(
        &self,
        token: Option<&str>,
        request: CreatePaymentRequest,
        idempotency_key: Option<&str>,
        settings: &SessionSettings,
    ) -> Result<PaymentSession, CreateSessionError> {
        let user = self.authenticate(token).await?;
        let idempotency_key = match idempotency_key {
            Some(key) if is_valid_idempotency_key(key) => key.to_owned(),
            Some(_) => return Err(CreateSessionError::InvalidIdempotencyKey),
            None => Uuid::new_v4().to_string(),
        };
        settings
            .limits
            .check(request.payment_type, request.usd_amount)
            .map_err(CreateSessionError::InvalidAmount)?;
        let currency = request.crypto_currency;
        if !self.quotes.currencies().contains(&currency) {
            return Err(CreateSessionError::UnsupportedCurrency(currency));
        }

        let now = self.clock.now_primitive();
        let claim = NewSessionClaim {
            id: Uuid::now_v7(),
            user_id: user.id,
            idempotency_key,
            payment_type: request.payment_type,
            metadata: request.metadata.clone(),
            usd_amount: request.usd_amount,
            pay_currency: currency,
            created_at: now,
            expires_at: now + settings.payment_window,
        };
        let session = match self
            .reserve(claim, &request, settings.payment_window)
            .await?
        {
            Reservation::Fresh(session) => session,
            Reservation::Settled(session) => return Ok(session),
        };

        let minimum = self.quotes.minimum_payable(currency).await.value;
        if request.usd_amount < minimum {
            self.release(session.id).await;
            return Err(CreateSessionError::BelowMinimum { currency, minimum });
        }

        let gateway_request = GatewayPaymentRequest {
            order_id: format!("{}_{}", request.payment_type, session.id),
            usd_amount: request.usd_amount,
            currency,
            description: format!("{} payment", request.payment_type),
            ipn_callback_url: settings.ipn_callback_url.clone(),
        };
        let payment = match self.gateway.create_payment(&gateway_request).await {
            Ok(payment) => payment,
            Err(e) => {
                self.release(session.id).await;
                return Err(match e {
                    GatewayError::AmountTooSmall { message } => {
                        debug!(session_id = %session.id, %message, "Processor refused amount");
                        CreateSessionError::BelowMinimum { currency, minimum }
                    }
                    other => {
                        warn!(session_id = %session.id, error = %other, "Processor payment creation failed");
                        CreateSessionError::UpstreamUnavailable(other.to_string())
                    }
                });
            }
        };

        let status = match payment.status {
            PaymentStatus::Created => PaymentStatus::Waiting,
            other => other,
        };
        let attachment = ProcessorAttachment {
            session_id: session.id,
            processor_payment_id: payment.payment_id.clone(),
            pay_address: payment.pay_address,
            pay_amount: payment.pay_amount,
            status,
            expires_at: payment
                .expires_at
                .map(to_primitive)
                .unwrap_or(now + settings.payment_window),
            updated_at: self.clock.now_primitive(),
        };
        self.attach(attachment).await
    }

    /// Claim the key, or resolve the session already holding it.
    async fn reserve(
        &self,
        claim: NewSessionClaim,
        request: &CreatePaymentRequest,
        payment_window: time::Duration,
    ) -> Result<Reservation, CreateSessionError> {
        let existing = match self.store.claim_session(claim.clone()).await? {
            ClaimOutcome::Claimed(session) => return Ok(Reservation::Fresh(session)),
            ClaimOutcome::Existing(existing) => existing,
        };
        if !existing.same_intent(request) {
            return Err(CreateSessionError::IdempotencyConflict);
        }
        if existing.pay_address.is_some() {
            debug!(session_id = %existing.id, "Returning existing session for idempotency key");
            return Ok(Reservation::Settled(existing));
        }
        if let Some(attachment) = self.unrecorded_attachment(existing.id) {
            debug!(session_id = %existing.id, "Retrying unrecorded processor payment");
            return self.attach(attachment).await.map(Reservation::Settled);
        }
        if existing.created_at + payment_window > claim.created_at {
            return Err(CreateSessionError::SessionInFlight);
        }

        warn!(
            session_id = %existing.id,
            claimed_at = %existing.created_at,
            "Taking over abandoned session claim"
        );
        self.release(existing.id).await;
        match self.store.claim_session(claim).await? {
            ClaimOutcome::Claimed(session) => Ok(Reservation::Fresh(session)),
            ClaimOutcome::Existing(_) => Err(CreateSessionError::SessionInFlight),
        }
    }

    /// Record the processor payment on its claim. A failed write keeps both
    /// the claim and the attachment for the next attempt.
    async fn attach(
        &self,
        attachment: ProcessorAttachment,
    ) -> Result<PaymentSession, CreateSessionError> {
        let session_id = attachment.session_id;
        let processor_payment_id = attachment.processor_payment_id.clone();
        match self.store.attach_processor_payment(attachment.clone()).await {
            Ok(Some(session)) => {
                self.forget_attachment(session_id);
                info!(
                    session_id = %session.id,
                    processor_payment_id = %processor_payment_id,
                    payment_type = %session.payment_type,
                    "Payment session created"
                );
                Ok(session)
            }
            Ok(None) => {
                self.forget_attachment(session_id);
                match self.store.session(session_id).await? {
                    // An earlier write landed after all.
                    Some(session)
                        if session.processor_payment_id.as_deref()
                            == Some(processor_payment_id.as_str()) =>
                    {
                        Ok(session)
                    }
                    _ => {
                        error!(
                            session_id = %session_id,
                            processor_payment_id = %processor_payment_id,
                            needs_investigation = true,
                            "Session claim disappeared before the processor payment was attached"
                        );
                        Err(CreateSessionError::Database(sqlx::Error::RowNotFound))
                    }
                }
            }
            Err(e) => {
                error!(
                    session_id = %session_id,
                    processor_payment_id = %processor_payment_id,
                    error = %e,
                    needs_investigation = true,
                    "Failed to record processor payment, keeping the claim"
                );
                self.unrecorded_map().insert(session_id, attachment);
                Err(CreateSessionError::Database(e))
            }
        }
    }

    fn unrecorded_map(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ProcessorAttachment>> {
        match self.unrecorded.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn unrecorded_attachment(&self, session_id: Uuid) -> Option<ProcessorAttachment> {
        self.unrecorded_map().get(&session_id).cloned()
    }

    fn forget_attachment(&self, session_id: Uuid) {
        self.unrecorded_map().remove(&session_id);
    }

    async fn authenticate(
        &self,
        token: Option<&str>,
    ) -> Result<AuthenticatedUser, CreateSessionError> {
        let token = token.ok_or(CreateSessionError::Unauthenticated)?;
        self.auth.verify(token).await.map_err(|e| {
            if e.is_unauthenticated() {
                CreateSessionError::Unauthenticated
            } else {
                warn!(error = %e, "Token verification unavailable");
                CreateSessionError::UpstreamUnavailable(e.to_string())
            }
        })
    }

    async fn release(&self, session_id: Uuid) {
        if let Err(e) = self.store.release_claim(session_id).await {
            warn!(session_id = %session_id, error = %e, "Failed to release session claim");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::payment_sessions::{PaymentStatusUpdate, StatusTransition};
    use crate::entities::payouts::{PayoutRequest, PayoutStatusUpdate, PayoutTransition};
    use crate::store::MemoryStore;
    use crate::testing::{FakeFeed, FakeGateway, FakeVerifier};
    use crate::utils::ManualClock;
    use async_trait::async_trait;
    use cryptopay_sdk::objects::{PaymentMetadata, PaymentType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the next `attach_failures` attach writes.
    struct FlakyAttach {
        inner: Arc<MemoryStore>,
        attach_failures: AtomicUsize,
    }

    #[async_trait]
    impl PaymentStore for FlakyAttach {
        async fn claim_session(&self, claim: NewSessionClaim) -> Result<ClaimOutcome, sqlx::Error> {
            self.inner.claim_session(claim).await
        }

        async fn attach_processor_payment(
            &self,
            attachment: ProcessorAttachment,
        ) -> Result<Option<PaymentSession>, sqlx::Error> {
            let failing = self
                .attach_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(sqlx::Error::PoolTimedOut);
            }
            self.inner.attach_processor_payment(attachment).await
        }

        async fn release_claim(&self, session_id: Uuid) -> Result<bool, sqlx::Error> {
            self.inner.release_claim(session_id).await
        }

        async fn session(&self, id: Uuid) -> Result<Option<PaymentSession>, sqlx::Error> {
            self.inner.session(id).await
        }

        async fn apply_payment_status(
            &self,
            update: PaymentStatusUpdate,
        ) -> Result<StatusTransition, sqlx::Error> {
            self.inner.apply_payment_status(update).await
        }

        async fn record_payout(&self, payout: PayoutRequest) -> Result<bool, sqlx::Error> {
            self.inner.record_payout(payout).await
        }

        async fn apply_payout_status(
            &self,
            update: PayoutStatusUpdate,
        ) -> Result<PayoutTransition, sqlx::Error> {
            self.inner.apply_payout_status(update).await
        }
    }

    struct Harness {
        creator: Arc<SessionCreator>,
        store: Arc<MemoryStore>,
        flaky: Arc<FlakyAttach>,
        gateway: Arc<FakeGateway>,
        auth: Arc<FakeVerifier>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyAttach {
            inner: store.clone(),
            attach_failures: AtomicUsize::new(0),
        });
        let gateway = Arc::new(FakeGateway::default());
        let auth = Arc::new(FakeVerifier::default());
        let quotes = Arc::new(QuoteCache::new(
            Arc::new(FakeFeed::default()),
            gateway.clone(),
            clock.clone(),
        ));
        let creator = Arc::new(SessionCreator::new(
            flaky.clone(),
            gateway.clone(),
            quotes,
            auth.clone(),
            clock.clone(),
        ));
        Harness {
            creator,
            store,
            flaky,
            gateway,
            auth,
            clock,
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            limits: AmountLimits::default(),
            payment_window: time::Duration::minutes(30),
            ipn_callback_url: None,
        }
    }

    fn tip(usd: i64) -> CreatePaymentRequest {
        let mut metadata = PaymentMetadata::new();
        metadata.insert("creator_id".to_owned(), serde_json::json!("c-1"));
        CreatePaymentRequest {
            usd_amount: Decimal::new(usd, 0),
            crypto_currency: CryptoCurrency::Eth,
            payment_type: PaymentType::Tip,
            metadata,
        }
    }

    #[tokio::test]
    async fn creates_a_waiting_session() {
        let h = harness();
        h.auth.issue("tok");
        let session = h
            .creator
            .create(Some("tok"), tip(25), Some("key-1"), &settings())
            .await
            .unwrap();
        assert_eq!(session.status, PaymentStatus::Waiting);
        assert!(session.pay_address.is_some());
        assert_eq!(session.expires_at - session.created_at, time::Duration::minutes(30));

        let created = h.gateway.created.lock().unwrap();
        assert_eq!(created[0].order_id, format!("tip_{}", session.id));
    }

    #[tokio::test]
    async fn same_key_returns_the_same_session() {
        let h = harness();
        h.auth.issue("tok");
        let first = h
            .creator
            .create(Some("tok"), tip(25), Some("key-1"), &settings())
            .await
            .unwrap();
        let second = h
            .creator
            .create(Some("tok"), tip(25), Some("key-1"), &settings())
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(h.gateway.created_count(), 1);
        assert_eq!(h.store.session_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_retries_open_one_processor_payment() {
        let h = harness();
        h.auth.issue("tok");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let creator = h.creator.clone();
            handles.push(tokio::spawn(async move {
                creator
                    .create(Some("tok"), tip(25), Some("double-click"), &settings())
                    .await
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(session) => ids.push(session.id),
                Err(e) => assert!(
                    matches!(e, CreateSessionError::SessionInFlight),
                    "unexpected error {e}"
                ),
            }
        }
        ids.dedup();
        assert!(ids.len() <= 1);
        assert_eq!(h.gateway.created_count(), 1);
        assert_eq!(h.store.session_count(), 1);
    }

    #[tokio::test]
    async fn different_intent_under_same_key_conflicts() {
        let h = harness();
        h.auth.issue("tok");
        h.creator
            .create(Some("tok"), tip(25), Some("key-1"), &settings())
            .await
            .unwrap();
        let err = h
            .creator
            .create(Some("tok"), tip(30), Some("key-1"), &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateSessionError::IdempotencyConflict));
    }

    #[tokio::test]
    async fn failed_processor_call_frees_the_key() {
        let h = harness();
        h.auth.issue("tok");
        h.gateway.fail.store(true, Ordering::SeqCst);
        let err = h
            .creator
            .create(Some("tok"), tip(25), Some("key-1"), &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateSessionError::UpstreamUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(h.store.session_count(), 0);

        h.gateway.fail.store(false, Ordering::SeqCst);
        h.creator
            .create(Some("tok"), tip(25), Some("key-1"), &settings())
            .await
            .unwrap();
        assert_eq!(h.gateway.created_count(), 1);
    }

    #[tokio::test]
    async fn amounts_below_the_buffered_minimum_are_rejected() {
        let h = harness();
        h.auth.issue("tok");
        *h.gateway.raw_minimum.lock().unwrap() = Some(Decimal::new(20, 0));
        let err = h
            .creator
            .create(Some("tok"), tip(21), None, &settings())
            .await
            .unwrap_err();
        match err {
            CreateSessionError::BelowMinimum { minimum, .. } => {
                assert_eq!(minimum, Decimal::new(22, 0))
            }
            other => panic!("unexpected {other}"),
        }
        assert_eq!(h.gateway.created_count(), 0);
        assert_eq!(h.store.session_count(), 0);
    }

    #[tokio::test]
    async fn processor_minimum_rejection_maps_to_below_minimum() {
        let h = harness();
        h.auth.issue("tok");
        h.gateway.reject_small.store(true, Ordering::SeqCst);
        let err = h
            .creator
            .create(Some("tok"), tip(2), None, &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateSessionError::BelowMinimum { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn callers_must_be_authenticated() {
        let h = harness();
        for token in [None, Some("nope")] {
            let err = h
                .creator
                .create(token, tip(25), None, &settings())
                .await
                .unwrap_err();
            assert!(matches!(err, CreateSessionError::Unauthenticated));
        }
        h.auth.unavailable.store(true, Ordering::SeqCst);
        let err = h
            .creator
            .create(Some("tok"), tip(25), None, &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateSessionError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn amount_bounds_and_key_format_are_checked() {
        let h = harness();
        h.auth.issue("tok");
        let err = h
            .creator
            .create(Some("tok"), tip(20_000), None, &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateSessionError::InvalidAmount(_)));

        let err = h
            .creator
            .create(Some("tok"), tip(25), Some("bad key"), &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateSessionError::InvalidIdempotencyKey));
    }

    #[tokio::test]
    async fn keys_do_not_collide_across_users() {
        let h = harness();
        h.auth.issue("alice");
        h.auth.issue("bob");
        let a = h
            .creator
            .create(Some("alice"), tip(25), Some("shared"), &settings())
            .await
            .unwrap();
        let b = h
            .creator
            .create(Some("bob"), tip(25), Some("shared"), &settings())
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(h.gateway.created_count(), 2);
    }

    #[tokio::test]
    async fn failed_attach_keeps_the_claim_and_the_processor_payment() {
        let h = harness();
        h.auth.issue("tok");
        h.flaky.attach_failures.store(1, Ordering::SeqCst);

        let err = h
            .creator
            .create(Some("tok"), tip(25), Some("key-1"), &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateSessionError::Database(_)));
        assert!(err.is_retryable());
        assert_eq!(h.store.session_count(), 1);

        let session = h
            .creator
            .create(Some("tok"), tip(25), Some("key-1"), &settings())
            .await
            .unwrap();
        assert_eq!(h.gateway.created_count(), 1);
        assert_eq!(
            session.processor_payment_id.as_deref(),
            Some(FakeGateway::payment_id(0).as_str())
        );
        assert_eq!(h.store.session_count(), 1);

        let again = h
            .creator
            .create(Some("tok"), tip(25), Some("key-1"), &settings())
            .await
            .unwrap();
        assert_eq!(again.id, session.id);
        assert_eq!(h.gateway.created_count(), 1);
    }

    #[tokio::test]
    async fn abandoned_claim_is_taken_over_after_the_payment_window() {
        let h = harness();
        let user_id = h.auth.issue("tok");
        let now = h.clock.now_primitive();
        let stranded = NewSessionClaim {
            id: Uuid::now_v7(),
            user_id,
            idempotency_key: "key-1".to_owned(),
            payment_type: PaymentType::Tip,
            metadata: tip(25).metadata,
            usd_amount: Decimal::new(25, 0),
            pay_currency: CryptoCurrency::Eth,
            created_at: now,
            expires_at: now + time::Duration::minutes(30),
        };
        h.store.claim_session(stranded.clone()).await.unwrap();

        let err = h
            .creator
            .create(Some("tok"), tip(25), Some("key-1"), &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, CreateSessionError::SessionInFlight));

        h.clock.advance(time::Duration::minutes(31));
        let session = h
            .creator
            .create(Some("tok"), tip(25), Some("key-1"), &settings())
            .await
            .unwrap();
        assert_ne!(session.id, stranded.id);
        assert!(session.pay_address.is_some());
        assert_eq!(h.gateway.created_count(), 1);
        assert_eq!(h.store.session_count(), 1);
    }
}
