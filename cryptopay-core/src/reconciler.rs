//! Authoritative handling of processor callbacks.
//!
//! Every callback is parsed, verified against the shared secret and only
//! then applied. Verification fails closed. Once a callback is verified the
//! processor always receives a 2xx: a storage failure is queued as a dead
//! letter and retried by [`crate::processors::DeadLetterRetrier`] instead of
//! being bounced back to the processor.

use std::sync::Arc;

use cryptopay_sdk::objects::{
    ApplyOutcome, MalformedNotification, PaymentNotification, PaymentStatus, PayoutNotification,
    PayoutStatus, WebhookAck,
};
use cryptopay_sdk::signature::{self, SignatureError};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, error, info, warn};

use crate::entities::dead_letters::{DeadLetter, DeadLetterKind, NewDeadLetter};
use crate::entities::payment_sessions::{PaymentStatusUpdate, StatusTransition};
use crate::entities::payouts::PayoutStatusUpdate;
use crate::events::{PaymentStatusChanged, StatusEventSender};
use crate::store::{DeadLetterStore, PaymentStore};
use crate::utils::{Clock, to_primitive};

/// Reasons a callback is rejected outright.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("callback body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("callback signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("malformed callback: {0}")]
    Malformed(#[from] MalformedNotification),
}

impl ReconcileError {
    /// Whether the processor should be told to stop (403) rather than that
    /// the request was malformed (400).
    pub fn is_forbidden(&self) -> bool {
        matches!(self, ReconcileError::Signature(_))
    }
}

/// A dead letter could not be replayed.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The stored payload can never apply; retrying is pointless.
    #[error("stored callback cannot be applied: {0}")]
    Unreplayable(String),
}

pub struct WebhookReconciler {
    store: Arc<dyn PaymentStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    events: StatusEventSender,
    clock: Arc<dyn Clock>,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        events: StatusEventSender,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dead_letters,
            events,
            clock,
        }
    }

    /// Handle `POST /payments/webhook`.
    pub async fn handle_payment(
        &self,
        secret: Option<&[u8]>,
        body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<WebhookAck, ReconcileError> {
        let value = verified_body(secret, body, signature_header)?;
        let notification = PaymentNotification::from_value(&value)?;

        let Ok(status) = notification.payment_status.parse::<PaymentStatus>() else {
            warn!(
                processor_payment_id = %notification.payment_id,
                status = %notification.payment_status,
                "Ignoring payment callback with unrecognised status"
            );
            return Ok(WebhookAck {
                ok: true,
                outcome: None,
                warning: Some(format!(
                    "unrecognised status {:?}",
                    notification.payment_status
                )),
            });
        };

        let update = self.payment_update(&notification, status, &value);
        match self.store.apply_payment_status(update).await {
            Ok(transition) => {
                self.record_payment(&notification.payment_id, status, &transition);
                Ok(ack(transition.outcome))
            }
            Err(e) => {
                self.dead_letter(NewDeadLetter {
                    kind: DeadLetterKind::Payment,
                    external_id: notification.payment_id.clone(),
                    status: notification.payment_status.clone(),
                    tx_hash: notification.tx_hash.clone(),
                    payload: value,
                    last_error: e.to_string(),
                    at: self.clock.now_primitive(),
                })
                .await;
                Ok(queued())
            }
        }
    }

    /// Handle `POST /payments/payout-webhook`.
    pub async fn handle_payout(
        &self,
        secret: Option<&[u8]>,
        body: &[u8],
        signature_header: Option<&str>,
    ) -> Result<WebhookAck, ReconcileError> {
        let value = verified_body(secret, body, signature_header)?;
        let notification = PayoutNotification::from_value(&value)?;

        let Ok(status) = notification.status.parse::<PayoutStatus>() else {
            warn!(
                withdrawal_id = %notification.withdrawal_id,
                status = %notification.status,
                "Ignoring payout callback with unrecognised status"
            );
            return Ok(WebhookAck {
                ok: true,
                outcome: None,
                warning: Some(format!("unrecognised status {:?}", notification.status)),
            });
        };

        let update = self.payout_update(&notification, status);
        match self.store.apply_payout_status(update).await {
            Ok(transition) => {
                log_payout(&notification.withdrawal_id, status, transition.outcome);
                Ok(ack(transition.outcome))
            }
            Err(e) => {
                self.dead_letter(NewDeadLetter {
                    kind: DeadLetterKind::Payout,
                    external_id: notification.withdrawal_id.clone(),
                    status: notification.status.clone(),
                    tx_hash: notification.tx_hash.clone(),
                    payload: value,
                    last_error: e.to_string(),
                    at: self.clock.now_primitive(),
                })
                .await;
                Ok(queued())
            }
        }
    }

    /// Apply a stored callback again. Signature was checked on receipt.
    pub async fn replay(&self, letter: &DeadLetter) -> Result<ApplyOutcome, ReplayError> {
        match letter.kind {
            DeadLetterKind::Payment => {
                let notification = PaymentNotification::from_value(&letter.payload)
                    .map_err(|e| ReplayError::Unreplayable(e.to_string()))?;
                let status = notification
                    .payment_status
                    .parse::<PaymentStatus>()
                    .map_err(|e| ReplayError::Unreplayable(e.to_string()))?;
                let transition = self
                    .store
                    .apply_payment_status(self.payment_update(&notification, status, &letter.payload))
                    .await?;
                self.record_payment(&notification.payment_id, status, &transition);
                Ok(transition.outcome)
            }
            DeadLetterKind::Payout => {
                let notification = PayoutNotification::from_value(&letter.payload)
                    .map_err(|e| ReplayError::Unreplayable(e.to_string()))?;
                let status = notification
                    .status
                    .parse::<PayoutStatus>()
                    .map_err(|e| ReplayError::Unreplayable(e.to_string()))?;
                let transition = self
                    .store
                    .apply_payout_status(self.payout_update(&notification, status))
                    .await?;
                log_payout(&notification.withdrawal_id, status, transition.outcome);
                Ok(transition.outcome)
            }
        }
    }

    fn payment_update(
        &self,
        notification: &PaymentNotification,
        status: PaymentStatus,
        raw: &Value,
    ) -> PaymentStatusUpdate {
        let now = self.clock.now();
        let received_at = now.format(&Rfc3339).unwrap_or_default();
        PaymentStatusUpdate {
            processor_payment_id: notification.payment_id.clone(),
            status,
            tx_hash: notification.tx_hash.clone(),
            actually_paid: notification.actually_paid,
            provider_data: Some(notification.provider_data(raw, received_at)),
            at: to_primitive(now),
        }
    }

    fn payout_update(
        &self,
        notification: &PayoutNotification,
        status: PayoutStatus,
    ) -> PayoutStatusUpdate {
        PayoutStatusUpdate {
            withdrawal_id: notification.withdrawal_id.clone(),
            status,
            tx_hash: notification.tx_hash.clone(),
            at: self.clock.now_primitive(),
        }
    }

    /// Log the outcome and broadcast applied transitions.
    fn record_payment(
        &self,
        processor_payment_id: &str,
        status: PaymentStatus,
        transition: &StatusTransition,
    ) {
        match transition.outcome {
            ApplyOutcome::Applied => {
                info!(
                    processor_payment_id,
                    status = %status,
                    entitlement_granted = transition.entitlement_granted,
                    "Payment status applied"
                );
                if let Some(session) = &transition.session {
                    // No subscribers is not an error.
                    let _ = self.events.send(PaymentStatusChanged {
                        user_id: session.user_id,
                        session: session.to_response(),
                    });
                }
            }
            ApplyOutcome::AlreadyApplied => {
                debug!(processor_payment_id, status = %status, "Duplicate payment callback");
            }
            ApplyOutcome::StaleIgnored => {
                info!(
                    processor_payment_id,
                    status = %status,
                    current = ?transition.session.as_ref().map(|s| s.status),
                    "Ignoring out-of-order payment callback"
                );
            }
            ApplyOutcome::NotFound => {
                warn!(processor_payment_id, status = %status, "Payment callback for unknown payment");
            }
        }
    }

    async fn dead_letter(&self, letter: NewDeadLetter) {
        error!(
            kind = %letter.kind,
            external_id = %letter.external_id,
            status = %letter.status,
            error = %letter.last_error,
            needs_investigation = true,
            "Failed to apply verified callback, queueing for retry"
        );
        let kind = letter.kind;
        let external_id = letter.external_id.clone();
        let payload = letter.payload.to_string();
        if let Err(e) = self.dead_letters.enqueue(letter).await {
            error!(
                kind = %kind,
                external_id = %external_id,
                error = %e,
                payload = %payload,
                needs_investigation = true,
                "Failed to queue callback for retry; payload is only in this log"
            );
        }
    }
}

fn verified_body(
    secret: Option<&[u8]>,
    body: &[u8],
    signature_header: Option<&str>,
) -> Result<Value, ReconcileError> {
    let value: Value = serde_json::from_slice(body)?;
    if let Err(e) = signature::verify(secret, &value, signature_header) {
        match e {
            SignatureError::SecretNotConfigured => {
                error!("Callback secret is not configured, rejecting callback")
            }
            other => warn!(error = %other, "Rejecting callback with bad signature"),
        }
        return Err(e.into());
    }
    Ok(value)
}

fn log_payout(withdrawal_id: &str, status: PayoutStatus, outcome: ApplyOutcome) {
    match outcome {
        ApplyOutcome::Applied => info!(withdrawal_id, status = %status, "Payout status applied"),
        ApplyOutcome::NotFound => {
            warn!(withdrawal_id, status = %status, "Payout callback for unknown withdrawal")
        }
        other => debug!(withdrawal_id, status = %status, outcome = ?other, "Payout callback ignored"),
    }
}

fn ack(outcome: ApplyOutcome) -> WebhookAck {
    WebhookAck {
        ok: true,
        outcome: Some(outcome),
        warning: None,
    }
}

fn queued() -> WebhookAck {
    WebhookAck {
        ok: true,
        outcome: None,
        warning: Some("storage unavailable, queued for retry".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::payment_sessions::{ClaimOutcome, NewSessionClaim, ProcessorAttachment};
    use crate::entities::payouts::PayoutRequest;
    use crate::events::status_event_channel;
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;
    use cryptopay_sdk::currency::CryptoCurrency;
    use cryptopay_sdk::objects::{PaymentMetadata, PaymentType};
    use rust_decimal::Decimal;
    use serde_json::json;
    use time::macros::datetime;
    use uuid::Uuid;

    const SECRET: &[u8] = b"test-ipn-secret";

    struct Harness {
        reconciler: WebhookReconciler,
        store: Arc<MemoryStore>,
        events: StatusEventSender,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let (events, _) = status_event_channel();
        let reconciler = WebhookReconciler::new(
            store.clone(),
            store.clone(),
            events.clone(),
            Arc::new(ManualClock::default()),
        );
        Harness {
            reconciler,
            store,
            events,
        }
    }

    async fn seed_session(store: &MemoryStore, processor_id: &str) -> Uuid {
        let claim = NewSessionClaim {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            idempotency_key: processor_id.to_owned(),
            payment_type: PaymentType::Subscription,
            metadata: PaymentMetadata::new(),
            usd_amount: Decimal::new(10, 0),
            pay_currency: CryptoCurrency::Btc,
            created_at: datetime!(2024-01-01 00:00),
            expires_at: datetime!(2024-01-01 00:30),
        };
        let ClaimOutcome::Claimed(session) = store.claim_session(claim).await.unwrap() else {
            panic!("expected a fresh claim");
        };
        store
            .attach_processor_payment(ProcessorAttachment {
                session_id: session.id,
                processor_payment_id: processor_id.to_owned(),
                pay_address: "bc1q".to_owned(),
                pay_amount: Decimal::new(1, 4),
                status: PaymentStatus::Waiting,
                expires_at: datetime!(2024-01-01 00:30),
                updated_at: datetime!(2024-01-01 00:00),
            })
            .await
            .unwrap();
        session.id
    }

    fn signed(body: &Value) -> (Vec<u8>, String) {
        (
            serde_json::to_vec(body).unwrap(),
            signature::sign(body, SECRET),
        )
    }

    #[tokio::test]
    async fn missing_secret_rejects_everything() {
        let h = harness();
        let (body, sig) = signed(&json!({"payment_id": "1", "payment_status": "finished"}));
        let err = h
            .reconciler
            .handle_payment(None, &body, Some(&sig))
            .await
            .unwrap_err();
        assert!(err.is_forbidden());
    }

    #[tokio::test]
    async fn bad_signature_is_forbidden_and_bad_json_is_not() {
        let h = harness();
        let (body, _) = signed(&json!({"payment_id": "1", "payment_status": "finished"}));
        let err = h
            .reconciler
            .handle_payment(Some(SECRET), &body, Some(&"ab".repeat(64)))
            .await
            .unwrap_err();
        assert!(err.is_forbidden());

        let err = h
            .reconciler
            .handle_payment(Some(SECRET), b"{not json", Some("00"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidJson(_)));

        let (body, sig) = signed(&json!({"payment_status": "finished"}));
        let err = h
            .reconciler
            .handle_payment(Some(SECRET), &body, Some(&sig))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Malformed(_)));
        assert!(!err.is_forbidden());
    }

    #[tokio::test]
    async fn duplicate_finished_callbacks_grant_once() {
        let h = harness();
        let session_id = seed_session(&h.store, "5001").await;
        let mut rx = h.events.subscribe();
        let (body, sig) = signed(&json!({
            "payment_id": 5001,
            "payment_status": "finished",
            "actually_paid": 0.0001,
            "payin_hash": "0xfeed"
        }));

        let first = h
            .reconciler
            .handle_payment(Some(SECRET), &body, Some(&sig))
            .await
            .unwrap();
        let second = h
            .reconciler
            .handle_payment(Some(SECRET), &body, Some(&sig))
            .await
            .unwrap();

        assert_eq!(first.outcome, Some(ApplyOutcome::Applied));
        assert_eq!(second.outcome, Some(ApplyOutcome::AlreadyApplied));
        assert_eq!(h.store.grant_count(session_id), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), session_id);
        assert!(event.session.is_processed);
        assert_eq!(event.session.tx_hash.as_deref(), Some("0xfeed"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn out_of_order_callbacks_are_ignored() {
        let h = harness();
        seed_session(&h.store, "5002").await;
        for status in ["confirmed", "confirming"] {
            let (body, sig) = signed(&json!({"payment_id": "5002", "payment_status": status}));
            h.reconciler
                .handle_payment(Some(SECRET), &body, Some(&sig))
                .await
                .unwrap();
        }
        let (body, sig) = signed(&json!({"payment_id": "5002", "payment_status": "waiting"}));
        let ack = h
            .reconciler
            .handle_payment(Some(SECRET), &body, Some(&sig))
            .await
            .unwrap();
        assert_eq!(ack.outcome, Some(ApplyOutcome::StaleIgnored));
    }

    #[tokio::test]
    async fn unknown_status_and_unknown_payment_are_acknowledged() {
        let h = harness();
        let (body, sig) = signed(&json!({"payment_id": "9", "payment_status": "on_hold"}));
        let ack = h
            .reconciler
            .handle_payment(Some(SECRET), &body, Some(&sig))
            .await
            .unwrap();
        assert!(ack.ok);
        assert!(ack.warning.is_some());

        let (body, sig) = signed(&json!({"payment_id": "9", "payment_status": "waiting"}));
        let ack = h
            .reconciler
            .handle_payment(Some(SECRET), &body, Some(&sig))
            .await
            .unwrap();
        assert_eq!(ack.outcome, Some(ApplyOutcome::NotFound));
    }

    #[tokio::test]
    async fn storage_failure_is_still_acknowledged() {
        let h = harness();
        let session_id = seed_session(&h.store, "5003").await;
        let (body, sig) = signed(&json!({"payment_id": "5003", "payment_status": "finished"}));

        h.store.set_failing(true);
        let ack = h
            .reconciler
            .handle_payment(Some(SECRET), &body, Some(&sig))
            .await
            .unwrap();
        assert!(ack.ok);
        assert!(ack.warning.is_some());

        // The dead-letter table shares the failing store.
        h.store.set_failing(false);
        assert!(h.store.dead_letters().is_empty());
        assert_eq!(h.store.grant_count(session_id), 0);
    }

    #[tokio::test]
    async fn dead_letter_replay_applies_the_transition() {
        let store = Arc::new(MemoryStore::new());
        let session_id = seed_session(&store, "5004").await;
        let failing = Arc::new(MemoryStore::new());
        failing.set_failing(true);
        let (events, _) = status_event_channel();
        // Sessions live in a failing store; dead letters in a healthy one.
        let reconciler = WebhookReconciler::new(
            failing.clone(),
            store.clone(),
            events.clone(),
            Arc::new(ManualClock::default()),
        );
        let (body, sig) = signed(&json!({"payment_id": "5004", "payment_status": "finished"}));
        reconciler
            .handle_payment(Some(SECRET), &body, Some(&sig))
            .await
            .unwrap();

        let letters = store.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].external_id, "5004");
        assert_eq!(letters[0].kind, DeadLetterKind::Payment);

        let recovered = WebhookReconciler::new(
            store.clone(),
            store.clone(),
            events,
            Arc::new(ManualClock::default()),
        );
        let outcome = recovered.replay(&letters[0]).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(store.grant_count(session_id), 1);
        let replayed = store.session(session_id).await.unwrap().unwrap();
        let data = replayed.provider_data.unwrap();
        assert_eq!(data.payment_status, "finished");
        assert_eq!(data.raw_webhook["payment_id"], "5004");
        assert_eq!(
            recovered.replay(&letters[0]).await.unwrap(),
            ApplyOutcome::AlreadyApplied
        );
    }

    #[tokio::test]
    async fn payout_callbacks_update_withdrawals() {
        let h = harness();
        h.store
            .record_payout(PayoutRequest {
                withdrawal_id: "w-1".to_owned(),
                batch_withdrawal_id: None,
                currency: "usdttrc20".to_owned(),
                amount: Decimal::new(100, 0),
                address: None,
                requested_by: None,
                status: PayoutStatus::Waiting,
                tx_hash: None,
                created_at: datetime!(2024-01-01 00:00),
                updated_at: datetime!(2024-01-01 00:00),
            })
            .await
            .unwrap();
        let (body, sig) = signed(&json!({"id": "w-1", "status": "FINISHED", "hash": "0xabc"}));
        let ack = h
            .reconciler
            .handle_payout(Some(SECRET), &body, Some(&sig))
            .await
            .unwrap();
        assert_eq!(ack.outcome, Some(ApplyOutcome::Applied));
        let payout = h.store.payout("w-1").unwrap();
        assert_eq!(payout.status, PayoutStatus::Finished);
        assert_eq!(payout.tx_hash.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn javascript_signed_callback_is_applied_with_its_provider_data() {
        let h = harness();
        let id = seed_session(&h.store, "p-js").await;
        // Body and digest as produced by a JavaScript signer.
        let body = br#"{"payment_id":"p-js","payment_status":"finished","price_amount":25.0,"actually_paid":0.50,"outcome_amount":1e-7,"order_id":"tip_x","pay_amount":0.0001,"payin_hash":"0xjs"}"#;
        let sig = "5b70ca9a22329bcc3e57dcc085e3353c09ec8f4eab5345f8223db20906cbe8b0798bd348ff695ab8f9971c85c83bd89d7d16cea5738c9b8ad1d55228bc0bd535";

        let ack = h
            .reconciler
            .handle_payment(Some(SECRET), body, Some(sig))
            .await
            .unwrap();
        assert_eq!(ack.outcome, Some(ApplyOutcome::Applied));

        let session = h.store.session(id).await.unwrap().unwrap();
        let data = session.provider_data.unwrap();
        assert_eq!(data.payment_status, "finished");
        assert_eq!(data.actually_paid, Some(Decimal::new(5, 1)));
        assert_eq!(data.outcome_amount, Some(Decimal::new(1, 7)));
        assert_eq!(data.pay_amount, Some(Decimal::new(1, 4)));
        assert_eq!(data.order_id.as_deref(), Some("tip_x"));
        assert_eq!(data.ipn_received_at, "2024-01-01T00:00:00Z");
        assert_eq!(data.raw_webhook["price_amount"], json!(25.0));
    }
}
