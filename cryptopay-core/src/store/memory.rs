//! In-process store with the same transition rules as the SQL commands.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use cryptopay_sdk::objects::ApplyOutcome;
use time::PrimitiveDateTime;
use uuid::Uuid;

use super::{DeadLetterStore, PaymentStore};
use crate::entities::dead_letters::{DeadLetter, NewDeadLetter};
use crate::entities::payment_sessions::{
    ClaimOutcome, NewSessionClaim, PaymentSession, PaymentStatusUpdate, ProcessorAttachment,
    StatusPlan, StatusTransition, plan_status_change,
};
use crate::entities::payouts::{
    PayoutRequest, PayoutStatusUpdate, PayoutTransition, plan_payout_change,
};

#[derive(Debug, Default)]
struct MemoryTables {
    sessions: HashMap<Uuid, PaymentSession>,
    keys: HashMap<(Uuid, String), Uuid>,
    by_processor_id: HashMap<String, Uuid>,
    grants: HashMap<Uuid, PrimitiveDateTime>,
    payouts: HashMap<String, PayoutRequest>,
    dead_letters: Vec<DeadLetter>,
    next_dead_letter_id: i64,
}

/// In-process store. Every operation runs under one mutex, which gives the
/// same atomicity the row locks give in Postgres.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails as if the database were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, MemoryTables>, sqlx::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut);
        }
        Ok(match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    /// Number of entitlement grants recorded for `session_id` (0 or 1).
    pub fn grant_count(&self, session_id: Uuid) -> usize {
        self.tables()
            .map(|t| usize::from(t.grants.contains_key(&session_id)))
            .unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.tables().map(|t| t.sessions.len()).unwrap_or(0)
    }

    pub fn payout(&self, withdrawal_id: &str) -> Option<PayoutRequest> {
        self.tables()
            .ok()
            .and_then(|t| t.payouts.get(withdrawal_id).cloned())
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.tables()
            .map(|t| t.dead_letters.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn claim_session(&self, claim: NewSessionClaim) -> Result<ClaimOutcome, sqlx::Error> {
        let mut tables = self.tables()?;
        let key = (claim.user_id, claim.idempotency_key.clone());
        if let Some(existing) = tables.keys.get(&key).and_then(|id| tables.sessions.get(id)) {
            return Ok(ClaimOutcome::Existing(existing.clone()));
        }
        let session = claim.into_session();
        tables.keys.insert(key, session.id);
        tables.sessions.insert(session.id, session.clone());
        Ok(ClaimOutcome::Claimed(session))
    }

    async fn attach_processor_payment(
        &self,
        attachment: ProcessorAttachment,
    ) -> Result<Option<PaymentSession>, sqlx::Error> {
        let mut tables = self.tables()?;
        if tables
            .by_processor_id
            .contains_key(&attachment.processor_payment_id)
        {
            return Err(sqlx::Error::Protocol(format!(
                "duplicate processor_payment_id {}",
                attachment.processor_payment_id
            )));
        }
        let Some(session) = tables.sessions.get_mut(&attachment.session_id) else {
            return Ok(None);
        };
        if session.processor_payment_id.is_some() {
            return Ok(None);
        }
        session.processor_payment_id = Some(attachment.processor_payment_id.clone());
        session.pay_address = Some(attachment.pay_address);
        session.pay_amount = Some(attachment.pay_amount);
        session.status = attachment.status;
        session.expires_at = attachment.expires_at;
        session.updated_at = attachment.updated_at;
        let session = session.clone();
        tables
            .by_processor_id
            .insert(attachment.processor_payment_id, session.id);
        Ok(Some(session))
    }

    async fn release_claim(&self, session_id: Uuid) -> Result<bool, sqlx::Error> {
        let mut tables = self.tables()?;
        let releasable = tables
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.processor_payment_id.is_none());
        if !releasable {
            return Ok(false);
        }
        if let Some(session) = tables.sessions.remove(&session_id) {
            tables
                .keys
                .remove(&(session.user_id, session.idempotency_key));
        }
        Ok(true)
    }

    async fn session(&self, id: Uuid) -> Result<Option<PaymentSession>, sqlx::Error> {
        Ok(self.tables()?.sessions.get(&id).cloned())
    }

    async fn apply_payment_status(
        &self,
        update: PaymentStatusUpdate,
    ) -> Result<StatusTransition, sqlx::Error> {
        let mut tables = self.tables()?;
        let Some(id) = tables
            .by_processor_id
            .get(&update.processor_payment_id)
            .copied()
        else {
            return Ok(StatusTransition::not_found());
        };
        let Some(session) = tables.sessions.get_mut(&id) else {
            return Ok(StatusTransition::not_found());
        };

        let claim_processed =
            match plan_status_change(session.status, session.is_processed, update.status) {
                StatusPlan::Apply { claim_processed } => claim_processed,
                StatusPlan::AlreadyApplied => {
                    return Ok(StatusTransition {
                        outcome: ApplyOutcome::AlreadyApplied,
                        session: Some(session.clone()),
                        entitlement_granted: false,
                    });
                }
                StatusPlan::Stale => {
                    return Ok(StatusTransition {
                        outcome: ApplyOutcome::StaleIgnored,
                        session: Some(session.clone()),
                        entitlement_granted: false,
                    });
                }
            };

        session.status = update.status;
        if update.tx_hash.is_some() {
            session.tx_hash = update.tx_hash;
        }
        if update.actually_paid.is_some() {
            session.actually_paid = update.actually_paid;
        }
        if update.provider_data.is_some() {
            session.provider_data = update.provider_data;
        }
        session.updated_at = update.at;
        let mut entitlement_granted = false;
        if claim_processed && !session.is_processed {
            session.is_processed = true;
            entitlement_granted = true;
        }
        let session = session.clone();
        if entitlement_granted {
            tables.grants.entry(session.id).or_insert(update.at);
        }

        Ok(StatusTransition {
            outcome: ApplyOutcome::Applied,
            session: Some(session),
            entitlement_granted,
        })
    }

    async fn record_payout(&self, payout: PayoutRequest) -> Result<bool, sqlx::Error> {
        let mut tables = self.tables()?;
        if tables.payouts.contains_key(&payout.withdrawal_id) {
            return Ok(false);
        }
        tables.payouts.insert(payout.withdrawal_id.clone(), payout);
        Ok(true)
    }

    async fn apply_payout_status(
        &self,
        update: PayoutStatusUpdate,
    ) -> Result<PayoutTransition, sqlx::Error> {
        let mut tables = self.tables()?;
        let Some(payout) = tables.payouts.get_mut(&update.withdrawal_id) else {
            return Ok(PayoutTransition {
                outcome: ApplyOutcome::NotFound,
                payout: None,
            });
        };
        let outcome = match plan_payout_change(payout.status, update.status) {
            StatusPlan::Apply { .. } => {
                payout.status = update.status;
                if update.tx_hash.is_some() {
                    payout.tx_hash = update.tx_hash;
                }
                payout.updated_at = update.at;
                ApplyOutcome::Applied
            }
            StatusPlan::AlreadyApplied => ApplyOutcome::AlreadyApplied,
            StatusPlan::Stale => ApplyOutcome::StaleIgnored,
        };
        Ok(PayoutTransition {
            outcome,
            payout: Some(payout.clone()),
        })
    }
}

#[async_trait]
impl DeadLetterStore for MemoryStore {
    async fn enqueue(&self, letter: NewDeadLetter) -> Result<i64, sqlx::Error> {
        let mut tables = self.tables()?;
        tables.next_dead_letter_id += 1;
        let id = tables.next_dead_letter_id;
        tables.dead_letters.push(DeadLetter {
            id,
            kind: letter.kind,
            external_id: letter.external_id,
            status: letter.status,
            tx_hash: letter.tx_hash,
            payload: letter.payload,
            attempts: 0,
            next_attempt_at: letter.at,
            last_error: letter.last_error,
            created_at: letter.at,
        });
        Ok(id)
    }

    async fn due(
        &self,
        now: PrimitiveDateTime,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<DeadLetter>, sqlx::Error> {
        let tables = self.tables()?;
        let mut due: Vec<DeadLetter> = tables
            .dead_letters
            .iter()
            .filter(|l| l.attempts < max_attempts && l.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|l| l.next_attempt_at);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn resolve(&self, id: i64) -> Result<bool, sqlx::Error> {
        let mut tables = self.tables()?;
        let before = tables.dead_letters.len();
        tables.dead_letters.retain(|l| l.id != id);
        Ok(tables.dead_letters.len() != before)
    }

    async fn reschedule(
        &self,
        id: i64,
        attempts: i32,
        next_attempt_at: PrimitiveDateTime,
        last_error: String,
    ) -> Result<(), sqlx::Error> {
        let mut tables = self.tables()?;
        if let Some(letter) = tables.dead_letters.iter_mut().find(|l| l.id == id) {
            letter.attempts = attempts;
            letter.next_attempt_at = next_attempt_at;
            letter.last_error = last_error;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptopay_sdk::currency::CryptoCurrency;
    use cryptopay_sdk::objects::{PaymentMetadata, PaymentStatus, PaymentType};
    use rust_decimal::Decimal;
    use time::macros::datetime;

    fn claim(user_id: Uuid, key: &str) -> NewSessionClaim {
        NewSessionClaim {
            id: Uuid::new_v4(),
            user_id,
            idempotency_key: key.to_owned(),
            payment_type: PaymentType::Tip,
            metadata: PaymentMetadata::new(),
            usd_amount: Decimal::new(10, 0),
            pay_currency: CryptoCurrency::Usdt,
            created_at: datetime!(2024-01-01 00:00),
            expires_at: datetime!(2024-01-01 00:30),
        }
    }

    async fn attached(store: &MemoryStore, processor_id: &str) -> PaymentSession {
        let ClaimOutcome::Claimed(session) = store
            .claim_session(claim(Uuid::new_v4(), processor_id))
            .await
            .unwrap()
        else {
            panic!("expected a fresh claim");
        };
        store
            .attach_processor_payment(ProcessorAttachment {
                session_id: session.id,
                processor_payment_id: processor_id.to_owned(),
                pay_address: "T-addr".to_owned(),
                pay_amount: Decimal::new(10, 0),
                status: PaymentStatus::Waiting,
                expires_at: datetime!(2024-01-01 00:20),
                updated_at: datetime!(2024-01-01 00:00),
            })
            .await
            .unwrap()
            .unwrap()
    }

    fn update(processor_id: &str, status: PaymentStatus) -> PaymentStatusUpdate {
        PaymentStatusUpdate {
            processor_payment_id: processor_id.to_owned(),
            status,
            tx_hash: None,
            actually_paid: None,
            provider_data: None,
            at: datetime!(2024-01-01 00:05),
        }
    }

    #[tokio::test]
    async fn keys_are_scoped_per_user() {
        let store = MemoryStore::new();
        let alice = Uuid::new_v4();
        let first = store.claim_session(claim(alice, "k")).await.unwrap();
        let again = store.claim_session(claim(alice, "k")).await.unwrap();
        let other = store.claim_session(claim(Uuid::new_v4(), "k")).await.unwrap();

        let (ClaimOutcome::Claimed(a), ClaimOutcome::Existing(b)) = (first, again) else {
            panic!("second claim should find the first");
        };
        assert_eq!(a.id, b.id);
        assert!(matches!(other, ClaimOutcome::Claimed(_)));
    }

    #[tokio::test]
    async fn released_claims_free_the_key() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let ClaimOutcome::Claimed(session) = store.claim_session(claim(user, "k")).await.unwrap()
        else {
            panic!("expected a fresh claim");
        };
        assert!(store.release_claim(session.id).await.unwrap());
        assert!(matches!(
            store.claim_session(claim(user, "k")).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn attached_sessions_cannot_be_released() {
        let store = MemoryStore::new();
        let session = attached(&store, "np-1").await;
        assert!(!store.release_claim(session.id).await.unwrap());
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn finished_grants_exactly_once() {
        let store = MemoryStore::new();
        let session = attached(&store, "np-2").await;

        let first = store
            .apply_payment_status(update("np-2", PaymentStatus::Finished))
            .await
            .unwrap();
        let second = store
            .apply_payment_status(update("np-2", PaymentStatus::Finished))
            .await
            .unwrap();

        assert_eq!(first.outcome, ApplyOutcome::Applied);
        assert!(first.entitlement_granted);
        assert_eq!(second.outcome, ApplyOutcome::AlreadyApplied);
        assert!(!second.entitlement_granted);
        assert_eq!(store.grant_count(session.id), 1);
        assert!(second.session.unwrap().is_processed);
    }

    #[tokio::test]
    async fn late_updates_after_terminal_are_stale() {
        let store = MemoryStore::new();
        attached(&store, "np-3").await;
        store
            .apply_payment_status(update("np-3", PaymentStatus::Expired))
            .await
            .unwrap();
        let late = store
            .apply_payment_status(update("np-3", PaymentStatus::Finished))
            .await
            .unwrap();
        assert_eq!(late.outcome, ApplyOutcome::StaleIgnored);
        assert_eq!(late.session.unwrap().status, PaymentStatus::Expired);
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found() {
        let store = MemoryStore::new();
        let result = store
            .apply_payment_status(update("missing", PaymentStatus::Waiting))
            .await
            .unwrap();
        assert_eq!(result, StatusTransition::not_found());
    }

    #[tokio::test]
    async fn failing_store_reports_errors() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(store.session(Uuid::new_v4()).await.is_err());
        store.set_failing(false);
        assert!(store.session(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_dead_letters_respect_schedule_and_attempts() {
        let store = MemoryStore::new();
        let id = store
            .enqueue(NewDeadLetter {
                kind: crate::entities::dead_letters::DeadLetterKind::Payment,
                external_id: "np-9".to_owned(),
                status: "finished".to_owned(),
                tx_hash: None,
                payload: serde_json::json!({"payment_id": "np-9"}),
                last_error: "pool timed out".to_owned(),
                at: datetime!(2024-01-01 00:00),
            })
            .await
            .unwrap();

        let now = datetime!(2024-01-01 00:01);
        assert_eq!(store.due(now, 11, 10).await.unwrap().len(), 1);
        store
            .reschedule(id, 1, datetime!(2024-01-01 00:02), "again".to_owned())
            .await
            .unwrap();
        assert!(store.due(now, 11, 10).await.unwrap().is_empty());
        assert!(store.due(datetime!(2024-01-01 00:02), 1, 10).await.unwrap().is_empty());
        assert!(store.resolve(id).await.unwrap());
        assert!(store.dead_letters().is_empty());
    }
}
