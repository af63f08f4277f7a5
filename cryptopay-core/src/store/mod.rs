//! Storage seams for the session creator, the reconciler and the
//! dead-letter retrier.
//!
//! [`DatabaseProcessor`] implements both traits on top of the SQL commands
//! in [`crate::entities`]. `MemoryStore` (behind `test-util`) implements
//! them in process with the same transition rules.

#[cfg(any(test, feature = "test-util"))]
mod memory;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryStore;

use async_trait::async_trait;
use kanau::processor::Processor;
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::entities::dead_letters::{
    DeadLetter, DeleteDeadLetter, GetDueDeadLetters, InsertDeadLetter, NewDeadLetter,
    RescheduleDeadLetter,
};
use crate::entities::payment_sessions::{
    ApplyPaymentStatus, AttachProcessorPayment, ClaimOutcome, GetSessionById, InsertSessionClaim,
    NewSessionClaim, PaymentSession, PaymentStatusUpdate, ProcessorAttachment,
    ReleaseSessionClaim, StatusTransition,
};
use crate::entities::payouts::{
    ApplyPayoutStatus, InsertPayoutRequest, PayoutRequest, PayoutStatusUpdate, PayoutTransition,
};
use crate::framework::DatabaseProcessor;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Reserve the claim's idempotency key, or return the session holding it.
    async fn claim_session(&self, claim: NewSessionClaim) -> Result<ClaimOutcome, sqlx::Error>;

    async fn attach_processor_payment(
        &self,
        attachment: ProcessorAttachment,
    ) -> Result<Option<PaymentSession>, sqlx::Error>;

    /// Delete a claim that never reached the processor.
    async fn release_claim(&self, session_id: Uuid) -> Result<bool, sqlx::Error>;

    async fn session(&self, id: Uuid) -> Result<Option<PaymentSession>, sqlx::Error>;

    /// The authoritative transition. Atomic with respect to concurrent
    /// updates for the same payment.
    async fn apply_payment_status(
        &self,
        update: PaymentStatusUpdate,
    ) -> Result<StatusTransition, sqlx::Error>;

    /// Store a new withdrawal. `false` when the id is already recorded.
    async fn record_payout(&self, payout: PayoutRequest) -> Result<bool, sqlx::Error>;

    async fn apply_payout_status(
        &self,
        update: PayoutStatusUpdate,
    ) -> Result<PayoutTransition, sqlx::Error>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn enqueue(&self, letter: NewDeadLetter) -> Result<i64, sqlx::Error>;

    async fn due(
        &self,
        now: PrimitiveDateTime,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<DeadLetter>, sqlx::Error>;

    async fn resolve(&self, id: i64) -> Result<bool, sqlx::Error>;

    async fn reschedule(
        &self,
        id: i64,
        attempts: i32,
        next_attempt_at: PrimitiveDateTime,
        last_error: String,
    ) -> Result<(), sqlx::Error>;
}

#[async_trait]
impl PaymentStore for DatabaseProcessor {
    async fn claim_session(&self, claim: NewSessionClaim) -> Result<ClaimOutcome, sqlx::Error> {
        self.process(InsertSessionClaim { claim }).await
    }

    async fn attach_processor_payment(
        &self,
        attachment: ProcessorAttachment,
    ) -> Result<Option<PaymentSession>, sqlx::Error> {
        self.process(AttachProcessorPayment { attachment }).await
    }

    async fn release_claim(&self, session_id: Uuid) -> Result<bool, sqlx::Error> {
        self.process(ReleaseSessionClaim { session_id }).await
    }

    async fn session(&self, id: Uuid) -> Result<Option<PaymentSession>, sqlx::Error> {
        self.process(GetSessionById { id }).await
    }

    async fn apply_payment_status(
        &self,
        update: PaymentStatusUpdate,
    ) -> Result<StatusTransition, sqlx::Error> {
        self.process(ApplyPaymentStatus { update }).await
    }

    async fn record_payout(&self, payout: PayoutRequest) -> Result<bool, sqlx::Error> {
        self.process(InsertPayoutRequest { payout }).await
    }

    async fn apply_payout_status(
        &self,
        update: PayoutStatusUpdate,
    ) -> Result<PayoutTransition, sqlx::Error> {
        self.process(ApplyPayoutStatus { update }).await
    }
}

#[async_trait]
impl DeadLetterStore for DatabaseProcessor {
    async fn enqueue(&self, letter: NewDeadLetter) -> Result<i64, sqlx::Error> {
        self.process(InsertDeadLetter { letter }).await
    }

    async fn due(
        &self,
        now: PrimitiveDateTime,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<DeadLetter>, sqlx::Error> {
        self.process(GetDueDeadLetters {
            now,
            max_attempts,
            limit,
        })
        .await
    }

    async fn resolve(&self, id: i64) -> Result<bool, sqlx::Error> {
        self.process(DeleteDeadLetter { id }).await
    }

    async fn reschedule(
        &self,
        id: i64,
        attempts: i32,
        next_attempt_at: PrimitiveDateTime,
        last_error: String,
    ) -> Result<(), sqlx::Error> {
        self.process(RescheduleDeadLetter {
            id,
            attempts,
            next_attempt_at,
            last_error,
        })
        .await
    }
}
