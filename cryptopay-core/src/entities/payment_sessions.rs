use cryptopay_sdk::currency::CryptoCurrency;
use cryptopay_sdk::objects::{
    ApplyOutcome, CreatePaymentRequest, PaymentMetadata, PaymentSessionResponse, PaymentStatus,
    PaymentType, ProviderData,
};
use kanau::processor::Processor;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Postgres, Row};
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::entities::text_column;
use crate::framework::DatabaseProcessor;
use crate::utils::unix_seconds;

const SESSION_COLUMNS: &str = r#"
    id, user_id, idempotency_key, payment_type, payment_metadata, usd_amount,
    pay_currency, pay_amount, pay_address, processor_payment_id, status,
    tx_hash, actually_paid, provider_data, is_processed, created_at, updated_at,
    expires_at
"#;

/// The durable payment record.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub idempotency_key: String,
    pub payment_type: PaymentType,
    pub metadata: PaymentMetadata,
    pub usd_amount: Decimal,
    pub pay_currency: CryptoCurrency,
    pub pay_amount: Option<Decimal>,
    pub pay_address: Option<String>,
    /// Set once the processor accepted the payment.
    pub processor_payment_id: Option<String>,
    pub status: PaymentStatus,
    pub tx_hash: Option<String>,
    pub actually_paid: Option<Decimal>,
    /// What the last applied callback reported.
    pub provider_data: Option<ProviderData>,
    /// Entitlement applied. Only ever set together with `finished`.
    pub is_processed: bool,
    pub created_at: PrimitiveDateTime,
    pub updated_at: PrimitiveDateTime,
    pub expires_at: PrimitiveDateTime,
}

impl<'r> FromRow<'r, PgRow> for PaymentSession {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let sqlx::types::Json(metadata) =
            row.try_get::<sqlx::types::Json<PaymentMetadata>, _>("payment_metadata")?;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            payment_type: text_column(row, "payment_type", PaymentType::from_name)?,
            metadata,
            usd_amount: row.try_get("usd_amount")?,
            pay_currency: text_column(row, "pay_currency", CryptoCurrency::from_id)?,
            pay_amount: row.try_get("pay_amount")?,
            pay_address: row.try_get("pay_address")?,
            processor_payment_id: row.try_get("processor_payment_id")?,
            status: text_column(row, "status", |s| s.parse().ok())?,
            tx_hash: row.try_get("tx_hash")?,
            actually_paid: row.try_get("actually_paid")?,
            provider_data: row
                .try_get::<Option<sqlx::types::Json<ProviderData>>, _>("provider_data")?
                .map(|json| json.0),
            is_processed: row.try_get("is_processed")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

impl PaymentSession {
    /// Whether `request` describes the same purchase this session was
    /// created for.
    pub fn same_intent(&self, request: &CreatePaymentRequest) -> bool {
        self.usd_amount == request.usd_amount
            && self.pay_currency == request.crypto_currency
            && self.payment_type == request.payment_type
            && self.metadata == request.metadata
    }

    pub fn to_response(&self) -> PaymentSessionResponse {
        PaymentSessionResponse {
            id: self.id,
            pay_address: self.pay_address.clone(),
            pay_amount: self.pay_amount,
            pay_currency: self.pay_currency,
            usd_amount: self.usd_amount,
            status: self.status,
            payment_type: self.payment_type,
            created_at: unix_seconds(self.created_at),
            expires_at: unix_seconds(self.expires_at),
            tx_hash: self.tx_hash.clone(),
            is_processed: self.is_processed,
        }
    }
}

/// A session row reserved for an idempotency key before the processor is
/// called.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSessionClaim {
    pub id: Uuid,
    pub user_id: Uuid,
    pub idempotency_key: String,
    pub payment_type: PaymentType,
    pub metadata: PaymentMetadata,
    pub usd_amount: Decimal,
    pub pay_currency: CryptoCurrency,
    pub created_at: PrimitiveDateTime,
    /// Provisional; replaced by the processor's quote on attach.
    pub expires_at: PrimitiveDateTime,
}

impl NewSessionClaim {
    /// The row as stored right after claiming.
    pub fn into_session(self) -> PaymentSession {
        PaymentSession {
            id: self.id,
            user_id: self.user_id,
            idempotency_key: self.idempotency_key,
            payment_type: self.payment_type,
            metadata: self.metadata,
            usd_amount: self.usd_amount,
            pay_currency: self.pay_currency,
            pay_amount: None,
            pay_address: None,
            processor_payment_id: None,
            status: PaymentStatus::Created,
            tx_hash: None,
            actually_paid: None,
            provider_data: None,
            is_processed: false,
            created_at: self.created_at,
            updated_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The key was free; this caller owns the new row.
    Claimed(PaymentSession),
    /// A row for `(user_id, idempotency_key)` already exists.
    Existing(PaymentSession),
}

/// Processor data written onto a claimed session.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorAttachment {
    pub session_id: Uuid,
    pub processor_payment_id: String,
    pub pay_address: String,
    pub pay_amount: Decimal,
    pub status: PaymentStatus,
    pub expires_at: PrimitiveDateTime,
    pub updated_at: PrimitiveDateTime,
}

/// An authoritative status report for one processor payment.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentStatusUpdate {
    pub processor_payment_id: String,
    pub status: PaymentStatus,
    pub tx_hash: Option<String>,
    pub actually_paid: Option<Decimal>,
    pub provider_data: Option<ProviderData>,
    pub at: PrimitiveDateTime,
}

/// What an authoritative status update did.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub outcome: ApplyOutcome,
    /// The row after the update, absent for `NotFound`.
    pub session: Option<PaymentSession>,
    /// This update moved `is_processed` from false to true.
    pub entitlement_granted: bool,
}

impl StatusTransition {
    pub fn not_found() -> Self {
        Self {
            outcome: ApplyOutcome::NotFound,
            session: None,
            entitlement_granted: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPlan {
    Apply { claim_processed: bool },
    AlreadyApplied,
    Stale,
}

/// Decide what an incoming status does to a session currently at `current`.
///
/// Terminal rows never change status. `partially_paid` may arrive at any
/// point before a terminal status. Otherwise a status may only move forward
/// along [`PaymentStatus::rank`]. Any write that lands on `finished` claims
/// the processed flag if it is still clear.
pub fn plan_status_change(
    current: PaymentStatus,
    is_processed: bool,
    incoming: PaymentStatus,
) -> StatusPlan {
    if incoming == current {
        return if current == PaymentStatus::Finished && !is_processed {
            StatusPlan::Apply {
                claim_processed: true,
            }
        } else {
            StatusPlan::AlreadyApplied
        };
    }
    if current.is_terminal() {
        return StatusPlan::Stale;
    }
    if incoming != PaymentStatus::PartiallyPaid && incoming.rank() < current.rank() {
        return StatusPlan::Stale;
    }
    StatusPlan::Apply {
        claim_processed: incoming == PaymentStatus::Finished,
    }
}

impl PaymentSession {
    pub async fn lock_by_processor_id_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        processor_payment_id: &str,
    ) -> Result<Option<PaymentSession>, sqlx::Error> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM payment_sessions \
             WHERE processor_payment_id = $1 FOR UPDATE"
        );
        sqlx::query_as::<_, PaymentSession>(&query)
            .bind(processor_payment_id)
            .fetch_optional(&mut **tx)
            .await
    }

    pub async fn write_status_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: Uuid,
        update: &PaymentStatusUpdate,
    ) -> Result<PaymentSession, sqlx::Error> {
        let query = format!(
            r#"
            UPDATE payment_sessions
            SET status = $2,
                tx_hash = COALESCE($3, tx_hash),
                actually_paid = COALESCE($4, actually_paid),
                updated_at = $5,
                provider_data = COALESCE($6, provider_data)
            WHERE id = $1
            RETURNING {SESSION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, PaymentSession>(&query)
            .bind(id)
            .bind(update.status.as_str())
            .bind(update.tx_hash.as_deref())
            .bind(update.actually_paid)
            .bind(update.at)
            .bind(update.provider_data.as_ref().map(sqlx::types::Json))
            .fetch_one(&mut **tx)
            .await
    }

    /// Flip `is_processed` false -> true. Returns whether this call flipped it.
    pub async fn claim_processed_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE payment_sessions
            SET is_processed = true
            WHERE id = $1 AND is_processed = false AND status = 'finished'
            "#,
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Record the entitlement for a finished session. A second grant for the
/// same session is a no-op.
pub async fn insert_entitlement_grant_tx(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    session: &PaymentSession,
    at: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO entitlement_grants (session_id, user_id, payment_type, payment_metadata, granted_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (session_id) DO NOTHING
        "#,
    )
    .bind(session.id)
    .bind(session.user_id)
    .bind(session.payment_type.as_str())
    .bind(sqlx::types::Json(&session.metadata))
    .bind(at)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() == 1)
}

#[derive(Debug, Clone)]
/// Reserve `(user_id, idempotency_key)` for a new session, or return the row
/// that already holds it.
pub struct InsertSessionClaim {
    pub claim: NewSessionClaim,
}

impl Processor<InsertSessionClaim> for DatabaseProcessor {
    type Output = ClaimOutcome;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InsertSessionClaim")]
    async fn process(&self, cmd: InsertSessionClaim) -> Result<ClaimOutcome, sqlx::Error> {
        let claim = cmd.claim;
        let insert = format!(
            r#"
            INSERT INTO payment_sessions
                (id, user_id, idempotency_key, payment_type, payment_metadata, usd_amount,
                 pay_currency, status, is_processed, created_at, updated_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'created', false, $8, $8, $9)
            ON CONFLICT (user_id, idempotency_key) DO NOTHING
            RETURNING {SESSION_COLUMNS}
            "#
        );
        let select = format!(
            "SELECT {SESSION_COLUMNS} FROM payment_sessions \
             WHERE user_id = $1 AND idempotency_key = $2"
        );

        // A conflicting claim can be released between the insert and the
        // select, so go around again in that case.
        for _ in 0..3 {
            let inserted = sqlx::query_as::<_, PaymentSession>(&insert)
                .bind(claim.id)
                .bind(claim.user_id)
                .bind(&claim.idempotency_key)
                .bind(claim.payment_type.as_str())
                .bind(sqlx::types::Json(&claim.metadata))
                .bind(claim.usd_amount)
                .bind(claim.pay_currency.id())
                .bind(claim.created_at)
                .bind(claim.expires_at)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(session) = inserted {
                return Ok(ClaimOutcome::Claimed(session));
            }

            let existing = sqlx::query_as::<_, PaymentSession>(&select)
                .bind(claim.user_id)
                .bind(&claim.idempotency_key)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(session) = existing {
                return Ok(ClaimOutcome::Existing(session));
            }
        }
        Err(sqlx::Error::RowNotFound)
    }
}

#[derive(Debug, Clone)]
/// Write the processor's payment onto a claimed session.
///
/// Returns `None` when the claim is gone or already attached.
pub struct AttachProcessorPayment {
    pub attachment: ProcessorAttachment,
}

impl Processor<AttachProcessorPayment> for DatabaseProcessor {
    type Output = Option<PaymentSession>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:AttachProcessorPayment")]
    async fn process(
        &self,
        cmd: AttachProcessorPayment,
    ) -> Result<Option<PaymentSession>, sqlx::Error> {
        let a = cmd.attachment;
        let query = format!(
            r#"
            UPDATE payment_sessions
            SET processor_payment_id = $2,
                pay_address = $3,
                pay_amount = $4,
                status = $5,
                expires_at = $6,
                updated_at = $7
            WHERE id = $1 AND processor_payment_id IS NULL
            RETURNING {SESSION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, PaymentSession>(&query)
            .bind(a.session_id)
            .bind(&a.processor_payment_id)
            .bind(&a.pay_address)
            .bind(a.pay_amount)
            .bind(a.status.as_str())
            .bind(a.expires_at)
            .bind(a.updated_at)
            .fetch_optional(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Drop a claim whose processor call failed so the key can be retried.
pub struct ReleaseSessionClaim {
    pub session_id: Uuid,
}

impl Processor<ReleaseSessionClaim> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ReleaseSessionClaim")]
    async fn process(&self, cmd: ReleaseSessionClaim) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM payment_sessions WHERE id = $1 AND processor_payment_id IS NULL",
        )
        .bind(cmd.session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
pub struct GetSessionById {
    pub id: Uuid,
}

impl Processor<GetSessionById> for DatabaseProcessor {
    type Output = Option<PaymentSession>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetSessionById")]
    async fn process(&self, query: GetSessionById) -> Result<Option<PaymentSession>, sqlx::Error> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM payment_sessions WHERE id = $1");
        sqlx::query_as::<_, PaymentSession>(&sql)
            .bind(query.id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
/// Apply an authoritative status update in one transaction: lock the row,
/// check monotonicity, write the status, and on `finished` claim the
/// processed flag and record the entitlement grant.
pub struct ApplyPaymentStatus {
    pub update: PaymentStatusUpdate,
}

impl Processor<ApplyPaymentStatus> for DatabaseProcessor {
    type Output = StatusTransition;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ApplyPaymentStatus")]
    async fn process(&self, cmd: ApplyPaymentStatus) -> Result<StatusTransition, sqlx::Error> {
        let update = cmd.update;
        let mut tx = self.pool.begin().await?;

        let Some(current) =
            PaymentSession::lock_by_processor_id_tx(&mut tx, &update.processor_payment_id).await?
        else {
            tx.rollback().await?;
            return Ok(StatusTransition::not_found());
        };

        let claim_processed =
            match plan_status_change(current.status, current.is_processed, update.status) {
                StatusPlan::Apply { claim_processed } => claim_processed,
                StatusPlan::AlreadyApplied => {
                    tx.rollback().await?;
                    return Ok(StatusTransition {
                        outcome: ApplyOutcome::AlreadyApplied,
                        session: Some(current),
                        entitlement_granted: false,
                    });
                }
                StatusPlan::Stale => {
                    tx.rollback().await?;
                    return Ok(StatusTransition {
                        outcome: ApplyOutcome::StaleIgnored,
                        session: Some(current),
                        entitlement_granted: false,
                    });
                }
            };

        let mut session = PaymentSession::write_status_tx(&mut tx, current.id, &update).await?;
        let mut entitlement_granted = false;
        if claim_processed && PaymentSession::claim_processed_tx(&mut tx, session.id).await? {
            insert_entitlement_grant_tx(&mut tx, &session, update.at).await?;
            session.is_processed = true;
            entitlement_granted = true;
        }
        tx.commit().await?;

        Ok(StatusTransition {
            outcome: ApplyOutcome::Applied,
            session: Some(session),
            entitlement_granted,
        })
    }
}
