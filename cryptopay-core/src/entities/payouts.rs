use cryptopay_sdk::objects::{ApplyOutcome, PayoutResponse, PayoutStatus};
use kanau::processor::Processor;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use time::PrimitiveDateTime;
use uuid::Uuid;

use crate::entities::payment_sessions::StatusPlan;
use crate::entities::text_column;
use crate::framework::DatabaseProcessor;
use crate::utils::unix_seconds;

const PAYOUT_COLUMNS: &str = "withdrawal_id, batch_withdrawal_id, currency, amount, address, \
    requested_by, status, tx_hash, created_at, updated_at";

/// A creator withdrawal sent through the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutRequest {
    pub withdrawal_id: String,
    pub batch_withdrawal_id: Option<String>,
    pub currency: String,
    pub amount: Decimal,
    /// Destination wallet.
    pub address: Option<String>,
    /// Operator who sent the payout.
    pub requested_by: Option<Uuid>,
    pub status: PayoutStatus,
    pub tx_hash: Option<String>,
    pub created_at: PrimitiveDateTime,
    pub updated_at: PrimitiveDateTime,
}

impl PayoutRequest {
    pub fn to_response(&self) -> PayoutResponse {
        PayoutResponse {
            withdrawal_id: self.withdrawal_id.clone(),
            batch_withdrawal_id: self.batch_withdrawal_id.clone(),
            currency: self.currency.clone(),
            amount: self.amount,
            address: self.address.clone(),
            status: self.status,
            created_at: unix_seconds(self.created_at),
        }
    }
}

impl<'r> FromRow<'r, PgRow> for PayoutRequest {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            withdrawal_id: row.try_get("withdrawal_id")?,
            batch_withdrawal_id: row.try_get("batch_withdrawal_id")?,
            currency: row.try_get("currency")?,
            amount: row.try_get("amount")?,
            address: row.try_get("address")?,
            requested_by: row.try_get("requested_by")?,
            status: text_column(row, "status", |s| s.parse().ok())?,
            tx_hash: row.try_get("tx_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutStatusUpdate {
    pub withdrawal_id: String,
    pub status: PayoutStatus,
    pub tx_hash: Option<String>,
    pub at: PrimitiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutTransition {
    pub outcome: ApplyOutcome,
    pub payout: Option<PayoutRequest>,
}

/// Same monotonic rule as payment sessions, without a processed flag.
pub fn plan_payout_change(current: PayoutStatus, incoming: PayoutStatus) -> StatusPlan {
    if incoming == current {
        StatusPlan::AlreadyApplied
    } else if current.is_terminal() || incoming.rank() < current.rank() {
        StatusPlan::Stale
    } else {
        StatusPlan::Apply {
            claim_processed: false,
        }
    }
}

#[derive(Debug, Clone)]
/// Record a withdrawal the processor accepted. Returns `false` when a row
/// for the withdrawal id already exists.
pub struct InsertPayoutRequest {
    pub payout: PayoutRequest,
}

impl Processor<InsertPayoutRequest> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InsertPayoutRequest")]
    async fn process(&self, cmd: InsertPayoutRequest) -> Result<bool, sqlx::Error> {
        let payout = cmd.payout;
        let result = sqlx::query(
            r#"
            INSERT INTO payout_requests (
                withdrawal_id, batch_withdrawal_id, currency, amount, address,
                requested_by, status, tx_hash, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (withdrawal_id) DO NOTHING
            "#,
        )
        .bind(&payout.withdrawal_id)
        .bind(payout.batch_withdrawal_id.as_deref())
        .bind(&payout.currency)
        .bind(payout.amount)
        .bind(payout.address.as_deref())
        .bind(payout.requested_by)
        .bind(payout.status.as_str())
        .bind(payout.tx_hash.as_deref())
        .bind(payout.created_at)
        .bind(payout.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
/// Apply a payout status report under a row lock.
pub struct ApplyPayoutStatus {
    pub update: PayoutStatusUpdate,
}

impl Processor<ApplyPayoutStatus> for DatabaseProcessor {
    type Output = PayoutTransition;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:ApplyPayoutStatus")]
    async fn process(&self, cmd: ApplyPayoutStatus) -> Result<PayoutTransition, sqlx::Error> {
        let update = cmd.update;
        let mut tx = self.pool.begin().await?;

        let select =
            format!("SELECT {PAYOUT_COLUMNS} FROM payout_requests WHERE withdrawal_id = $1 FOR UPDATE");
        let current = sqlx::query_as::<_, PayoutRequest>(&select)
            .bind(&update.withdrawal_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(current) = current else {
            tx.rollback().await?;
            return Ok(PayoutTransition {
                outcome: ApplyOutcome::NotFound,
                payout: None,
            });
        };

        let outcome = match plan_payout_change(current.status, update.status) {
            StatusPlan::Apply { .. } => ApplyOutcome::Applied,
            StatusPlan::AlreadyApplied => ApplyOutcome::AlreadyApplied,
            StatusPlan::Stale => ApplyOutcome::StaleIgnored,
        };
        if outcome != ApplyOutcome::Applied {
            tx.rollback().await?;
            return Ok(PayoutTransition {
                outcome,
                payout: Some(current),
            });
        }

        let query = format!(
            r#"
            UPDATE payout_requests
            SET status = $2, tx_hash = COALESCE($3, tx_hash), updated_at = $4
            WHERE withdrawal_id = $1
            RETURNING {PAYOUT_COLUMNS}
            "#
        );
        let payout = sqlx::query_as::<_, PayoutRequest>(&query)
            .bind(&update.withdrawal_id)
            .bind(update.status.as_str())
            .bind(update.tx_hash.as_deref())
            .bind(update.at)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(PayoutTransition {
            outcome,
            payout: Some(payout),
        })
    }
}
