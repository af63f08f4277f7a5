use kanau::processor::Processor;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use time::PrimitiveDateTime;

use crate::entities::text_column;
use crate::framework::DatabaseProcessor;

const DEAD_LETTER_COLUMNS: &str = "id, kind, external_id, status, tx_hash, payload, attempts, \
     next_attempt_at, last_error, created_at";

/// Which callback endpoint a dead letter came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadLetterKind {
    Payment,
    Payout,
}

impl DeadLetterKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            DeadLetterKind::Payment => "payment",
            DeadLetterKind::Payout => "payout",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "payment" => Some(DeadLetterKind::Payment),
            "payout" => Some(DeadLetterKind::Payout),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeadLetterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified callback whose transition could not be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: i64,
    pub kind: DeadLetterKind,
    /// Processor payment id or withdrawal id.
    pub external_id: String,
    pub status: String,
    pub tx_hash: Option<String>,
    /// The verified callback body, replayed as-is.
    pub payload: Value,
    pub attempts: i32,
    pub next_attempt_at: PrimitiveDateTime,
    pub last_error: String,
    pub created_at: PrimitiveDateTime,
}

impl<'r> FromRow<'r, PgRow> for DeadLetter {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: text_column(row, "kind", DeadLetterKind::from_name)?,
            external_id: row.try_get("external_id")?,
            status: row.try_get("status")?,
            tx_hash: row.try_get("tx_hash")?,
            payload: row.try_get("payload")?,
            attempts: row.try_get("attempts")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    pub kind: DeadLetterKind,
    pub external_id: String,
    pub status: String,
    pub tx_hash: Option<String>,
    pub payload: Value,
    pub last_error: String,
    pub at: PrimitiveDateTime,
}

#[derive(Debug, Clone)]
/// Enqueue a callback for retry, due immediately.
pub struct InsertDeadLetter {
    pub letter: NewDeadLetter,
}

impl Processor<InsertDeadLetter> for DatabaseProcessor {
    type Output = i64;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:InsertDeadLetter")]
    async fn process(&self, cmd: InsertDeadLetter) -> Result<i64, sqlx::Error> {
        let letter = cmd.letter;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_dead_letters
                (kind, external_id, status, tx_hash, payload, attempts, next_attempt_at, last_error, created_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $6)
            RETURNING id
            "#,
        )
        .bind(letter.kind.as_str())
        .bind(&letter.external_id)
        .bind(&letter.status)
        .bind(letter.tx_hash.as_deref())
        .bind(&letter.payload)
        .bind(letter.at)
        .bind(&letter.last_error)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

#[derive(Debug, Clone)]
/// Dead letters whose next attempt is due and which still have attempts left.
pub struct GetDueDeadLetters {
    pub now: PrimitiveDateTime,
    pub max_attempts: i32,
    pub limit: i64,
}

impl Processor<GetDueDeadLetters> for DatabaseProcessor {
    type Output = Vec<DeadLetter>;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:GetDueDeadLetters")]
    async fn process(&self, query: GetDueDeadLetters) -> Result<Vec<DeadLetter>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM webhook_dead_letters
            WHERE attempts < $1 AND next_attempt_at <= $2
            ORDER BY next_attempt_at ASC
            LIMIT $3
            "#
        );
        sqlx::query_as::<_, DeadLetter>(&sql)
            .bind(query.max_attempts)
            .bind(query.now)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct DeleteDeadLetter {
    pub id: i64,
}

impl Processor<DeleteDeadLetter> for DatabaseProcessor {
    type Output = bool;
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:DeleteDeadLetter")]
    async fn process(&self, cmd: DeleteDeadLetter) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM webhook_dead_letters WHERE id = $1")
            .bind(cmd.id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, Clone)]
/// Record a failed replay and push the next attempt out.
pub struct RescheduleDeadLetter {
    pub id: i64,
    pub attempts: i32,
    pub next_attempt_at: PrimitiveDateTime,
    pub last_error: String,
}

impl Processor<RescheduleDeadLetter> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:RescheduleDeadLetter")]
    async fn process(&self, cmd: RescheduleDeadLetter) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE webhook_dead_letters
            SET attempts = $2, next_attempt_at = $3, last_error = $4
            WHERE id = $1
            "#,
        )
        .bind(cmd.id)
        .bind(cmd.attempts)
        .bind(cmd.next_attempt_at)
        .bind(&cmd.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
