//! DeadLetterRetrier processor.
//!
//! Verified callbacks whose transition could not be written are parked in
//! the dead-letter table. The retrier wakes every few seconds, replays the
//! letters that are due and either resolves them or pushes them back with
//! exponential backoff (2^1 to 2^11 seconds). After [`MAX_RETRY_COUNT`]
//! attempts a letter stays in the table for an operator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::entities::dead_letters::DeadLetter;
use crate::reconciler::{ReplayError, WebhookReconciler};
use crate::store::DeadLetterStore;
use crate::utils::Clock;

/// Maximum retry attempts (2^11 = 2048 seconds max backoff)
pub const MAX_RETRY_COUNT: u32 = 11;

/// Letters replayed per wake-up.
const BATCH_SIZE: i64 = 10;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// What one pass over the due letters did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub resolved: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
}

pub struct DeadLetterRetrier {
    reconciler: Arc<WebhookReconciler>,
    dead_letters: Arc<dyn DeadLetterStore>,
    clock: Arc<dyn Clock>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DeadLetterRetrier {
    pub fn new(
        reconciler: Arc<WebhookReconciler>,
        dead_letters: Arc<dyn DeadLetterStore>,
        clock: Arc<dyn Clock>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reconciler,
            dead_letters,
            clock,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("DeadLetterRetrier started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("DeadLetterRetrier received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    match self.retry_due().await {
                        Ok(report) if report != RetryReport::default() => {
                            info!(
                                resolved = report.resolved,
                                rescheduled = report.rescheduled,
                                abandoned = report.abandoned,
                                "Replayed dead letters"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Failed to load due dead letters"),
                    }
                }
            }
        }

        info!("DeadLetterRetrier shutdown complete");
    }

    /// Replay every letter that is due now.
    pub async fn retry_due(&self) -> Result<RetryReport, sqlx::Error> {
        let now = self.clock.now_primitive();
        let due = self
            .dead_letters
            .due(now, MAX_RETRY_COUNT as i32, BATCH_SIZE)
            .await?;

        let mut report = RetryReport::default();
        for letter in due {
            match self.reconciler.replay(&letter).await {
                Ok(outcome) => {
                    debug!(
                        id = letter.id,
                        external_id = %letter.external_id,
                        outcome = ?outcome,
                        "Dead letter replayed"
                    );
                    self.dead_letters.resolve(letter.id).await?;
                    report.resolved += 1;
                }
                Err(ReplayError::Unreplayable(reason)) => {
                    self.abandon(&letter, reason).await?;
                    report.abandoned += 1;
                }
                Err(ReplayError::Database(e)) => {
                    let attempts = letter.attempts.saturating_add(1);
                    if attempts >= MAX_RETRY_COUNT as i32 {
                        self.abandon(&letter, e.to_string()).await?;
                        report.abandoned += 1;
                        continue;
                    }
                    let delay = calculate_retry_delay(attempts.unsigned_abs());
                    warn!(
                        id = letter.id,
                        external_id = %letter.external_id,
                        attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "Dead letter replay failed"
                    );
                    self.dead_letters
                        .reschedule(letter.id, attempts, now + delay, e.to_string())
                        .await?;
                    report.rescheduled += 1;
                }
            }
        }
        Ok(report)
    }

    /// Park a letter past the attempt limit so `due` never returns it again.
    async fn abandon(&self, letter: &DeadLetter, reason: String) -> Result<(), sqlx::Error> {
        error!(
            id = letter.id,
            kind = %letter.kind,
            external_id = %letter.external_id,
            status = %letter.status,
            reason = %reason,
            payload = %letter.payload,
            needs_investigation = true,
            "Giving up on dead letter"
        );
        self.dead_letters
            .reschedule(
                letter.id,
                MAX_RETRY_COUNT as i32,
                self.clock.now_primitive(),
                reason,
            )
            .await
    }
}

/// Calculate the delay before the next retry attempt.
pub fn calculate_retry_delay(retry_count: u32) -> Duration {
    let seconds = 2u64.pow(retry_count.min(MAX_RETRY_COUNT));
    Duration::from_secs(seconds)
}
