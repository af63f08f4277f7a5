//! Client-side payment state machine.
//!
//! [`reduce`] maps an incoming session snapshot straight to a display
//! state without validating the edge it came from, so replaying the same
//! or an older snapshot is harmless. [`PaymentStateMachine`] adds the two
//! pieces of memory the pure mapping cannot have: the terminal lock and the
//! "success already fired" latch.

use std::collections::HashSet;
use std::sync::Mutex;

use uuid::Uuid;

use crate::objects::payment::{PaymentSessionResponse, PaymentStatus};

/// What the checkout UI shows for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayState {
    Created,
    Waiting,
    Confirming,
    Confirmed,
    Sending,
    PartiallyPaid,
    /// The processor reports `finished` but the server has not applied
    /// the entitlement yet.
    Finalizing,
    Finished,
    Expired,
    Failed { reason: String },
}

impl DisplayState {
    /// Whether the state accepts no further updates.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DisplayState::Finished | DisplayState::Expired | DisplayState::Failed { .. }
        )
    }
}

/// Map a status (plus the durable processed flag) to its display state.
///
/// The previous state is deliberately not an input.
pub fn reduce(status: PaymentStatus, is_processed: bool) -> DisplayState {
    match status {
        PaymentStatus::Created => DisplayState::Created,
        PaymentStatus::Waiting => DisplayState::Waiting,
        PaymentStatus::Confirming => DisplayState::Confirming,
        PaymentStatus::Confirmed => DisplayState::Confirmed,
        PaymentStatus::Sending => DisplayState::Sending,
        PaymentStatus::PartiallyPaid => DisplayState::PartiallyPaid,
        PaymentStatus::Finished if is_processed => DisplayState::Finished,
        PaymentStatus::Finished => DisplayState::Finalizing,
        PaymentStatus::Expired => DisplayState::Expired,
        PaymentStatus::Failed => DisplayState::Failed {
            reason: "Payment failed. Please try again.".to_owned(),
        },
        PaymentStatus::Refunded => DisplayState::Failed {
            reason: status_label(PaymentStatus::Refunded).to_owned(),
        },
    }
}

/// Result of feeding one snapshot into the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// The display state after the update.
    pub state: DisplayState,
    /// The display state differs from the one before the update.
    pub changed: bool,
    /// The success callback must run now. True at most once per machine.
    pub fire_success: bool,
    /// A terminal state was just entered; subscriptions should be torn down.
    pub entered_terminal: bool,
}

/// Per-session reducer with terminal lock and single-fire success.
#[derive(Debug, Clone)]
pub struct PaymentStateMachine {
    session_id: Uuid,
    state: DisplayState,
    latest: Option<PaymentSessionResponse>,
    success_fired: bool,
}

impl PaymentStateMachine {
    /// A machine in the `Created` state, entered before the first status read.
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: DisplayState::Created,
            latest: None,
            success_fired: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> &DisplayState {
        &self.state
    }

    /// The last snapshot that was accepted.
    pub fn latest(&self) -> Option<&PaymentSessionResponse> {
        self.latest.as_ref()
    }

    pub fn is_locked(&self) -> bool {
        self.state.is_terminal()
    }

    /// Feed a snapshot from either delivery path.
    ///
    /// Snapshots for other sessions, and anything arriving after a terminal
    /// state, are ignored.
    pub fn apply(&mut self, snapshot: &PaymentSessionResponse) -> Step {
        if snapshot.id != self.session_id || self.is_locked() {
            return self.unchanged();
        }

        let next = reduce(snapshot.status, snapshot.is_processed);
        let changed = next != self.state;
        let fire_success = next == DisplayState::Finished && !self.success_fired;
        if fire_success {
            self.success_fired = true;
        }
        let entered_terminal = changed && next.is_terminal();

        self.state = next;
        self.latest = Some(snapshot.clone());
        Step {
            state: self.state.clone(),
            changed,
            fire_success,
            entered_terminal,
        }
    }

    fn unchanged(&self) -> Step {
        Step {
            state: self.state.clone(),
            changed: false,
            fire_success: false,
            entered_terminal: false,
        }
    }
}

/// Human-readable label for a processor status.
pub fn status_label(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Created => "Initializing...",
        PaymentStatus::Waiting => "Waiting for payment",
        PaymentStatus::Confirming => "Confirming transaction...",
        PaymentStatus::Confirmed => "Transaction confirmed",
        PaymentStatus::Sending => "Processing...",
        PaymentStatus::PartiallyPaid => "Partial payment received",
        PaymentStatus::Finished => "Payment complete!",
        PaymentStatus::Failed => "Payment failed",
        PaymentStatus::Refunded => "Payment refunded",
        PaymentStatus::Expired => "Payment expired",
    }
}

/// Seconds as `M:SS`; zero and negative values render as `0:00`.
pub fn format_countdown(seconds: i64) -> String {
    if seconds <= 0 {
        return "0:00".to_owned();
    }
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

/// Display-only countdown to a session's expiry.
///
/// Reaching zero never changes the display state; only an `expired`
/// status from the server does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    expires_at: i64,
}

impl Countdown {
    pub fn new(expires_at: i64) -> Self {
        Self { expires_at }
    }

    /// Remaining whole seconds at unix time `now`, never negative.
    pub fn remaining(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }

    pub fn label(&self, now: i64) -> String {
        format_countdown(self.remaining(now))
    }
}

/// Process-wide "already granted for this session" guard.
///
/// Both delivery paths may observe the success state; only the first call
/// to [`EntitlementLedger::grant_once`] for a session id runs the grant.
#[derive(Debug, Default)]
pub struct EntitlementLedger {
    granted: Mutex<HashSet<Uuid>>,
}

impl EntitlementLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `grant` unless it already ran for `session_id`. Returns whether it ran.
    pub fn grant_once<F: FnOnce()>(&self, session_id: Uuid, grant: F) -> bool {
        let first = {
            let mut granted = match self.granted.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            granted.insert(session_id)
        };
        if first {
            grant();
        }
        first
    }

    pub fn is_granted(&self, session_id: Uuid) -> bool {
        match self.granted.lock() {
            Ok(guard) => guard.contains(&session_id),
            Err(poisoned) => poisoned.into_inner().contains(&session_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::CryptoCurrency;
    use crate::objects::payment::PaymentType;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot(id: Uuid, status: PaymentStatus, is_processed: bool) -> PaymentSessionResponse {
        PaymentSessionResponse {
            id,
            pay_address: Some("addr".to_owned()),
            pay_amount: Some(Decimal::new(1, 2)),
            pay_currency: CryptoCurrency::Eth,
            usd_amount: Decimal::new(25, 0),
            status,
            payment_type: PaymentType::Tip,
            created_at: 1_700_000_000,
            expires_at: 1_700_001_800,
            tx_hash: None,
            is_processed,
        }
    }

    #[test]
    fn success_fires_exactly_once() {
        let id = Uuid::new_v4();
        let mut machine = PaymentStateMachine::new(id);
        let fired: usize = [
            snapshot(id, PaymentStatus::Waiting, false),
            snapshot(id, PaymentStatus::Confirming, false),
            snapshot(id, PaymentStatus::Finished, true),
            snapshot(id, PaymentStatus::Finished, true),
        ]
        .iter()
        .map(|s| machine.apply(s))
        .filter(|step| step.fire_success)
        .count();
        assert_eq!(fired, 1);
        assert_eq!(machine.state(), &DisplayState::Finished);
    }

    #[test]
    fn repeated_status_is_a_no_op() {
        let id = Uuid::new_v4();
        let mut machine = PaymentStateMachine::new(id);
        let first = machine.apply(&snapshot(id, PaymentStatus::Confirming, false));
        let second = machine.apply(&snapshot(id, PaymentStatus::Confirming, false));
        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(first.state, second.state);
    }

    #[test]
    fn finished_without_processed_flag_is_not_success() {
        let id = Uuid::new_v4();
        let mut machine = PaymentStateMachine::new(id);
        let step = machine.apply(&snapshot(id, PaymentStatus::Finished, false));
        assert_eq!(step.state, DisplayState::Finalizing);
        assert!(!step.fire_success);
        assert!(!machine.is_locked());

        let step = machine.apply(&snapshot(id, PaymentStatus::Finished, true));
        assert!(step.fire_success);
        assert!(step.entered_terminal);
    }

    #[test]
    fn terminal_state_rejects_late_updates() {
        let id = Uuid::new_v4();
        let mut machine = PaymentStateMachine::new(id);
        machine.apply(&snapshot(id, PaymentStatus::Finished, true));
        for late in [PaymentStatus::Confirming, PaymentStatus::Waiting] {
            let step = machine.apply(&snapshot(id, late, false));
            assert!(!step.changed);
            assert_eq!(step.state, DisplayState::Finished);
        }

        let mut expired = PaymentStateMachine::new(id);
        let step = expired.apply(&snapshot(id, PaymentStatus::Expired, false));
        assert!(step.entered_terminal);
        let step = expired.apply(&snapshot(id, PaymentStatus::Finished, true));
        assert_eq!(step.state, DisplayState::Expired);
        assert!(!step.fire_success);
    }

    #[test]
    fn snapshots_for_other_sessions_are_ignored() {
        let mut machine = PaymentStateMachine::new(Uuid::new_v4());
        let step = machine.apply(&snapshot(Uuid::new_v4(), PaymentStatus::Finished, true));
        assert_eq!(step.state, DisplayState::Created);
        assert!(machine.latest().is_none());
    }

    #[test]
    fn refunded_is_a_failure_with_reason() {
        assert_eq!(
            reduce(PaymentStatus::Refunded, false),
            DisplayState::Failed {
                reason: "Payment refunded".to_owned()
            }
        );
    }

    #[test]
    fn countdown_reaching_zero_does_not_expire() {
        let id = Uuid::new_v4();
        let mut machine = PaymentStateMachine::new(id);
        let session = snapshot(id, PaymentStatus::Waiting, false);
        machine.apply(&session);

        let countdown = Countdown::new(session.expires_at);
        assert_eq!(countdown.remaining(session.expires_at + 60), 0);
        assert_eq!(countdown.label(session.expires_at + 60), "0:00");
        assert_eq!(machine.state(), &DisplayState::Waiting);
    }

    #[test]
    fn countdown_formatting() {
        assert_eq!(format_countdown(0), "0:00");
        assert_eq!(format_countdown(-5), "0:00");
        assert_eq!(format_countdown(9), "0:09");
        assert_eq!(format_countdown(1800), "30:00");
        assert_eq!(format_countdown(125), "2:05");
    }

    #[test]
    fn ledger_grants_once_per_session() {
        let ledger = EntitlementLedger::new();
        let calls = AtomicUsize::new(0);
        let id = Uuid::new_v4();
        assert!(ledger.grant_once(id, || {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!ledger.grant_once(id, || {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(ledger.is_granted(id));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
