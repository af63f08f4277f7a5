//! Event channel factory and handles.

use super::types::PaymentStatusChanged;
use tokio::sync::broadcast;

/// Buffer size for the status broadcast.
///
/// A subscriber that falls this far behind gets `Lagged` and must re-read
/// the session instead.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Sender handle for PaymentStatusChanged events.
pub type StatusEventSender = broadcast::Sender<PaymentStatusChanged>;
/// Receiver handle for PaymentStatusChanged events.
pub type StatusEventReceiver = broadcast::Receiver<PaymentStatusChanged>;

/// Create the status broadcast channel.
///
/// Every WebSocket subscriber calls `subscribe()` on the sender; the initial
/// receiver may be dropped.
pub fn status_event_channel() -> (StatusEventSender, StatusEventReceiver) {
    broadcast::channel(DEFAULT_CHANNEL_BUFFER)
}
