//! Status change events.
//!
//! The webhook reconciler publishes a [`PaymentStatusChanged`] after every
//! applied transition; WebSocket subscribers filter the broadcast by
//! session id. Events are ephemeral. A subscriber that misses one reads the
//! session again.

pub mod channels;
pub mod types;

pub use channels::{
    DEFAULT_CHANNEL_BUFFER, StatusEventReceiver, StatusEventSender, status_event_channel,
};
pub use types::PaymentStatusChanged;
