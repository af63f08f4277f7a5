#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

//! Server-side payment lifecycle: quotes, session creation, callback
//! reconciliation and status fan-out.

pub mod config;
pub mod entities;
pub mod events;
pub mod framework;
pub mod payout;
pub mod processors;
pub mod quotes;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod upstream;
pub mod utils;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
