#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

//! Types and helpers shared by the payment server and its clients.
//!
//! - [`objects`]: request, response, callback and stream payloads
//! - [`currency`]: the supported currency catalog
//! - [`intent`]: estimating, gating and formatting a payment before it is created
//! - [`checkout`]: the client-side payment state machine
//! - [`signature`]: canonical-JSON HMAC verification for processor callbacks
//! - `client` (feature): HTTP client and the live status watcher

pub mod checkout;
pub mod currency;
pub mod intent;
pub mod objects;
pub mod signature;

#[cfg(feature = "client")]
pub mod client;
