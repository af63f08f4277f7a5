//! Background processors.
//!
//! - `DeadLetterRetrier`: replays callbacks whose transition failed to persist

pub mod dead_letter_retrier;

pub use dead_letter_retrier::{DeadLetterRetrier, MAX_RETRY_COUNT, RetryReport, calculate_retry_delay};
