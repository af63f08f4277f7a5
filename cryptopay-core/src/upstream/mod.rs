//! Adapters for the services this system depends on: the spot price feed,
//! the payment processor and the auth service.
//!
//! Each is a trait so the quote cache, session creator and request
//! extractors can be exercised against in-process fakes.

pub mod auth;
pub mod gateway;
pub mod price_feed;

pub use auth::{AuthError, AuthenticatedUser, SupabaseVerifier, TokenVerifier};
pub use gateway::{
    GatewayError, GatewayPayment, GatewayPaymentRequest, GatewayPayout, GatewayPayoutRequest,
    NowPaymentsGateway, PaymentGateway,
};
pub use price_feed::{CoinGeckoFeed, PriceFeed, PriceFeedError};
