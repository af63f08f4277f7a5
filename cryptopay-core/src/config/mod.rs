//! Configuration types for the payment service.
//!
//! These types represent the validated runtime configuration used by the
//! server and the core services. Loading and parsing is handled by the
//! server crate.

mod auth;
mod processor;
mod server;

pub use auth::AuthConfig;
pub use cryptopay_sdk::intent::AmountLimits;
pub use processor::{PayoutCredentials, PricesConfig, ProcessorConfig};
pub use server::{RealtimeConfig, ServerConfig};

use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared configuration state with separate locks for each section.
///
/// This allows independent access to different configuration sections
/// without blocking other readers/writers.
#[derive(Clone)]
pub struct SharedConfig {
    /// Server configuration (listen address).
    pub server: Arc<RwLock<ServerConfig>>,
    /// Payment processor endpoint, payment window and secrets.
    pub processor: Arc<RwLock<ProcessorConfig>>,
    /// Spot price feed endpoint.
    pub prices: Arc<RwLock<PricesConfig>>,
    /// Per payment-type USD bounds.
    pub limits: Arc<RwLock<AmountLimits>>,
    /// Bearer token verification.
    pub auth: Arc<RwLock<AuthConfig>>,
    /// Client status propagation hints.
    pub realtime: Arc<RwLock<RealtimeConfig>>,
}

impl SharedConfig {
    pub fn new(
        server: ServerConfig,
        processor: ProcessorConfig,
        prices: PricesConfig,
        limits: AmountLimits,
        auth: AuthConfig,
        realtime: RealtimeConfig,
    ) -> Self {
        Self {
            server: Arc::new(RwLock::new(server)),
            processor: Arc::new(RwLock::new(processor)),
            prices: Arc::new(RwLock::new(prices)),
            limits: Arc::new(RwLock::new(limits)),
            auth: Arc::new(RwLock::new(auth)),
            realtime: Arc::new(RwLock::new(realtime)),
        }
    }
}
