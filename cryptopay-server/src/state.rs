//! Application state shared across all request handlers.

use cryptopay_core::config::SharedConfig;
use cryptopay_core::events::{StatusEventSender, status_event_channel};
use cryptopay_core::payout::{PayoutCreator, PayoutSettings};
use cryptopay_core::quotes::QuoteCache;
use cryptopay_core::reconciler::WebhookReconciler;
use cryptopay_core::session::{SessionCreator, SessionSettings};
use cryptopay_core::store::{DeadLetterStore, PaymentStore};
use cryptopay_core::upstream::{PaymentGateway, PriceFeed, TokenVerifier};
use cryptopay_core::utils::Clock;
use std::sync::Arc;

/// Storage and upstream adapters the services are built from.
pub struct Adapters {
    pub store: Arc<dyn PaymentStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub feed: Arc<dyn PriceFeed>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub auth: Arc<dyn TokenVerifier>,
    pub clock: Arc<dyn Clock>,
}

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around (everything is behind Arc).
#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration (can be reloaded via SIGHUP).
    pub config: SharedConfig,
    pub store: Arc<dyn PaymentStore>,
    pub auth: Arc<dyn TokenVerifier>,
    pub quotes: Arc<QuoteCache>,
    pub sessions: Arc<SessionCreator>,
    pub payouts: Arc<PayoutCreator>,
    pub reconciler: Arc<WebhookReconciler>,
    /// Status changes applied by this instance's reconciler.
    pub events: StatusEventSender,
}

impl AppState {
    pub fn new(config: SharedConfig, adapters: Adapters) -> Self {
        let (events, _) = status_event_channel();
        let quotes = Arc::new(QuoteCache::new(
            adapters.feed,
            adapters.gateway.clone(),
            adapters.clock.clone(),
        ));
        let sessions = Arc::new(SessionCreator::new(
            adapters.store.clone(),
            adapters.gateway.clone(),
            quotes.clone(),
            adapters.auth.clone(),
            adapters.clock.clone(),
        ));
        let payouts = Arc::new(PayoutCreator::new(
            adapters.store.clone(),
            adapters.gateway,
            adapters.auth.clone(),
            adapters.clock.clone(),
        ));
        let reconciler = Arc::new(WebhookReconciler::new(
            adapters.store.clone(),
            adapters.dead_letters,
            events.clone(),
            adapters.clock,
        ));
        Self {
            config,
            store: adapters.store,
            auth: adapters.auth,
            quotes,
            sessions,
            payouts,
            reconciler,
            events,
        }
    }

    /// Snapshot of the settings session creation reads per request.
    pub async fn session_settings(&self) -> SessionSettings {
        let limits = *self.config.limits.read().await;
        let processor = self.config.processor.read().await;
        SessionSettings {
            limits,
            payment_window: processor.payment_window(),
            ipn_callback_url: processor.ipn_callback_url.clone(),
        }
    }

    pub async fn payout_settings(&self) -> PayoutSettings {
        let processor = self.config.processor.read().await;
        PayoutSettings {
            operators: processor.payout_operators.clone(),
            ipn_callback_url: processor.payout_callback_url.clone(),
        }
    }

    /// The callback secret, copied out of the config lock.
    pub async fn ipn_secret(&self) -> Option<Box<[u8]>> {
        self.config
            .processor
            .read()
            .await
            .ipn_secret_bytes()
            .map(Box::from)
    }
}
