//! In-process application wiring for handler tests.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use cryptopay_core::store::MemoryStore;
use cryptopay_core::testing::{FakeFeed, FakeGateway, FakeVerifier};
use cryptopay_core::utils::ManualClock;
use cryptopay_sdk::currency::CryptoCurrency;
use cryptopay_sdk::objects::{CreatePaymentRequest, PaymentMetadata, PaymentType};
use cryptopay_sdk::signature::{IPN_SIGNATURE_HEADER, sign};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use crate::config::file::FileConfig;
use crate::config::{LoadedConfig, Secrets};
use crate::server::build_router;
use crate::state::{Adapters, AppState};

pub const IPN_SECRET: &str = "test-ipn-secret";
pub const TOKEN: &str = "user-token";
pub const OPERATOR_TOKEN: &str = "operator-token";
pub const OPERATOR_ID: Uuid = Uuid::from_u128(0x0190a5c4_7b1e_7000_8000_000000000001);

const CONFIG: &str = r#"
[processor]
payout_operators = ["0190a5c4-7b1e-7000-8000-000000000001"]

[auth]
supabase_url = "http://auth.invalid"

[realtime]
poll_interval_secs = 1
"#;

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    /// Kept apart from `store` so queued callbacks survive a store outage.
    pub dead_letters: Arc<MemoryStore>,
    pub feed: Arc<FakeFeed>,
    pub gateway: Arc<FakeGateway>,
    pub auth: Arc<FakeVerifier>,
    pub clock: Arc<ManualClock>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_ipn_secret(Some(IPN_SECRET))
    }

    pub fn with_ipn_secret(ipn_secret: Option<&str>) -> Self {
        let file: FileConfig = toml::from_str(CONFIG).unwrap();
        let secrets = Secrets {
            processor_api_key: Some("test-api-key".to_owned()),
            ipn_secret: ipn_secret.map(str::to_owned),
            service_role_key: None,
            payout_credentials: None,
        };
        let config = LoadedConfig::build(file, secrets).unwrap().into_shared();

        let store = Arc::new(MemoryStore::new());
        let dead_letters = Arc::new(MemoryStore::new());
        let feed = Arc::new(FakeFeed::with(&[
            (CryptoCurrency::Btc, 60_000),
            (CryptoCurrency::Eth, 2_500),
        ]));
        let gateway = Arc::new(FakeGateway::default());
        let auth = Arc::new(FakeVerifier::default());
        let clock = Arc::new(ManualClock::default());
        auth.issue(TOKEN);
        auth.issue_as(OPERATOR_TOKEN, OPERATOR_ID);

        let state = AppState::new(
            config,
            Adapters {
                store: store.clone(),
                dead_letters: dead_letters.clone(),
                feed: feed.clone(),
                gateway: gateway.clone(),
                auth: auth.clone(),
                clock: clock.clone(),
            },
        );
        Self {
            state,
            store,
            dead_letters,
            feed,
            gateway,
            auth,
            clock,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router().oneshot(request).await.unwrap()
    }
}

pub fn tip(usd: i64) -> CreatePaymentRequest {
    let mut metadata = PaymentMetadata::new();
    metadata.insert("creator_id".to_owned(), serde_json::json!("creator-1"));
    CreatePaymentRequest {
        usd_amount: Decimal::new(usd, 0),
        crypto_currency: CryptoCurrency::Eth,
        payment_type: PaymentType::Tip,
        metadata,
    }
}

pub fn create_request(body: &CreatePaymentRequest, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::post("/payments/create")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {TOKEN}"));
    if let Some(key) = key {
        builder = builder.header("idempotency-key", key);
    }
    builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// A callback request signed with `secret`.
pub fn signed_webhook(path: &str, payload: &Value, secret: &str) -> Request<Body> {
    Request::post(path)
        .header("content-type", "application/json")
        .header(IPN_SIGNATURE_HEADER, sign(payload, secret.as_bytes()))
        .body(Body::from(serde_json::to_vec(payload).unwrap()))
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
