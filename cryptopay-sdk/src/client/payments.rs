//! Payment API client (checkout frontend → payment server).
//!
//! Quote endpoints are public. Session creation and status reads carry the
//! user's bearer token.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use url::Url;
use uuid::Uuid;

use super::ClientError;
use super::watcher::{StatusSource, StatusStream};
use crate::currency::CryptoCurrency;
use crate::objects::payment::{
    CreatePaymentRequest, IDEMPOTENCY_KEY_HEADER, PaymentSessionResponse,
    is_valid_idempotency_key,
};
use crate::objects::quotes::{
    CACHE_STATUS_HEADER, Freshness, MinAmountsResponse, Quote, SpotPricesResponse, join_quotes,
};
use crate::objects::ws::WsServerMessage;

/// Both quote endpoints joined per currency.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteBundle {
    pub quotes: Vec<Quote>,
    /// Weakest freshness reported by either endpoint.
    pub freshness: Option<Freshness>,
}

/// Typed client for the payment API.
#[derive(Debug, Clone)]
pub struct PaymentClient {
    http: Client,
    base_url: Url,
    access_token: Option<String>,
}

impl PaymentClient {
    /// * `base_url` - root URL of the payment server.
    /// * `access_token` - the user's session token, sent as a bearer token.
    pub fn new(base_url: Url, access_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url,
            access_token,
        }
    }

    /// Replace the default `reqwest::Client` with a custom one.
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    pub fn set_access_token(&mut self, token: Option<String>) {
        self.access_token = token;
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// `GET /prices`
    pub async fn prices(&self) -> Result<(SpotPricesResponse, Option<Freshness>), ClientError> {
        let url = self.base_url.join("/prices")?;
        let resp = self.http.get(url).send().await?;
        let freshness = freshness_of(&resp);
        Ok((parse_response(resp).await?, freshness))
    }

    /// `GET /min-amounts`
    pub async fn min_amounts(
        &self,
    ) -> Result<(MinAmountsResponse, Option<Freshness>), ClientError> {
        let url = self.base_url.join("/min-amounts")?;
        let resp = self.http.get(url).send().await?;
        let freshness = freshness_of(&resp);
        Ok((parse_response(resp).await?, freshness))
    }

    /// Fetch both quote endpoints concurrently and join them for `currencies`.
    pub async fn quotes(&self, currencies: &[CryptoCurrency]) -> Result<QuoteBundle, ClientError> {
        let ((prices, price_freshness), (minimums, min_freshness)) =
            tokio::try_join!(self.prices(), self.min_amounts())?;
        let freshness = match (price_freshness, min_freshness) {
            (Some(a), Some(b)) => Some(a.weakest(b)),
            (a, b) => a.or(b),
        };
        Ok(QuoteBundle {
            quotes: join_quotes(currencies, &prices, &minimums),
            freshness,
        })
    }

    /// `POST /payments/create`
    ///
    /// Reusing `idempotency_key` on retry returns the original session
    /// instead of creating a second one.
    pub async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
        idempotency_key: &str,
    ) -> Result<PaymentSessionResponse, ClientError> {
        if !is_valid_idempotency_key(idempotency_key) {
            return Err(ClientError::InvalidIdempotencyKey);
        }
        let url = self.base_url.join("/payments/create")?;
        let resp = self
            .authorized(self.http.post(url))
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(request)
            .send()
            .await?;

        parse_response(resp).await
    }

    /// `GET /payments/{id}`
    pub async fn get_payment(&self, id: Uuid) -> Result<PaymentSessionResponse, ClientError> {
        let url = self.base_url.join(&format!("/payments/{id}"))?;
        let resp = self.authorized(self.http.get(url)).send().await?;
        parse_response(resp).await
    }

    /// WebSocket URL of the status stream for `id`.
    pub fn status_stream_url(&self, id: Uuid) -> Result<Url, ClientError> {
        let mut url = self.base_url.join(&format!("/payments/{id}/ws"))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        // http(s) -> ws(s) is always an allowed scheme change.
        let _ = url.set_scheme(scheme);
        Ok(url)
    }

    /// Open the status stream for `id`.
    pub async fn subscribe_status(&self, id: Uuid) -> Result<StatusStream, ClientError> {
        let url = self.status_stream_url(id)?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(token) = &self.access_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(tokio_tungstenite::tungstenite::http::Error::from)
                .map_err(tokio_tungstenite::tungstenite::Error::from)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        let stream = socket.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<WsServerMessage>(&text) {
                    Ok(WsServerMessage::StatusUpdate { payment }) => Some(Ok(payment)),
                    Ok(WsServerMessage::Error { code, reason }) => {
                        Some(Err(ClientError::Stream { code, reason }))
                    }
                    Err(e) => Some(Err(ClientError::Json(e))),
                },
                Ok(_) => None,
                Err(e) => Some(Err(ClientError::WebSocket(e))),
            }
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl StatusSource for PaymentClient {
    async fn fetch(&self, id: Uuid) -> Result<PaymentSessionResponse, ClientError> {
        self.get_payment(id).await
    }

    async fn subscribe(&self, id: Uuid) -> Result<StatusStream, ClientError> {
        self.subscribe_status(id).await
    }
}

fn freshness_of(resp: &reqwest::Response) -> Option<Freshness> {
    resp.headers()
        .get(CACHE_STATUS_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(Freshness::from_header)
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ClientError::Api { status, body });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(ClientError::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_switches_scheme() {
        let id = Uuid::nil();
        let client = PaymentClient::new(Url::parse("https://pay.example.com").unwrap(), None);
        assert_eq!(
            client.status_stream_url(id).unwrap().as_str(),
            format!("wss://pay.example.com/payments/{id}/ws")
        );
        let client = PaymentClient::new(Url::parse("http://127.0.0.1:8080/").unwrap(), None);
        assert!(client.status_stream_url(id).unwrap().as_str().starts_with("ws://127.0.0.1:8080/"));
    }
}
