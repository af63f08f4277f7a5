//! Bearer token verification.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::AuthConfig;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("auth service is not configured")]
    NotConfigured,

    #[error("auth service request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("auth service returned status {0}")]
    Status(u16),
}

impl AuthError {
    /// Whether the caller should be told to sign in again rather than retry.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, AuthError::MissingToken | AuthError::InvalidToken)
    }
}

/// The user a bearer token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError>;
}

/// Resolves tokens against a Supabase-style `GET /auth/v1/user`.
pub struct SupabaseVerifier {
    http: reqwest::Client,
    config: Arc<RwLock<AuthConfig>>,
}

impl SupabaseVerifier {
    pub fn new(http: reqwest::Client, config: Arc<RwLock<AuthConfig>>) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl TokenVerifier for SupabaseVerifier {
    #[tracing::instrument(skip_all, err, name = "HTTP:VerifyToken")]
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let (url, api_key) = {
            let config = self.config.read().await;
            let api_key = config
                .service_role_key
                .clone()
                .ok_or(AuthError::NotConfigured)?;
            let url = config
                .supabase_url
                .join("auth/v1/user")
                .map_err(|_| AuthError::NotConfigured)?;
            (url, api_key)
        };

        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header("apikey", api_key)
            .send()
            .await?;

        match response.status().as_u16() {
            200..=299 => Ok(response.json().await?),
            401 | 403 => Err(AuthError::InvalidToken),
            other => Err(AuthError::Status(other)),
        }
    }
}
