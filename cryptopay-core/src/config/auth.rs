//! Bearer token verification settings.

use url::Url;

/// Auth service used to resolve bearer tokens into users.
#[derive(Clone)]
pub struct AuthConfig {
    /// Base URL of the auth service; tokens are checked at `{base}/auth/v1/user`.
    pub supabase_url: Url,
    /// Service key sent as the `apikey` header.
    pub service_role_key: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("supabase_url", &self.supabase_url.as_str())
            .field(
                "service_role_key",
                &self.service_role_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}
