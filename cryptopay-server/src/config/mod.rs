//! Configuration module for cryptopay-server.
//!
//! Handles loading configuration from the TOML file, CLI overrides and
//! environment secrets.

pub mod file;

use crate::config::file::FileConfig;
use cryptopay_core::config::{
    AmountLimits, AuthConfig, PayoutCredentials, PricesConfig, ProcessorConfig, RealtimeConfig,
    ServerConfig, SharedConfig,
};
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const PROCESSOR_API_KEY_ENV: &str = "NOWPAYMENTS_API_KEY";
pub const IPN_SECRET_ENV: &str = "NOWPAYMENTS_IPN_SECRET";
pub const SERVICE_ROLE_KEY_ENV: &str = "SUPABASE_SERVICE_ROLE_KEY";
pub const PROCESSOR_EMAIL_ENV: &str = "NOWPAYMENTS_EMAIL";
pub const PROCESSOR_PASSWORD_ENV: &str = "NOWPAYMENTS_PASSWORD";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Secrets taken from the environment. Re-read on every load.
#[derive(Default)]
pub struct Secrets {
    pub processor_api_key: Option<String>,
    pub ipn_secret: Option<String>,
    pub service_role_key: Option<String>,
    pub payout_credentials: Option<PayoutCredentials>,
}

impl Secrets {
    pub fn from_env() -> Self {
        let payout_credentials = match (
            non_empty_env(PROCESSOR_EMAIL_ENV),
            non_empty_env(PROCESSOR_PASSWORD_ENV),
        ) {
            (Some(email), Some(password)) => Some(PayoutCredentials { email, password }),
            _ => None,
        };
        Self {
            processor_api_key: non_empty_env(PROCESSOR_API_KEY_ENV),
            ipn_secret: non_empty_env(IPN_SECRET_ENV),
            service_role_key: non_empty_env(SERVICE_ROLE_KEY_ENV),
            payout_credentials,
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Loaded configuration result containing all parts.
pub struct LoadedConfig {
    pub server: ServerConfig,
    pub processor: ProcessorConfig,
    pub prices: PricesConfig,
    pub limits: AmountLimits,
    pub auth: AuthConfig,
    pub realtime: RealtimeConfig,
}

impl LoadedConfig {
    /// Validate the file and combine it with the secrets.
    pub fn build(file_config: FileConfig, secrets: Secrets) -> Result<Self, ConfigError> {
        validate(&file_config)?;

        if secrets.ipn_secret.is_none() {
            tracing::warn!(
                "{IPN_SECRET_ENV} is not set; every processor callback will be rejected"
            );
        }
        if secrets.processor_api_key.is_none() {
            tracing::warn!(
                "{PROCESSOR_API_KEY_ENV} is not set; minimums fall back to the safe floor and payment creation is unavailable"
            );
        }

        Ok(Self {
            server: ServerConfig {
                listen: file_config.server.listen,
            },
            processor: ProcessorConfig {
                api_base: file_config.processor.api_base,
                ipn_callback_url: file_config.processor.ipn_callback_url,
                payment_window_minutes: file_config.processor.payment_window_minutes,
                api_key: secrets.processor_api_key,
                ipn_secret: secrets
                    .ipn_secret
                    .map(|s| s.into_bytes().into_boxed_slice()),
                payout_callback_url: file_config.processor.payout_callback_url,
                payout_operators: file_config.processor.payout_operators,
                payout_credentials: secrets.payout_credentials,
            },
            prices: PricesConfig {
                api_url: file_config.prices.api_url,
            },
            limits: AmountLimits {
                tip_min_usd: file_config.limits.tip_min_usd,
                tip_max_usd: file_config.limits.tip_max_usd,
                max_usd: file_config.limits.max_usd,
            },
            auth: AuthConfig {
                supabase_url: file_config.auth.supabase_url,
                service_role_key: secrets.service_role_key,
            },
            realtime: RealtimeConfig {
                poll_interval_secs: file_config.realtime.poll_interval_secs,
            },
        })
    }

    /// Convert into a SharedConfig with Arc<RwLock<T>> wrappers.
    pub fn into_shared(self) -> SharedConfig {
        SharedConfig::new(
            self.server,
            self.processor,
            self.prices,
            self.limits,
            self.auth,
            self.realtime,
        )
    }

    /// Replace every section of `shared` in place (used during SIGHUP).
    pub async fn apply_to(self, shared: &SharedConfig) {
        *shared.server.write().await = self.server;
        *shared.processor.write().await = self.processor;
        *shared.prices.write().await = self.prices;
        *shared.limits.write().await = self.limits;
        *shared.auth.write().await = self.auth;
        *shared.realtime.write().await = self.realtime;
    }
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: std::path::PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file
    /// 2. Apply CLI overrides
    /// 3. Read secrets from the environment
    /// 4. Validate and build the loaded configuration
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        let mut file_config: FileConfig = toml::from_str(&config_content)?;

        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }

        LoadedConfig::build(file_config, Secrets::from_env())
    }

    /// Reload the configuration (used during SIGHUP).
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }
}

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    if config.processor.payment_window_minutes == 0 {
        return Err(ConfigError::ValidationError(
            "processor.payment_window_minutes must be positive".to_owned(),
        ));
    }
    let limits = &config.limits;
    if limits.tip_min_usd <= Decimal::ZERO || limits.max_usd <= Decimal::ZERO {
        return Err(ConfigError::ValidationError("limits must be positive".to_owned()));
    }
    if limits.tip_min_usd > limits.tip_max_usd {
        return Err(ConfigError::ValidationError(format!(
            "limits.tip_min_usd ({}) exceeds limits.tip_max_usd ({})",
            limits.tip_min_usd, limits.tip_max_usd
        )));
    }
    if config.realtime.poll_interval_secs == 0 {
        return Err(ConfigError::ValidationError(
            "realtime.poll_interval_secs must be positive".to_owned(),
        ));
    }
    Ok(())
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var(DATABASE_URL_ENV).map_err(|_| ConfigError::MissingDatabaseUrl)
}
