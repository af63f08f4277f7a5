//! Crypto payment server
//!
//! Quotes crypto prices, opens processor payment sessions and reconciles
//! processor callbacks into durable payment state.

mod api;
mod config;
mod server;
mod shutdown;
mod state;
#[cfg(test)]
mod test_support;

use clap::Parser;
use config::{ConfigLoader, get_database_url};
use cryptopay_core::framework::DatabaseProcessor;
use cryptopay_core::processors::DeadLetterRetrier;
use cryptopay_core::upstream::{CoinGeckoFeed, NowPaymentsGateway, SupabaseVerifier};
use cryptopay_core::utils::SystemClock;
use server::{build_router, run_server};
use shutdown::spawn_config_reload_handler;
use sqlx::postgres::PgPoolOptions;
use state::{Adapters, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Crypto payment server - price quotes, payment sessions and processor callbacks
#[derive(Parser, Debug)]
#[command(name = "cryptopay-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./cryptopay-config.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    init_tracing(args.log_json);

    tracing::info!("Starting cryptopay-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_loader = Arc::new(ConfigLoader::new(&args.config, args.listen));
    let loaded_config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;

    let listen_addr = loaded_config.server.listen;
    tracing::info!("Configuration loaded from {:?}", args.config);

    // Convert to shared config with separate locks for each section
    let shared_config = loaded_config.into_shared();

    // Get database URL from environment
    let database_url = get_database_url().map_err(|e| {
        tracing::error!("DATABASE_URL environment variable not set");
        e
    })?;

    // Create database connection pool
    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .map_err(|e| {
            tracing::error!("Failed to connect to database: {}", e);
            e
        })?;
    tracing::info!("Database connection established");

    // Run migrations if requested
    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to run migrations: {}", e);
                e
            })?;
        tracing::info!("Migrations completed successfully");
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()?;
    let database = Arc::new(DatabaseProcessor::new(db_pool.clone()));
    let clock = Arc::new(SystemClock);
    let adapters = Adapters {
        store: database.clone(),
        dead_letters: database.clone(),
        feed: Arc::new(CoinGeckoFeed::new(http.clone(), shared_config.prices.clone())),
        gateway: Arc::new(NowPaymentsGateway::new(
            http.clone(),
            shared_config.processor.clone(),
        )),
        auth: Arc::new(SupabaseVerifier::new(http, shared_config.auth.clone())),
        clock: clock.clone(),
    };

    // Create application state
    let state = AppState::new(shared_config, adapters);

    // Retry callbacks that could not be applied when they arrived
    let (retrier_shutdown_tx, retrier_shutdown_rx) = tokio::sync::watch::channel(false);
    let retrier = DeadLetterRetrier::new(
        state.reconciler.clone(),
        database,
        clock,
        retrier_shutdown_rx,
    );
    let retrier_handle = tokio::spawn(retrier.run());

    // Spawn config reload handler (listens for SIGHUP)
    let shutdown_notify = spawn_config_reload_handler(state.clone(), config_loader);

    // Build the router
    let router = build_router(state);

    // Run the server
    tracing::info!("Starting HTTP server on {}", listen_addr);
    let result = run_server(router, listen_addr).await;

    // Signal background tasks to stop
    shutdown_notify.notify_one();
    let _ = retrier_shutdown_tx.send(true);
    if let Err(e) = retrier_handle.await {
        tracing::error!("Dead letter retrier task failed: {}", e);
    }

    // Close database connections gracefully
    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
