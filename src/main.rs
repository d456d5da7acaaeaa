use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use ynab_broker::api::oauth::{YnabOAuthClient, YnabOAuthConfig};
use ynab_broker::api::{create_app, run_state_cleanup, CronAppState, OAuthAppState, StateStore};
use ynab_broker::auth::SqliteSessionProvider;
use ynab_broker::clock::system_clock;
use ynab_broker::config::BrokerConfig;
use ynab_broker::credentials::{TokenCipher, TokenStore, TokenVault};
use ynab_broker::db::Database;
use ynab_broker::error::BrokerError;
use ynab_broker::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> Result<()> {
    ynab_broker::logging::init();

    info!("YNAB broker starting...");

    let config = load_config().context("Refusing to start")?;

    info!(
        environment = ?config.security.environment,
        bind_addr = %config.server.bind_addr,
        database = %config.database.path,
        "Configuration loaded"
    );

    let clock = system_clock();
    let db = Database::open(&config.database.path).context("Failed to open database")?;

    let cipher = TokenCipher::new(config.encryption_secret()?, config.encryption_salt()?)
        .context("Failed to initialize token cipher")?;
    info!("Token cipher initialized");

    let oauth_client = Arc::new(
        YnabOAuthClient::from_config(&config.ynab).context("Failed to build YNAB client")?,
    );

    let vault = Arc::new(TokenVault::new(
        TokenStore::new(db.clone()),
        cipher,
        oauth_client.clone(),
        clock.clone(),
    ));
    let state_store = StateStore::new(db.clone(), clock.clone());

    let oauth_state = OAuthAppState {
        sessions: Arc::new(SqliteSessionProvider::new(db.clone(), clock.clone())),
        state_store: state_store.clone(),
        vault,
        oauth_client,
        oauth_config: YnabOAuthConfig::from_config(&config.ynab),
    };
    let cron_state = CronAppState {
        state_store: state_store.clone(),
        cron_secret: config.security.cron_secret.clone(),
        environment: config.security.environment,
        clock: clock.clone(),
    };
    let rate_limiter = Arc::new(RateLimiter::new(clock));

    if config.state.cleanup_interval_seconds > 0 {
        tokio::spawn(run_state_cleanup(
            state_store,
            config.state.cleanup_interval_seconds,
        ));
        info!(
            interval_seconds = config.state.cleanup_interval_seconds,
            "OAuth state cleanup task started"
        );
    }

    let router = create_app(oauth_state, cron_state, rate_limiter);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "YNAB broker listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("YNAB broker stopped");
    Ok(())
}

/// Loads and validates configuration. Any failure here prevents boot.
fn load_config() -> Result<BrokerConfig, BrokerError> {
    let config = BrokerConfig::load()?;
    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl_c signal");
    }
    info!("Shutdown signal received");
}
