use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use takeout_edge::config::AuthServiceConfig;
use takeout_edge::db::{self, PgAccountStore, PgRefreshTokenStore};
use takeout_edge::models::account::LockoutPolicy;
use takeout_edge::services::auth::{AuthService, AuthSettings};
use takeout_edge::services::metrics;
use takeout_edge::services::password::BcryptHasher;
use takeout_edge::services::rate_limiter::{connect_counter_store, RateLimiter};
use takeout_edge::services::token::TokenCodec;
use takeout_edge::{auth_router, AppState};

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AuthServiceConfig::from_env()?;

    let codec = TokenCodec::from_secret(&config.jwt.secret).context("Invalid JWT_SECRET")?;
    info!(algorithm = ?codec.algorithm(), "Token codec ready");

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database connected and migrations applied");

    let policy = LockoutPolicy {
        max_attempts: config.max_login_attempts,
        lock_duration: chrono::Duration::minutes(config.lockout_duration_minutes),
    };
    let accounts = Arc::new(PgAccountStore::new(pool.clone(), policy));
    let refresh_tokens = Arc::new(PgRefreshTokenStore::new(pool));

    let (counters, counter_kind) = connect_counter_store(config.redis_url.as_deref()).await;
    info!(store = counter_kind, "Login rate limiter ready");
    let login_limiter = RateLimiter::new(
        counters,
        config.login_rate_limit,
        Duration::from_secs(config.login_rate_window_seconds),
    )
    .with_scope("login");

    let settings = AuthSettings {
        access_ttl: chrono::Duration::seconds(config.jwt.access_ttl_seconds),
        refresh_ttl: chrono::Duration::days(config.jwt.refresh_ttl_days),
    };
    let auth = Arc::new(AuthService::new(
        accounts.clone(),
        accounts.clone(),
        refresh_tokens,
        codec,
        Arc::new(BcryptHasher::new(config.bcrypt_cost)),
        settings,
    ));

    metrics::start(accounts);

    // Hourly purge of expired and long-revoked refresh tokens
    let retention = chrono::Duration::days(config.token_retention_days);
    let purger = auth.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match purger.purge_tokens(retention).await {
                Ok(0) => {}
                Ok(n) => info!("Purged {} stale refresh token(s)", n),
                Err(e) => error!("Refresh token purge failed: {}", e),
            }
        }
    });

    let app = auth_router(AppState {
        auth,
        login_limiter,
    });

    let addr = format!("{}:{}", config.host, config.port);
    info!("auth-service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
