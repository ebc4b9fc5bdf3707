use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use takeout_edge::config::GatewayConfig;
use takeout_edge::gateway::circuit_breaker::CircuitBreakerSettings;
use takeout_edge::gateway::proxy::HttpUpstream;
use takeout_edge::gateway::{self, ChainContext, GatewayState};
use takeout_edge::services::rate_limiter::connect_counter_store;
use takeout_edge::services::token::TokenCodec;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env()?;

    let codec = TokenCodec::from_secret(&config.jwt_secret).context("Invalid JWT_SECRET")?;

    let (counters, counter_kind) = connect_counter_store(config.redis_url.as_deref()).await;

    let upstream = HttpUpstream::new(
        Duration::from_secs(config.upstream_timeout_seconds),
        CircuitBreakerSettings {
            failure_threshold: config.circuit_failure_threshold,
            open_for: Duration::from_secs(config.circuit_open_seconds),
        },
    )?;

    let ctx = ChainContext {
        codec,
        counters,
        default_limit: config.default_rate_limit,
        default_window: Duration::from_secs(config.default_rate_window_seconds),
        upstream: Arc::new(upstream),
    };
    let routes = gateway::compile_routes(&config.routes, &ctx)?;
    for route in &routes {
        info!(
            route = %route.config.id,
            prefix = %route.config.path_prefix,
            upstream = %route.config.upstream,
            filters = route.config.filters.len(),
            "Route registered"
        );
    }

    let app = gateway::router(GatewayState::new(routes, counter_kind));

    let addr = format!("{}:{}", config.host, config.port);
    info!("api-gateway listening on {} (counters: {})", addr, counter_kind);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
