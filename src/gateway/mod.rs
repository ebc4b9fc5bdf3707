//! Edge gateway: per-route filter chains in front of downstream services.
//!
//! Every configured route compiles into its own axum `Router` whose only
//! handler is the forwarder, wrapped by the route's filters in declaration
//! order (the first filter sees the request first). The outer router matches
//! the route by longest path prefix and hands the request to its chain.

pub mod circuit_breaker;
pub mod filters;
pub mod proxy;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Request, State},
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::config::{FilterSpec, RouteConfig};
use crate::error::AppError;
use crate::routes;
use crate::services::metrics::{status_class, GATEWAY_RESPONSES_COUNTER};
use crate::services::rate_limiter::{CounterStore, RateLimiter};
use crate::services::token::TokenCodec;
use filters::{authenticate, rate_limit, threat_screen, trace_tag, AuthenticateFilter};
use proxy::{RouteTarget, Upstream};

/// Everything a route chain needs besides its own configuration.
#[derive(Clone)]
pub struct ChainContext {
    pub codec: TokenCodec,
    pub counters: Arc<dyn CounterStore>,
    pub default_limit: u64,
    pub default_window: Duration,
    pub upstream: Arc<dyn Upstream>,
}

#[derive(Clone)]
pub struct CompiledRoute {
    pub config: RouteConfig,
    chain: Router,
}

#[derive(Clone)]
pub struct GatewayState {
    pub routes: Arc<Vec<CompiledRoute>>,
    /// `redis` or `memory`.
    pub counter_store: &'static str,
    pub started_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn new(routes: Vec<CompiledRoute>, counter_store: &'static str) -> Self {
        Self {
            routes: Arc::new(routes),
            counter_store,
            started_at: Utc::now(),
        }
    }

    /// Longest prefix wins; a prefix only matches on a segment boundary.
    pub fn match_route(&self, path: &str) -> Option<&CompiledRoute> {
        self.routes
            .iter()
            .filter(|r| prefix_matches(&r.config.path_prefix, path))
            .max_by_key(|r| r.config.path_prefix.trim_end_matches('/').len())
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Clone)]
struct ForwardState {
    upstream: Arc<dyn Upstream>,
    target: Arc<RouteTarget>,
}

async fn forward(State(state): State<ForwardState>, request: Request) -> Response {
    state.upstream.forward(&state.target, request).await
}

pub fn compile_route(route: &RouteConfig, ctx: &ChainContext) -> anyhow::Result<CompiledRoute> {
    let target = RouteTarget {
        id: route.id.clone(),
        path_prefix: route.path_prefix.trim_end_matches('/').to_string(),
        upstream: route.upstream.clone(),
        strip_prefix: route.strip_prefix,
    };
    let mut chain = Router::new().fallback(forward).with_state(ForwardState {
        upstream: ctx.upstream.clone(),
        target: Arc::new(target),
    });

    // Layers wrap outward, so the last one added runs first.
    for spec in route.filters.iter().rev() {
        chain = match spec {
            FilterSpec::TraceTag => chain.layer(from_fn(trace_tag)),
            FilterSpec::ThreatScreen => chain.layer(from_fn(threat_screen)),
            FilterSpec::Authenticate(settings) => {
                let filter = AuthenticateFilter::new(ctx.codec.clone(), settings)
                    .with_context(|| format!("route {}: invalid bypass pattern", route.id))?;
                chain.layer(from_fn_with_state(filter, authenticate))
            }
            FilterSpec::RateLimit(settings) => {
                let limit = settings.limit.unwrap_or(ctx.default_limit);
                let window = settings
                    .window_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(ctx.default_window);
                if limit == 0 || window.is_zero() {
                    anyhow::bail!("route {}: rate limit and window must be positive", route.id);
                }
                let limiter =
                    RateLimiter::new(ctx.counters.clone(), limit, window).with_scope(route.id.as_str());
                chain.layer(from_fn_with_state(limiter, rate_limit))
            }
        };
    }

    Ok(CompiledRoute {
        config: route.clone(),
        chain,
    })
}

pub fn compile_routes(
    routes: &[RouteConfig],
    ctx: &ChainContext,
) -> anyhow::Result<Vec<CompiledRoute>> {
    routes.iter().map(|r| compile_route(r, ctx)).collect()
}

async fn dispatch(State(state): State<GatewayState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some(route) = state.match_route(&path) else {
        return AppError::NotFound(format!("No route matches {path}")).into_response();
    };

    let response = match route.chain.clone().oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    GATEWAY_RESPONSES_COUNTER
        .with_label_values(&[
            route.config.id.as_str(),
            status_class(response.status().as_u16()),
        ])
        .inc();
    response
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/health", get(routes::gateway::health))
        .route("/api/routes", get(routes::gateway::list_routes))
        .route("/metrics", get(routes::metrics::metrics_handler))
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
