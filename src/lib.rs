// Library exports for both binaries and tests
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use middleware::trace::trace_tag;
use services::auth::AuthService;
use services::rate_limiter::RateLimiter;

/// Application state shared across all auth-service handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub login_limiter: RateLimiter,
}

/// The auth-service HTTP surface.
pub fn auth_router(state: AppState) -> Router {
    let codec = state.auth.codec().clone();

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::metrics::metrics_handler))
        // Auth
        .route("/api/v1/auth/login", post(routes::auth::login))
        .route("/api/v1/auth/register", post(routes::auth::register))
        .route("/api/v1/auth/refresh", post(routes::auth::refresh))
        .route("/api/v1/auth/logout", post(routes::auth::logout))
        .route("/api/v1/auth/logout-all", post(routes::auth::logout_all))
        .route("/api/v1/auth/change-password", post(routes::auth::change_password))
        .route("/api/v1/auth/me", get(routes::auth::me))
        .route("/api/v1/auth/sessions", get(routes::auth::sessions))
        // Administration
        .route("/api/v1/auth/admin/accounts/locked", get(routes::auth::locked_accounts))
        .route("/api/v1/auth/admin/accounts/{id}/unlock", post(routes::auth::unlock_account))
        .route("/api/v1/auth/admin/accounts/{id}/lock", post(routes::auth::lock_account))
        .route("/api/v1/auth/admin/accounts/{id}/deactivate", post(routes::auth::deactivate_account))
        .route("/api/v1/auth/admin/accounts/{id}/activate", post(routes::auth::activate_account))
        .layer(axum::Extension(codec))
        .layer(from_fn(trace_tag))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}
