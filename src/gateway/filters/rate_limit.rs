use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::middleware::client_ip::client_identity;
use crate::middleware::rate_limit::check_rate_limit;
use crate::services::rate_limiter::RateLimiter;

pub fn rate_limit_key(client: &str, path: &str) -> String {
    format!("rate_limit:{client}:{path}")
}

/// Counts the request against (client identity, path) and answers 429 once
/// the route's limit is exceeded.
pub async fn rate_limit(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identity(request.headers(), peer);
    let key = rate_limit_key(&client, request.uri().path());

    if let Err(rejection) = check_rate_limit(&limiter, &key).await {
        return rejection.into_response();
    }
    next.run(request).await
}
