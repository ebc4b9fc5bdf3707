//! Forwarding to downstream services.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tracing::{error, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerSettings};
use crate::error::AppError;
use crate::middleware::client_ip::X_FORWARDED_FOR;
use crate::middleware::trace::current_trace_id;
use crate::services::metrics::CIRCUIT_REJECTIONS_COUNTER;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Where a route forwards to.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub id: String,
    pub path_prefix: String,
    pub upstream: String,
    pub strip_prefix: bool,
}

impl RouteTarget {
    pub fn upstream_url(&self, uri: &Uri) -> String {
        let path = uri.path();
        let forwarded = if self.strip_prefix {
            path.strip_prefix(self.path_prefix.as_str()).unwrap_or(path)
        } else {
            path
        };
        let base = self.upstream.trim_end_matches('/');
        match uri.query() {
            Some(q) => format!("{base}{forwarded}?{q}"),
            None => format!("{base}{forwarded}"),
        }
    }
}

/// Final stage of every route chain.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, target: &RouteTarget, request: Request) -> Response;
}

/// Fallback answer when a downstream service cannot be reached.
pub fn fallback_response(service: &str) -> Response {
    let body = json!({
        "error": "Service Unavailable",
        "service": service,
        "message": format!("The {service} is temporarily unavailable. Please try again later."),
        "status": 503,
        "suggestion": "Please retry in a few moments. If the problem persists, contact support.",
        "timestamp": Utc::now(),
        "traceId": current_trace_id(),
    });
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: Option<SocketAddr>) {
    let Some(peer) = peer else { return };
    let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {}", peer.ip()),
        None => peer.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

pub struct HttpUpstream {
    client: reqwest::Client,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    breaker_settings: CircuitBreakerSettings,
}

impl HttpUpstream {
    pub fn new(timeout: Duration, breaker_settings: CircuitBreakerSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            breakers: DashMap::new(),
            breaker_settings,
        })
    }

    fn breaker_for(&self, route_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(route_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(route_id, self.breaker_settings)))
            .clone()
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn forward(&self, target: &RouteTarget, request: Request) -> Response {
        let breaker = self.breaker_for(&target.id);
        // Dropping the permit unsettled (cancellation, local rejection) frees a
        // half-open probe slot without counting an outcome.
        let Some(permit) = breaker.try_acquire() else {
            CIRCUIT_REJECTIONS_COUNTER
                .with_label_values(&[target.id.as_str()])
                .inc();
            warn!(route = %target.id, "circuit open, serving fallback");
            return fallback_response(&target.id);
        };

        let url = target.upstream_url(request.uri());
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let (parts, body) = request.into_parts();

        let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return AppError::PayloadTooLarge(format!(
                    "Request body exceeds {MAX_BODY_BYTES} bytes"
                ))
                .into_response();
            }
        };

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::CONTENT_LENGTH);
        append_forwarded_for(&mut headers, peer);

        let result = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(bytes)
            .send()
            .await;

        let upstream = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                permit.failure();
                warn!(route = %target.id, url = %url, "upstream timed out");
                return AppError::GatewayTimeout(format!("{} did not respond in time", target.id))
                    .into_response();
            }
            Err(e) => {
                permit.failure();
                error!(route = %target.id, url = %url, error = %e, "upstream request failed");
                return fallback_response(&target.id);
            }
        };

        let status = upstream.status();
        if status.is_server_error() {
            permit.failure();
        } else {
            permit.success();
        }

        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        response_headers.remove(header::CONTENT_LENGTH);

        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(e) => {
                error!(route = %target.id, error = %e, "failed to read upstream body");
                return fallback_response(&target.id);
            }
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::circuit_breaker::CircuitState;
    use tokio::net::TcpListener;

    fn target(strip: bool) -> RouteTarget {
        RouteTarget {
            id: "auth-service".into(),
            path_prefix: "/api/auth".into(),
            upstream: "http://auth:8081/api/v1/auth/".into(),
            strip_prefix: strip,
        }
    }

    #[test]
    fn upstream_url_strips_prefix_and_keeps_query() {
        let uri: Uri = "/api/auth/login?next=%2Fhome".parse().unwrap();
        assert_eq!(
            target(true).upstream_url(&uri),
            "http://auth:8081/api/v1/auth/login?next=%2Fhome"
        );
        assert_eq!(
            target(false).upstream_url(&uri),
            "http://auth:8081/api/v1/auth/api/auth/login?next=%2Fhome"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut h = HeaderMap::new();
        h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-secret-hop"));
        h.insert("x-secret-hop", HeaderValue::from_static("1"));
        h.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        h.insert(header::HOST, HeaderValue::from_static("gateway"));
        h.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        strip_hop_by_hop(&mut h);
        assert_eq!(h.len(), 1);
        assert!(h.contains_key(header::ACCEPT));
    }

    #[test]
    fn forwarded_for_is_appended() {
        let mut h = HeaderMap::new();
        h.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.7"));
        append_forwarded_for(&mut h, Some("10.0.0.9:4000".parse().unwrap()));
        assert_eq!(h.get(X_FORWARDED_FOR).unwrap(), "203.0.113.7, 10.0.0.9");
    }

    fn orders(upstream: String) -> RouteTarget {
        RouteTarget {
            id: "orders".into(),
            path_prefix: "/api/orders".into(),
            upstream,
            strip_prefix: false,
        }
    }

    fn post(body: Body) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/api/orders/1")
            .body(body)
            .unwrap()
    }

    async fn refused() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    async fn hanging() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{addr}")
    }

    async fn healthy() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().fallback(|| async { "ok" });
        tokio::spawn(async move { axum::serve(listener, app).await });
        format!("http://{addr}")
    }

    async fn half_open_upstream() -> HttpUpstream {
        let upstream = HttpUpstream::new(
            Duration::from_secs(5),
            CircuitBreakerSettings {
                failure_threshold: 1,
                open_for: Duration::from_millis(50),
            },
        )
        .unwrap();
        let response = upstream.forward(&orders(refused().await), post(Body::empty())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(upstream.breaker_for("orders").state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(80)).await;
        upstream
    }

    #[tokio::test]
    async fn cancelled_half_open_request_does_not_wedge_the_circuit() {
        let upstream = half_open_upstream().await;

        let stalled = tokio::time::timeout(
            Duration::from_millis(100),
            upstream.forward(&orders(hanging().await), post(Body::empty())),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(upstream.breaker_for("orders").state(), CircuitState::HalfOpen);

        let response = upstream.forward(&orders(healthy().await), post(Body::empty())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(upstream.breaker_for("orders").state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn oversized_body_is_413_and_leaves_breaker_half_open() {
        let upstream = half_open_upstream().await;
        let target = orders(healthy().await);

        let oversized = Body::from(vec![b'x'; MAX_BODY_BYTES + 1]);
        let response = upstream.forward(&target, post(oversized)).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(upstream.breaker_for("orders").state(), CircuitState::HalfOpen);

        let response = upstream.forward(&target, post(Body::from("{}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(upstream.breaker_for("orders").state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn fallback_is_503_with_service_name() {
        let response = fallback_response("order-service");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["service"], "order-service");
        assert_eq!(body["status"], 503);
        assert!(body["suggestion"].is_string());
    }
}
