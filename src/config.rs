use std::env;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Token settings shared by the issuer and the gateway.
#[derive(Debug, Clone)]
pub struct JwtSettings {
    pub secret: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_days: i64,
}

impl JwtSettings {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            secret: required("JWT_SECRET")?,
            access_ttl_seconds: parsed("JWT_ACCESS_TTL_SECONDS", 900)?,
            refresh_ttl_days: parsed("JWT_REFRESH_TTL_DAYS", 7)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AuthServiceConfig {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub jwt: JwtSettings,
    pub max_login_attempts: u32,
    pub lockout_duration_minutes: i64,
    pub login_rate_limit: u64,
    pub login_rate_window_seconds: u64,
    pub bcrypt_cost: u32,
    pub token_retention_days: i64,
    pub host: String,
    pub port: u16,
}

impl AuthServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: optional("REDIS_URL"),
            jwt: JwtSettings::from_env()?,
            max_login_attempts: parsed("MAX_LOGIN_ATTEMPTS", 5)?,
            lockout_duration_minutes: parsed("LOCKOUT_DURATION_MINUTES", 30)?,
            login_rate_limit: parsed("LOGIN_RATE_LIMIT", 10)?,
            login_rate_window_seconds: parsed("LOGIN_RATE_WINDOW_SECONDS", 900)?,
            bcrypt_cost: parsed("BCRYPT_COST", 12)?,
            token_retention_days: parsed("REFRESH_TOKEN_RETENTION_DAYS", 30)?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parsed("PORT", 8081)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub jwt_secret: String,
    pub redis_url: Option<String>,
    pub default_rate_limit: u64,
    pub default_rate_window_seconds: u64,
    pub upstream_timeout_seconds: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_open_seconds: u64,
    pub routes: Vec<RouteConfig>,
    pub host: String,
    pub port: u16,
}

impl GatewayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let default_rate_limit = parsed("DEFAULT_RATE_LIMIT", 10)?;
        let default_rate_window_seconds = parsed("DEFAULT_RATE_WINDOW_SECONDS", 60)?;

        let routes = match optional("GATEWAY_ROUTES_FILE") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read route table {path}"))?;
                parse_routes(&raw).with_context(|| format!("Invalid route table {path}"))?
            }
            None => default_routes(&ServiceUrls::from_env()),
        };

        Ok(Self {
            jwt_secret: required("JWT_SECRET")?,
            redis_url: optional("REDIS_URL"),
            default_rate_limit,
            default_rate_window_seconds,
            upstream_timeout_seconds: parsed("UPSTREAM_TIMEOUT_SECONDS", 30)?,
            circuit_failure_threshold: parsed("CIRCUIT_FAILURE_THRESHOLD", 5)?,
            circuit_open_seconds: parsed("CIRCUIT_OPEN_SECONDS", 30)?,
            routes,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parsed("PORT", 8080)?,
        })
    }
}

/// One gateway route: requests whose path starts with `path_prefix` run
/// through `filters` in order and are forwarded to `upstream`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub id: String,
    pub path_prefix: String,
    pub upstream: String,
    /// Remove `path_prefix` before appending the path to `upstream`.
    #[serde(default)]
    pub strip_prefix: bool,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum FilterSpec {
    TraceTag,
    ThreatScreen,
    Authenticate(AuthenticateSettings),
    RateLimit(RateLimitSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthenticateSettings {
    pub require_auth: bool,
    /// Regexes matched against the whole request path.
    pub bypass_paths: Vec<String>,
}

impl Default for AuthenticateSettings {
    fn default() -> Self {
        Self {
            require_auth: true,
            bypass_paths: Vec::new(),
        }
    }
}

/// Unset fields fall back to the gateway-wide defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub limit: Option<u64>,
    pub window_seconds: Option<u64>,
}

pub fn parse_routes(raw: &str) -> anyhow::Result<Vec<RouteConfig>> {
    let routes: Vec<RouteConfig> = serde_json::from_str(raw)?;
    for route in &routes {
        if !route.path_prefix.starts_with('/') {
            anyhow::bail!("route {}: pathPrefix must start with '/'", route.id);
        }
        if !(route.upstream.starts_with("http://") || route.upstream.starts_with("https://")) {
            anyhow::bail!("route {}: upstream must be an http(s) URL", route.id);
        }
    }
    Ok(routes)
}

#[derive(Debug, Clone)]
pub struct ServiceUrls {
    pub auth: String,
    pub users: String,
    pub restaurants: String,
    pub orders: String,
}

impl ServiceUrls {
    pub fn from_env() -> Self {
        Self {
            auth: env::var("AUTH_SERVICE_URL").unwrap_or_else(|_| "http://localhost:8081".into()),
            users: env::var("USER_SERVICE_URL").unwrap_or_else(|_| "http://localhost:8082".into()),
            restaurants: env::var("RESTAURANT_SERVICE_URL")
                .unwrap_or_else(|_| "http://localhost:8083".into()),
            orders: env::var("ORDER_SERVICE_URL").unwrap_or_else(|_| "http://localhost:8084".into()),
        }
    }
}

/// Built-in route table used when no route file is configured.
pub fn default_routes(urls: &ServiceUrls) -> Vec<RouteConfig> {
    let protected = || {
        vec![
            FilterSpec::TraceTag,
            FilterSpec::ThreatScreen,
            FilterSpec::Authenticate(AuthenticateSettings::default()),
            FilterSpec::RateLimit(RateLimitSettings::default()),
        ]
    };

    vec![
        RouteConfig {
            id: "auth-service".into(),
            path_prefix: "/api/auth".into(),
            upstream: format!("{}/api/v1/auth", urls.auth.trim_end_matches('/')),
            strip_prefix: true,
            filters: vec![
                FilterSpec::TraceTag,
                FilterSpec::ThreatScreen,
                FilterSpec::Authenticate(AuthenticateSettings {
                    require_auth: false,
                    bypass_paths: Vec::new(),
                }),
                FilterSpec::RateLimit(RateLimitSettings::default()),
            ],
        },
        RouteConfig {
            id: "user-service".into(),
            path_prefix: "/api/users".into(),
            upstream: urls.users.clone(),
            strip_prefix: false,
            filters: protected(),
        },
        RouteConfig {
            id: "restaurant-service".into(),
            path_prefix: "/api/restaurants".into(),
            upstream: urls.restaurants.clone(),
            strip_prefix: false,
            filters: vec![
                FilterSpec::TraceTag,
                FilterSpec::ThreatScreen,
                FilterSpec::Authenticate(AuthenticateSettings {
                    require_auth: true,
                    bypass_paths: vec![
                        "/api/restaurants/?".into(),
                        "/api/restaurants/search".into(),
                        "/api/restaurants/[0-9a-fA-F-]+".into(),
                        "/api/restaurants/[0-9a-fA-F-]+/menu".into(),
                    ],
                }),
                FilterSpec::RateLimit(RateLimitSettings::default()),
            ],
        },
        RouteConfig {
            id: "order-service".into(),
            path_prefix: "/api/orders".into(),
            upstream: urls.orders.clone(),
            strip_prefix: false,
            filters: protected(),
        },
    ]
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn parsed<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {key}: {raw}")),
        None => Ok(default),
    }
}
