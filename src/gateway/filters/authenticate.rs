use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use regex::RegexSet;
use tracing::{debug, warn};

use crate::config::AuthenticateSettings;
use crate::error::AppError;
use crate::middleware::auth::bearer_token;
use crate::models::auth::AuthenticatedUser;
use crate::services::token::TokenCodec;

pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_USER_EMAIL: HeaderName = HeaderName::from_static("x-user-email");
pub const X_USER_ROLE: HeaderName = HeaderName::from_static("x-user-role");
pub const X_USER_EMAIL_VERIFIED: HeaderName = HeaderName::from_static("x-user-email-verified");
pub const X_AUTHENTICATED: HeaderName = HeaderName::from_static("x-authenticated");

#[derive(Clone)]
pub struct AuthenticateFilter {
    codec: TokenCodec,
    require_auth: bool,
    bypass: Arc<RegexSet>,
}

impl AuthenticateFilter {
    pub fn new(codec: TokenCodec, settings: &AuthenticateSettings) -> Result<Self, regex::Error> {
        let anchored = settings.bypass_paths.iter().map(|p| format!("^(?:{p})$"));
        Ok(Self {
            codec,
            require_auth: settings.require_auth,
            bypass: Arc::new(RegexSet::new(anchored)?),
        })
    }

    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass.is_match(path)
    }
}

/// Removes identity headers a client may have supplied itself.
pub fn strip_identity_headers(headers: &mut HeaderMap) {
    let forged: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("x-user-") || *name == X_AUTHENTICATED)
        .cloned()
        .collect();
    for name in forged {
        headers.remove(&name);
    }
}

fn inject_identity(headers: &mut HeaderMap, user: &AuthenticatedUser) {
    let pairs = [
        (X_USER_ID, user.user_id.to_string()),
        (X_USER_EMAIL, user.email.clone()),
        (X_USER_ROLE, user.role.to_string()),
        (X_USER_EMAIL_VERIFIED, user.email_verified.to_string()),
        (X_AUTHENTICATED, "true".to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

/// Verifies the bearer token and forwards verified identity as headers.
///
/// Identity headers are always stripped first, so downstream services only
/// ever see values this filter produced.
pub async fn authenticate(
    State(filter): State<AuthenticateFilter>,
    mut request: Request,
    next: Next,
) -> Response {
    strip_identity_headers(request.headers_mut());

    let path = request.uri().path().to_string();
    if !filter.require_auth || filter.is_bypassed(&path) {
        debug!(path = %path, "authentication not required");
        return next.run(request).await;
    }

    let user = match bearer_token(request.headers()) {
        Ok(token) => match filter.codec.verify_access(token) {
            Ok(user) => user,
            Err(e) => {
                warn!(path = %path, reason = %e, "token rejected");
                return AppError::Unauthorized("Invalid or expired token".into()).into_response();
            }
        },
        Err(e) => {
            warn!(path = %path, "missing or malformed bearer token");
            return e.into_response();
        }
    };

    inject_identity(request.headers_mut(), &user);
    request.extensions_mut().insert(user);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(bypass: &[&str]) -> AuthenticateFilter {
        let codec = TokenCodec::from_key_bytes(&[3u8; 32]).unwrap();
        AuthenticateFilter::new(
            codec,
            &AuthenticateSettings {
                require_auth: true,
                bypass_paths: bypass.iter().map(|s| s.to_string()).collect(),
            },
        )
        .unwrap()
    }

    #[test]
    fn bypass_patterns_match_the_whole_path() {
        let f = filter(&["/api/restaurants/?", "/api/restaurants/[0-9]+"]);
        assert!(f.is_bypassed("/api/restaurants"));
        assert!(f.is_bypassed("/api/restaurants/"));
        assert!(f.is_bypassed("/api/restaurants/42"));
        assert!(!f.is_bypassed("/api/restaurants/42/orders"));
        assert!(!f.is_bypassed("/x/api/restaurants"));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let codec = TokenCodec::from_key_bytes(&[3u8; 32]).unwrap();
        let settings = AuthenticateSettings {
            require_auth: true,
            bypass_paths: vec!["(".into()],
        };
        assert!(AuthenticateFilter::new(codec, &settings).is_err());
    }

    #[test]
    fn forged_identity_headers_are_removed() {
        let mut h = HeaderMap::new();
        h.insert("x-user-id", HeaderValue::from_static("someone-else"));
        h.insert("x-user-role", HeaderValue::from_static("ADMIN"));
        h.insert("x-authenticated", HeaderValue::from_static("true"));
        h.insert("x-trace-id", HeaderValue::from_static("abcd1234"));
        strip_identity_headers(&mut h);
        assert_eq!(h.len(), 1);
        assert!(h.contains_key("x-trace-id"));
    }
}
