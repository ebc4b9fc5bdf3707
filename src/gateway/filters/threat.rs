use axum::{
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::error::AppError;
use crate::services::metrics::SUSPICIOUS_REQUESTS_COUNTER;

const SUSPICIOUS_VALUE_PATTERNS: [&str; 8] = [
    "script",
    "javascript",
    "onload",
    "onerror",
    "eval",
    "alert",
    "document.cookie",
    "window.location",
];

const SUSPICIOUS_NAME_FRAGMENTS: [&str; 2] = ["script", "inject"];

const SECURITY_HEADERS: [(&str, &str); 7] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    (
        "strict-transport-security",
        "max-age=31536000; includeSubDomains; preload",
    ),
    (
        "content-security-policy",
        "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline';",
    ),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    (
        "permissions-policy",
        "camera=(), microphone=(), location=(), payment=()",
    ),
];

/// Name of the first header that looks like an injection attempt.
///
/// The `Authorization` value is opaque token material and is not inspected;
/// its name still is.
pub fn find_suspicious_header(headers: &HeaderMap) -> Option<HeaderName> {
    for (name, value) in headers {
        let lowered_name = name.as_str();
        if SUSPICIOUS_NAME_FRAGMENTS
            .iter()
            .any(|f| lowered_name.contains(f))
        {
            return Some(name.clone());
        }
        if name == header::AUTHORIZATION {
            continue;
        }
        let lowered = String::from_utf8_lossy(value.as_bytes()).to_lowercase();
        if SUSPICIOUS_VALUE_PATTERNS.iter().any(|p| lowered.contains(p)) {
            return Some(name.clone());
        }
    }
    None
}

pub fn apply_security_headers(headers: &mut HeaderMap) {
    for (name, value) in SECURITY_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    headers.remove(header::SERVER);
    headers.remove("x-powered-by");
}

/// Rejects requests carrying script-injection markers in their headers and
/// hardens every response that passes through.
pub async fn threat_screen(request: Request, next: Next) -> Response {
    if let Some(name) = find_suspicious_header(request.headers()) {
        SUSPICIOUS_REQUESTS_COUNTER.inc();
        warn!(header = %name, path = %request.uri().path(), "suspicious header content rejected");
        let mut response = AppError::SuspiciousContent.into_response();
        apply_security_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_security_headers(response.headers_mut());
    response
}
