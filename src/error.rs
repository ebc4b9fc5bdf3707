//! HTTP boundary error type shared by both binaries.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::middleware::trace::current_trace_id;
use crate::services::auth::AuthError;
use crate::services::StoreError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Too many requests")]
    RateLimited,

    #[error("Request contains suspicious content")]
    SuspiciousContent,

    #[error("Upstream timed out: {0}")]
    GatewayTimeout(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error")]
    Internal(String),
}

/// What the client should do about the failure.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    Retry,
    FixInput,
    ContactSupport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub status: u16,
    pub error: String,
    pub code: &'static str,
    pub message: String,
    pub action: ErrorAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorBody {
    pub fn new(status: StatusCode, code: &'static str, message: String, action: ErrorAction) -> Self {
        Self {
            status: status.as_u16(),
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code,
            message,
            action,
            trace_id: current_trace_id(),
            timestamp: Utc::now(),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String, ErrorAction) {
        use ErrorAction::*;
        match self {
            AppError::Auth(e) => auth_parts(e),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", m.clone(), FixInput),
            AppError::Forbidden(m) => (StatusCode::FORBIDDEN, "forbidden", m.clone(), ContactSupport),
            AppError::Validation(m) => (StatusCode::BAD_REQUEST, "validation_error", m.clone(), FixInput),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.clone(), FixInput),
            AppError::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", m.clone(), FixInput),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests. Please try again later.".into(),
                Retry,
            ),
            AppError::SuspiciousContent => (
                StatusCode::BAD_REQUEST,
                "suspicious_content",
                "Request rejected: suspicious content detected".into(),
                FixInput,
            ),
            AppError::GatewayTimeout(m) => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", m.clone(), Retry),
            AppError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", m.clone(), Retry),
            AppError::Internal(_) => internal(),
        }
    }
}

fn internal() -> (StatusCode, &'static str, String, ErrorAction) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_error",
        "Internal server error".into(),
        ErrorAction::ContactSupport,
    )
}

fn auth_parts(e: &AuthError) -> (StatusCode, &'static str, String, ErrorAction) {
    use ErrorAction::*;
    let msg = e.to_string();
    match e {
        AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid_credentials", msg, FixInput),
        AuthError::AccountLocked { until: Some(until) } => (
            StatusCode::FORBIDDEN,
            "account_locked",
            format!("Account is temporarily locked until {}", until.to_rfc3339()),
            Retry,
        ),
        AuthError::AccountLocked { until: None } => (
            StatusCode::FORBIDDEN,
            "account_locked",
            "Account is locked. Please contact support.".into(),
            ContactSupport,
        ),
        AuthError::AccountInactive => (
            StatusCode::FORBIDDEN,
            "account_inactive",
            "Account is inactive. Please contact support.".into(),
            ContactSupport,
        ),
        AuthError::EmailTaken => (StatusCode::BAD_REQUEST, "email_taken", msg, FixInput),
        AuthError::InvalidToken(_) => (StatusCode::UNAUTHORIZED, "invalid_token", msg, FixInput),
        AuthError::TokenNotFound => (StatusCode::UNAUTHORIZED, "token_not_found", msg, FixInput),
        AuthError::TokenRevoked => (StatusCode::UNAUTHORIZED, "token_revoked", msg, FixInput),
        AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "token_expired", msg, FixInput),
        AuthError::WrongPassword => (StatusCode::BAD_REQUEST, "wrong_password", msg, FixInput),
        AuthError::Validation(m) => (StatusCode::BAD_REQUEST, "validation_error", m.clone(), FixInput),
        AuthError::PrincipalNotFound => (StatusCode::NOT_FOUND, "not_found", msg, FixInput),
        AuthError::Configuration(_) | AuthError::Hashing(_) | AuthError::Store(_) => internal(),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, action) = self.parts();
        if status.is_server_error() {
            tracing::error!(code, "request failed: {}", self);
        }
        let body = ErrorBody::new(status, code, message, action);
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::Auth(AuthError::Store(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::token::TokenError;
    use chrono::Duration;

    #[test]
    fn statuses_and_actions() {
        let cases = [
            (AppError::from(AuthError::InvalidCredentials), 401, ErrorAction::FixInput),
            (
                AppError::from(AuthError::AccountLocked {
                    until: Some(Utc::now() + Duration::minutes(5)),
                }),
                403,
                ErrorAction::Retry,
            ),
            (
                AppError::from(AuthError::AccountLocked { until: None }),
                403,
                ErrorAction::ContactSupport,
            ),
            (AppError::from(AuthError::AccountInactive), 403, ErrorAction::ContactSupport),
            (AppError::from(AuthError::EmailTaken), 400, ErrorAction::FixInput),
            (
                AppError::from(AuthError::InvalidToken(TokenError::Expired)),
                401,
                ErrorAction::FixInput,
            ),
            (AppError::from(AuthError::TokenRevoked), 401, ErrorAction::FixInput),
            (AppError::RateLimited, 429, ErrorAction::Retry),
            (AppError::SuspiciousContent, 400, ErrorAction::FixInput),
            (AppError::PayloadTooLarge("body".into()), 413, ErrorAction::FixInput),
            (AppError::Internal("boom".into()), 500, ErrorAction::ContactSupport),
        ];
        for (err, status, action) in cases {
            let (s, _, _, a) = err.parts();
            assert_eq!(s.as_u16(), status, "{err}");
            assert_eq!(a, action, "{err}");
        }
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let (_, code, message, _) = AppError::Internal("db password=hunter2".into()).parts();
        assert_eq!(code, "internal_error");
        assert!(!message.contains("hunter2"));
    }
}
