use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    middleware::{
        auth::AdminUser,
        client_ip::ClientIp,
        json::ApiJson,
        rate_limit::{check_rate_limit, login_key},
    },
    models::{
        account::LockedAccount,
        auth::AuthenticatedUser,
        refresh_token::SessionInfo,
        user::{
            ChangePasswordRequest, LockAccountRequest, LoginRequest, LoginResponse,
            LogoutRequest, RefreshTokenRequest, RegisterRequest, TokenResponse, UserInfo,
        },
    },
    services::auth::{normalize_email, ClientContext, Registration},
    AppState,
};

const TOKEN_TYPE: &str = "Bearer";
const MAX_DEVICE_INFO_LEN: usize = 255;

fn device_info(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.chars().take(MAX_DEVICE_INFO_LEN).collect())
}

/// POST /api/v1/auth/login
pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    ApiJson(body): ApiJson<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    // Per-email limit: 10 attempts per 15 min by default
    let key = login_key(&normalize_email(&body.email));
    check_rate_limit(&state.login_limiter, &key).await?;

    let client = ClientContext {
        device_info: device_info(&headers),
        ip_address: Some(ip),
    };
    let outcome = state.auth.login(&body.email, &body.password, client).await?;

    Ok(Json(LoginResponse {
        access_token: outcome.tokens.access_token,
        refresh_token: outcome.tokens.refresh_token,
        token_type: TOKEN_TYPE,
        expires_in: outcome.tokens.expires_in,
        user: outcome.principal.into(),
    }))
}

/// POST /api/v1/auth/register
///
/// New accounts always get the default role; a `role` in the body is ignored.
pub async fn register(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RegisterRequest>,
) -> AppResult<(StatusCode, Json<UserInfo>)> {
    if let Some(role) = body.role {
        info!(requested = %role, "ignoring requested role on self-registration");
    }
    let principal = state
        .auth
        .register(Registration {
            email: body.email,
            password: body.password,
            first_name: body.first_name,
            last_name: body.last_name,
            phone: body.phone,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(principal.into())))
}

/// POST /api/v1/auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RefreshTokenRequest>,
) -> AppResult<Json<TokenResponse>> {
    let tokens = state.auth.refresh(&body.refresh_token).await?;
    Ok(Json(TokenResponse {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        token_type: TOKEN_TYPE,
        expires_in: tokens.expires_in,
    }))
}

/// POST /api/v1/auth/logout
///
/// The body is optional; without a refresh token there is nothing to revoke.
pub async fn logout(State(state): State<AppState>, body: Bytes) -> AppResult<Json<Value>> {
    let request: LogoutRequest = if body.iter().all(u8::is_ascii_whitespace) {
        LogoutRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Validation(format!("Invalid logout body: {e}")))?
    };
    state.auth.logout(request.refresh_token.as_deref()).await?;
    Ok(Json(json!({ "message": "Logged out" })))
}

/// POST /api/v1/auth/logout-all
pub async fn logout_all(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let revoked = state.auth.logout_all(user.user_id).await?;
    Ok(Json(json!({ "message": "Logged out from all devices", "revokedSessions": revoked })))
}

/// POST /api/v1/auth/change-password
pub async fn change_password(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ApiJson(body): ApiJson<ChangePasswordRequest>,
) -> AppResult<Json<Value>> {
    state
        .auth
        .change_password(user.user_id, &body.current_password, &body.new_password)
        .await?;
    Ok(Json(json!({ "message": "Password changed. Please sign in again." })))
}

/// GET /api/v1/auth/me
pub async fn me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<UserInfo>> {
    let principal = state.auth.principal(user.user_id).await?;
    Ok(Json(principal.into()))
}

/// GET /api/v1/auth/sessions
pub async fn sessions(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<SessionInfo>>> {
    let sessions = state.auth.sessions(user.user_id).await?;
    Ok(Json(sessions.into_iter().map(SessionInfo::from).collect()))
}

// ── Administration ──────────────────────────────────────────────────────────

/// GET /api/v1/auth/admin/accounts/locked
pub async fn locked_accounts(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> AppResult<Json<Vec<LockedAccount>>> {
    Ok(Json(state.auth.locked_accounts().await?))
}

/// POST /api/v1/auth/admin/accounts/{id}/unlock
pub async fn unlock_account(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.auth.unlock(id).await?;
    info!(admin = %admin.email, user_id = %id, "account unlocked");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/auth/admin/accounts/{id}/lock
pub async fn lock_account(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
    ApiJson(body): ApiJson<LockAccountRequest>,
) -> AppResult<StatusCode> {
    state.auth.lock(id, body.locked_until).await?;
    info!(admin = %admin.email, user_id = %id, until = ?body.locked_until, "account locked");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/auth/admin/accounts/{id}/deactivate
pub async fn deactivate_account(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    if admin.user_id == id {
        return Err(AppError::Validation("Administrators cannot deactivate themselves".into()));
    }
    state.auth.set_active(id, false).await?;
    info!(admin = %admin.email, user_id = %id, "account deactivated");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/auth/admin/accounts/{id}/activate
pub async fn activate_account(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.auth.set_active(id, true).await?;
    info!(admin = %admin.email, user_id = %id, "account activated");
    Ok(StatusCode::NO_CONTENT)
}
