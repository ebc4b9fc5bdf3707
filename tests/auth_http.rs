use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use takeout_edge::models::account::LockoutPolicy;
use takeout_edge::models::user::{NewPrincipal, UserRole};
use takeout_edge::services::accounts::AccountStore;
use takeout_edge::services::auth::{AuthService, AuthSettings};
use takeout_edge::services::memory::{InMemoryAccountStore, InMemoryRefreshTokenStore};
use takeout_edge::services::password::{BcryptHasher, PasswordHasher};
use takeout_edge::services::rate_limiter::{InMemoryCounterStore, RateLimiter};
use takeout_edge::services::token::TokenCodec;
use takeout_edge::{auth_router, AppState};

const PASSWORD: &str = "correct horse battery";

fn app_with_login_limit(limit: u64) -> (Router, Arc<InMemoryAccountStore>) {
    let accounts = Arc::new(InMemoryAccountStore::new(LockoutPolicy {
        max_attempts: 3,
        lock_duration: chrono::Duration::minutes(30),
    }));
    let auth = AuthService::new(
        accounts.clone(),
        accounts.clone(),
        Arc::new(InMemoryRefreshTokenStore::new()),
        TokenCodec::from_key_bytes(&[5u8; 48]).unwrap(),
        Arc::new(BcryptHasher::new(4)),
        AuthSettings::default(),
    );
    let login_limiter = RateLimiter::new(
        Arc::new(InMemoryCounterStore::new()),
        limit,
        Duration::from_secs(900),
    )
    .with_scope("login");
    let app = auth_router(AppState {
        auth: Arc::new(auth),
        login_limiter,
    });
    (app, accounts)
}

fn app() -> (Router, Arc<InMemoryAccountStore>) {
    app_with_login_limit(50)
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn with_bearer(method: &str, uri: &str, token: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
}

async fn register(app: &Router, email: &str) -> Value {
    let (status, body) = call(
        app,
        post_json(
            "/api/v1/auth/register",
            json!({ "email": email, "password": PASSWORD, "firstName": "Ana" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body
}

async fn login(app: &Router, email: &str, password: &str) -> (StatusCode, Value) {
    call(
        app,
        post_json(
            "/api/v1/auth/login",
            json!({ "email": email, "password": password }),
        ),
    )
    .await
}

async fn create_admin(accounts: &InMemoryAccountStore) {
    accounts
        .create(NewPrincipal {
            email: "root@example.com".into(),
            password_hash: BcryptHasher::new(4).hash(PASSWORD).unwrap(),
            first_name: None,
            last_name: None,
            phone: None,
            role: UserRole::Admin,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn register_ignores_a_requested_role() {
    let (app, _) = app();
    let (status, body) = call(
        &app,
        post_json(
            "/api/v1/auth/register",
            json!({ "email": "mallory@example.com", "password": PASSWORD, "role": "ADMIN" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["role"], "CUSTOMER");
    assert!(body.get("passwordHash").is_none());
}

#[tokio::test]
async fn register_ignores_roles_outside_the_known_set() {
    let (app, _) = app();
    for (i, role) in [json!("admin"), json!("SUPERUSER"), json!(3)].into_iter().enumerate() {
        let (status, body) = call(
            &app,
            post_json(
                "/api/v1/auth/register",
                json!({ "email": format!("eve{i}@example.com"), "password": PASSWORD, "role": role }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{role}");
        assert_eq!(body["role"], "CUSTOMER");
    }
}

#[tokio::test]
async fn malformed_bodies_are_400_with_the_error_body() {
    let (app, _) = app();
    let malformed = Request::post("/api/v1/auth/register")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"email\": "))
        .unwrap();
    let (status, body) = call(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
    assert_eq!(body["action"], "fix_input");
    assert!(body["traceId"].is_string());

    let (status, body) = call(
        &app,
        post_json("/api/v1/auth/login", json!({ "email": "ana@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn login_then_me() {
    let (app, _) = app();
    register(&app, "ana@example.com").await;

    let (status, body) = login(&app, "ana@example.com", PASSWORD).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokenType"], "Bearer");
    assert_eq!(body["expiresIn"], 900);
    assert_eq!(body["user"]["email"], "ana@example.com");
    let access = body["accessToken"].as_str().unwrap();

    let (status, me) = call(
        &app,
        with_bearer("GET", "/api/v1/auth/me", access)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["fullName"], "Ana");
    assert!(me["lastLoginAt"].is_string());
}

#[tokio::test]
async fn bad_credentials_get_a_uniform_error_body() {
    let (app, _) = app();
    register(&app, "ana@example.com").await;

    let (status, body) = login(&app, "ana@example.com", "nope nope nope").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "invalid_credentials");
    assert_eq!(body["action"], "fix_input");
    assert_eq!(body["status"], 401);
    assert!(body["traceId"].is_string());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn lockout_is_reported_with_a_retry_hint() {
    let (app, _) = app();
    register(&app, "ana@example.com").await;

    for _ in 0..3 {
        let (status, _) = login(&app, "ana@example.com", "nope nope nope").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let (status, body) = login(&app, "ana@example.com", PASSWORD).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "account_locked");
    assert_eq!(body["action"], "retry");
}

#[tokio::test]
async fn login_attempts_are_rate_limited_per_email() {
    let (app, _) = app_with_login_limit(2);
    register(&app, "ana@example.com").await;

    login(&app, "ana@example.com", "nope nope nope").await;
    login(&app, "ANA@example.com", "nope nope nope").await;
    let (status, body) = login(&app, "ana@example.com", PASSWORD).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "rate_limited");

    // Other emails keep their own budget.
    let (status, _) = login(&app, "someone@example.com", PASSWORD).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_and_logout() {
    let (app, _) = app();
    register(&app, "ana@example.com").await;
    let (_, body) = login(&app, "ana@example.com", PASSWORD).await;
    let refresh = body["refreshToken"].as_str().unwrap().to_string();

    let (status, tokens) = call(
        &app,
        post_json("/api/v1/auth/refresh", json!({ "refreshToken": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tokens["refreshToken"], refresh.as_str());
    assert!(tokens["accessToken"].is_string());

    let (status, _) = call(
        &app,
        post_json("/api/v1/auth/logout", json!({ "refreshToken": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &app,
        post_json("/api/v1/auth/refresh", json!({ "refreshToken": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "token_revoked");
}

#[tokio::test]
async fn logout_without_a_body_is_accepted() {
    let (app, _) = app();
    let (status, _) = call(
        &app,
        Request::post("/api/v1/auth/logout").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn protected_endpoints_require_a_bearer_token() {
    let (app, _) = app();
    let (status, body) = call(
        &app,
        Request::get("/api/v1/auth/me").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = call(
        &app,
        with_bearer("GET", "/api/v1/auth/sessions", "garbage")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn sessions_record_the_device() {
    let (app, _) = app();
    register(&app, "ana@example.com").await;
    let (_, body) = call(
        &app,
        Request::post("/api/v1/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::USER_AGENT, "TakeoutApp/3.2 (iOS)")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.2")
            .body(Body::from(
                json!({ "email": "ana@example.com", "password": PASSWORD }).to_string(),
            ))
            .unwrap(),
    )
    .await;
    let access = body["accessToken"].as_str().unwrap();

    let (status, sessions) = call(
        &app,
        with_bearer("GET", "/api/v1/auth/sessions", access)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sessions = sessions.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["deviceInfo"], "TakeoutApp/3.2 (iOS)");
    assert_eq!(sessions[0]["ipAddress"], "203.0.113.7");
}

#[tokio::test]
async fn change_password_ends_existing_sessions() {
    let (app, _) = app();
    register(&app, "ana@example.com").await;
    let (_, body) = login(&app, "ana@example.com", PASSWORD).await;
    let access = body["accessToken"].as_str().unwrap();
    let refresh = body["refreshToken"].as_str().unwrap();

    let (status, body) = call(
        &app,
        with_bearer("POST", "/api/v1/auth/change-password", access)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "currentPassword": "wrong wrong", "newPassword": "brand new secret" })
                    .to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "wrong_password");

    let (status, _) = call(
        &app,
        with_bearer("POST", "/api/v1/auth/change-password", access)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "currentPassword": PASSWORD, "newPassword": "brand new secret" })
                    .to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &app,
        post_json("/api/v1/auth/refresh", json!({ "refreshToken": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_endpoints_require_the_admin_role() {
    let (app, accounts) = app();
    let customer = register(&app, "ana@example.com").await;
    let customer_id = customer["id"].as_str().unwrap().to_string();
    create_admin(&accounts).await;

    let (_, body) = login(&app, "ana@example.com", PASSWORD).await;
    let customer_token = body["accessToken"].as_str().unwrap().to_string();
    let (status, _) = call(
        &app,
        with_bearer("GET", "/api/v1/auth/admin/accounts/locked", &customer_token)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, body) = login(&app, "root@example.com", PASSWORD).await;
    let admin_token = body["accessToken"].as_str().unwrap().to_string();

    let (status, _) = call(
        &app,
        with_bearer(
            "POST",
            &format!("/api/v1/auth/admin/accounts/{customer_id}/lock"),
            &admin_token,
        )
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, locked) = call(
        &app,
        with_bearer("GET", "/api/v1/auth/admin/accounts/locked", &admin_token)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(locked[0]["id"], customer_id.as_str());
    assert_eq!(locked[0]["locked"], true);

    let (status, body) = login(&app, "ana@example.com", PASSWORD).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["action"], "contact_support");

    let (status, _) = call(
        &app,
        with_bearer(
            "POST",
            &format!("/api/v1/auth/admin/accounts/{customer_id}/unlock"),
            &admin_token,
        )
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = login(&app, "ana@example.com", PASSWORD).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_reports_up() {
    let (app, _) = app();
    let (status, body) = call(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "UP");
}
