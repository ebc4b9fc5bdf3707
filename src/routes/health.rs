use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.auth.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "UP",
                "service": "auth-service",
                "store": "connected",
                "timestamp": Utc::now(),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "DOWN",
                "service": "auth-service",
                "store": e.to_string(),
                "timestamp": Utc::now(),
            })),
        ),
    }
}
