use axum::{extract::State, Json};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::FilterSpec;
use crate::gateway::GatewayState;

/// GET /api/health
pub async fn health(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": "UP",
        "service": "api-gateway",
        "counterStore": state.counter_store,
        "routes": state.routes.len(),
        "startedAt": state.started_at,
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub id: String,
    pub path_prefix: String,
    pub upstream: String,
    pub strip_prefix: bool,
    pub filters: Vec<FilterSpec>,
}

/// GET /api/routes: the compiled route table, filters in execution order.
pub async fn list_routes(State(state): State<GatewayState>) -> Json<Vec<RouteSummary>> {
    Json(
        state
            .routes
            .iter()
            .map(|r| RouteSummary {
                id: r.config.id.clone(),
                path_prefix: r.config.path_prefix.clone(),
                upstream: r.config.upstream.clone(),
                strip_prefix: r.config.strip_prefix,
                filters: r.config.filters.clone(),
            })
            .collect(),
    )
}
