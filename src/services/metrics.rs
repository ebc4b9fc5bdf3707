use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_int_counter, CounterVec, Gauge, IntCounter,
};
use tracing::{debug, warn};

use super::accounts::AccountSecurityStore;

lazy_static! {
    // ── Auth service ────────────────────────────────────────────────────────
    pub static ref LOGINS_COUNTER: CounterVec = register_counter_vec!(
        "auth_logins_total",
        "Login attempts by outcome",
        &["status"]
    ).unwrap();

    pub static ref LOCKOUTS_COUNTER: IntCounter = register_int_counter!(
        "auth_account_lockouts_total",
        "Accounts locked after repeated failed logins"
    ).unwrap();

    pub static ref TOKENS_ISSUED_COUNTER: CounterVec = register_counter_vec!(
        "auth_tokens_issued_total",
        "Tokens issued by type",
        &["type"]
    ).unwrap();

    pub static ref REFRESH_COUNTER: CounterVec = register_counter_vec!(
        "auth_token_refresh_total",
        "Refresh attempts by outcome",
        &["status"]
    ).unwrap();

    pub static ref LOCKED_ACCOUNTS_GAUGE: Gauge = register_gauge!(
        "auth_locked_accounts",
        "Accounts whose lock flag is currently set"
    ).unwrap();

    // ── Rate limiting ───────────────────────────────────────────────────────
    pub static ref RATE_LIMIT_DENIED_COUNTER: CounterVec = register_counter_vec!(
        "rate_limit_denied_total",
        "Requests rejected by a rate limiter",
        &["scope"]
    ).unwrap();

    pub static ref RATE_LIMIT_FAIL_OPEN_COUNTER: CounterVec = register_counter_vec!(
        "rate_limit_fail_open_total",
        "Requests admitted because the counter store failed",
        &["scope"]
    ).unwrap();

    // ── Gateway ─────────────────────────────────────────────────────────────
    pub static ref GATEWAY_RESPONSES_COUNTER: CounterVec = register_counter_vec!(
        "gateway_responses_total",
        "Gateway responses by route and status class",
        &["route", "class"]
    ).unwrap();

    pub static ref SUSPICIOUS_REQUESTS_COUNTER: IntCounter = register_int_counter!(
        "gateway_suspicious_requests_total",
        "Requests rejected by threat screening"
    ).unwrap();

    pub static ref CIRCUIT_REJECTIONS_COUNTER: CounterVec = register_counter_vec!(
        "gateway_circuit_rejections_total",
        "Requests short-circuited by an open upstream circuit",
        &["route"]
    ).unwrap();
}

pub fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Spawn the background gauge collector (refreshes every 5 minutes).
pub fn start(store: Arc<dyn AccountSecurityStore>) {
    tokio::spawn(async move {
        loop {
            match store.list_locked().await {
                Ok(locked) => {
                    LOCKED_ACCOUNTS_GAUGE.set(locked.len() as f64);
                    debug!("Metrics: {} locked account(s)", locked.len());
                }
                Err(e) => warn!("Metrics: collection failed: {}", e),
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert_eq!(status_class(200), "2xx");
        assert_eq!(status_class(429), "4xx");
        assert_eq!(status_class(503), "5xx");
    }
}
