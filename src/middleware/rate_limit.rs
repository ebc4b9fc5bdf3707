use tracing::warn;

use crate::error::AppError;
use crate::services::rate_limiter::RateLimiter;

/// Checks a keyed limit and turns a denial into a 429.
///
/// Counting follows [`RateLimiter::allow`]: INCR, TTL on the first increment,
/// and admission when the counter store is unreachable.
pub async fn check_rate_limit(limiter: &RateLimiter, key: &str) -> Result<(), AppError> {
    if limiter.allow(key).await {
        return Ok(());
    }
    warn!(key, limit = limiter.limit(), "rate limit exceeded");
    Err(AppError::RateLimited)
}

pub fn login_key(email: &str) -> String {
    format!("login_attempts:{email}")
}
