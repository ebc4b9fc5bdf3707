//! Key-scoped fixed-window admission counter.
//!
//! The counter for a key is created by its first increment, carries a TTL equal
//! to the window and disappears when the TTL lapses. Store failures never block
//! traffic: [`RateLimiter::allow`] admits the request and records the failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use super::metrics::{RATE_LIMIT_DENIED_COUNTER, RATE_LIMIT_FAIL_OPEN_COUNTER};

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Counter store did not answer within {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments `key`, setting its TTL to `window` when the
    /// increment created it. Returns the new count.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, CounterError>;
}

// INCR and EXPIRE in one round trip so a dropped connection cannot leave a
// counter without a TTL.
const INCR_WITH_TTL: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

#[derive(Clone)]
pub struct RedisCounterStore {
    conn: redis::aio::MultiplexedConnection,
    script: Arc<redis::Script>,
    timeout: Duration,
}

impl RedisCounterStore {
    pub fn new(conn: redis::aio::MultiplexedConnection) -> Self {
        Self {
            conn,
            script: Arc::new(redis::Script::new(INCR_WITH_TTL)),
            timeout: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, CounterError> {
        let mut conn = self.conn.clone();
        let secs = window.as_secs().max(1);
        let mut invocation = self.script.key(key);
        invocation.arg(secs);
        let call = invocation.invoke_async(&mut conn);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => {
                let count: u64 = result?;
                Ok(count)
            }
            Err(_) => Err(CounterError::Timeout(self.timeout)),
        }
    }
}

/// Process-local counters; correct for a single instance only.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<String, (u64, Instant)>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops counters whose window has lapsed.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.counters.retain(|_, (_, expires_at)| *expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Spawns a task that sweeps lapsed counters every `every`.
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                match store.upgrade() {
                    Some(store) => store.sweep(),
                    None => break,
                }
            }
        });
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, CounterError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert((0, now + window));
        let (count, expires_at) = entry.value_mut();
        if *expires_at <= now {
            *count = 0;
            *expires_at = now + window;
        }
        *count += 1;
        Ok(*count)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limit: u64,
    window: Duration,
    scope: Arc<str>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limit: u64, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
            scope: Arc::from("default"),
        }
    }

    /// Label used for this limiter's metrics and log lines.
    pub fn with_scope(mut self, scope: impl Into<Arc<str>>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// True while the count for `key` in the current window is within the
    /// limit. Fails open.
    pub async fn allow(&self, key: &str) -> bool {
        match self.store.increment(key, self.window).await {
            Ok(count) if count > self.limit => {
                RATE_LIMIT_DENIED_COUNTER
                    .with_label_values(&[self.scope.as_ref()])
                    .inc();
                false
            }
            Ok(_) => true,
            Err(e) => {
                RATE_LIMIT_FAIL_OPEN_COUNTER
                    .with_label_values(&[self.scope.as_ref()])
                    .inc();
                warn!(scope = %self.scope, key, error = %e, "rate limiter store failed, allowing request");
                true
            }
        }
    }
}

/// Redis-backed counters when `redis_url` is set and reachable, otherwise
/// process-local counters swept once a minute. Returns the store and its kind.
pub async fn connect_counter_store(redis_url: Option<&str>) -> (Arc<dyn CounterStore>, &'static str) {
    if let Some(url) = redis_url {
        let connected = match redis::Client::open(url) {
            Ok(client) => client.get_multiplexed_async_connection().await,
            Err(e) => Err(e),
        };
        match connected {
            Ok(conn) => {
                info!("Redis connected, rate limit counters are shared");
                let store: Arc<dyn CounterStore> = Arc::new(RedisCounterStore::new(conn));
                return (store, "redis");
            }
            Err(e) => warn!(error = %e, "Redis unavailable, falling back to in-memory counters"),
        }
    }
    let memory = Arc::new(InMemoryCounterStore::new());
    memory.start_sweeper(Duration::from_secs(60));
    let store: Arc<dyn CounterStore> = memory;
    (store, "memory")
}
