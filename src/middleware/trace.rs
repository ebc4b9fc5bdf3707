//! Correlation ids.
//!
//! The id is scoped to the task serving the request (`tokio::task_local!`), so
//! anything running inside the request, error bodies included, can read it
//! without global state.

use std::time::Instant;

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};
use uuid::Uuid;

pub const TRACE_ID_HEADER: HeaderName = HeaderName::from_static("x-trace-id");
pub const CORRELATION_ID_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

const MAX_INBOUND_LEN: usize = 64;

tokio::task_local! {
    static TRACE_ID: String;
}

/// The trace id of the request being served, if any.
pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(|id| id.clone()).ok()
}

/// Request extension carrying the trace id.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

pub fn generate_trace_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn inbound_trace_id(headers: &HeaderMap) -> Option<String> {
    [&TRACE_ID_HEADER, &CORRELATION_ID_HEADER]
        .into_iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|v| is_acceptable_id(v))
        .map(str::to_owned)
}

fn is_acceptable_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_INBOUND_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// Logs requests dropped before a response was produced (client gone).
struct Completion {
    trace_id: String,
    method: Method,
    path: String,
    started: Instant,
    finished: bool,
}

impl Completion {
    fn finish(mut self, status: u16) {
        self.finished = true;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        if status >= 500 {
            warn!(trace_id = %self.trace_id, method = %self.method, path = %self.path, status, elapsed_ms, "request failed");
        } else {
            info!(trace_id = %self.trace_id, method = %self.method, path = %self.path, status, elapsed_ms, "request completed");
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.finished {
            let elapsed_ms = self.started.elapsed().as_millis() as u64;
            info!(trace_id = %self.trace_id, method = %self.method, path = %self.path, elapsed_ms, "request abandoned");
        }
    }
}

/// Propagates or generates the trace id and stamps it on the request and the
/// response. A caller that sent `X-Correlation-ID` gets it echoed back too.
/// Never short-circuits.
pub async fn trace_tag(mut request: Request, next: Next) -> Response {
    let trace_id = inbound_trace_id(request.headers()).unwrap_or_else(generate_trace_id);
    let echo_correlation = request.headers().contains_key(CORRELATION_ID_HEADER);
    let header = HeaderValue::from_str(&trace_id).ok();

    if let Some(value) = &header {
        request.headers_mut().insert(TRACE_ID_HEADER, value.clone());
    }
    request.extensions_mut().insert(TraceId(trace_id.clone()));

    let completion = Completion {
        trace_id: trace_id.clone(),
        method: request.method().clone(),
        path: request.uri().path().to_string(),
        started: Instant::now(),
        finished: false,
    };

    let mut response = TRACE_ID.scope(trace_id, next.run(request)).await;
    completion.finish(response.status().as_u16());

    if let Some(value) = header {
        if echo_correlation {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value.clone());
        }
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}
