//! Request tracing interceptor.
//!
//! Applied to the host router with
//! `axum::middleware::from_fn_with_state`. Each traced request gets a
//! 32-hex trace ID, surfaced in the `X-Pulse-Trace-ID` response header and
//! made ambient through a task-local so the query interceptor can correlate
//! queries to their request. Recording is fire-and-forget and never blocks
//! the response path.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::header::{CONTENT_LENGTH, USER_AGENT};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use rand::{Rng, RngCore};

use crate::engine::Pulse;
use crate::errors::HandlerError;
use crate::model::RequestRecord;
use crate::util;

/// Response header carrying the request's trace ID.
pub static TRACE_HEADER: HeaderName = HeaderName::from_static("x-pulse-trace-id");

/// Ambient identity of the request currently being served.
#[derive(Debug, Clone)]
pub struct TraceContext {
    /// 32 hex characters, unique per request.
    pub trace_id: String,
    /// Router template of the matched route, e.g. `/users/{id}`.
    pub route: String,
}

tokio::task_local! {
    static CURRENT: TraceContext;
}

/// The trace context of the enclosing request, if any.
///
/// Returns `None` on background tasks and on requests that tracing skipped.
pub fn current_trace() -> Option<TraceContext> {
    CURRENT.try_with(Clone::clone).ok()
}

/// Generate a 32-hex trace ID from 16 random bytes.
pub fn generate_trace_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Whether `path` is excluded from tracing.
pub(crate) fn is_excluded(pulse: &Pulse, path: &str) -> bool {
    // Built-ins: the engine's own routes and favicon probes.
    if path.starts_with(&pulse.config().prefix) || path == "/favicon.ico" {
        return true;
    }
    pulse
        .config()
        .tracing
        .exclude
        .iter()
        .any(|pattern| util::glob_match(pattern, path))
}

/// Tracing middleware. Wraps the downstream handler, measures it, and
/// records a [`RequestRecord`] subject to sampling.
pub async fn track_requests(
    State(pulse): State<Arc<Pulse>>,
    request: Request,
    next: Next,
) -> Response {
    if !pulse.config().tracing.is_enabled() {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    if is_excluded(&pulse, &path) {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| path.clone(), |m| m.as_str().to_string());
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let client_ip = util::client_ip(request.headers());
    let request_bytes = content_length(request.headers());

    let context = TraceContext {
        trace_id: generate_trace_id(),
        route: route.clone(),
    };

    let started = Instant::now();
    let mut response = CURRENT.scope(context.clone(), next.run(request)).await;
    let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

    if let Ok(value) = HeaderValue::from_str(&context.trace_id) {
        response.headers_mut().insert(TRACE_HEADER.clone(), value);
    }
    // Hand the context to outer middleware (the error interceptor runs
    // outside this layer and correlates through it).
    response.extensions_mut().insert(context.clone());

    let status = response.status().as_u16();
    let error = response
        .extensions()
        .get::<HandlerError>()
        .map(|e| e.0.clone());

    let tracing_cfg = &pulse.config().tracing;
    let is_error = status >= 400;
    let is_slow = latency_ms >= tracing_cfg.slow_request_ms as f64;
    let is_sampled = sample(tracing_cfg.sample_rate);

    // N+1 tracking state for this request is complete either way.
    pulse.n1().finish_trace(&context.trace_id);

    if is_error || is_slow || is_sampled {
        let record = RequestRecord {
            method: method.clone(),
            route: route.clone(),
            status,
            latency_ms,
            request_bytes,
            response_bytes: content_length(response.headers()),
            client_ip,
            user_agent,
            error,
            trace_id: context.trace_id.clone(),
            timestamp: Utc::now(),
        };
        pulse.submit_request(record);

        pulse.broadcast(
            crate::live::LiveChannel::Request,
            serde_json::json!({
                "method": method,
                "path": route,
                "status": status,
                "latency_ms": latency_ms,
                "trace_id": context.trace_id,
            }),
        );
    }

    response
}

fn content_length(headers: &axum::http::HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn sample(rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    rand::thread_rng().gen::<f64>() < rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_32_hex_and_unique() {
        let a = generate_trace_id();
        let b = generate_trace_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn sampling_boundaries() {
        assert!(sample(1.0));
        assert!(sample(2.0));
        assert!(!sample(0.0));
        assert!(!sample(-1.0));
    }

    #[test]
    fn no_ambient_trace_outside_requests() {
        assert!(current_trace().is_none());
    }

    #[tokio::test]
    async fn task_local_scoping() {
        let context = TraceContext {
            trace_id: generate_trace_id(),
            route: "/users/{id}".into(),
        };
        let seen = CURRENT
            .scope(context.clone(), async { current_trace() })
            .await;
        assert_eq!(seen.unwrap().trace_id, context.trace_id);
        assert!(current_trace().is_none());
    }
}
