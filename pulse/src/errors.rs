//! Error interceptor.
//!
//! The outermost middleware layer: it sees every panic, handler-emitted
//! error and 5xx response from the layers and handlers beneath it. Captured
//! errors are classified, fingerprinted and merged into storage; recording a
//! failure never changes the host's response. The one exception is a panic, which
//! is converted into a 500.

use std::cell::RefCell;
use std::sync::{Arc, Once};

use axum::body::Body;
use axum::extract::{MatchedPath, Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use futures::FutureExt;
use tracing::debug;
use uuid::Uuid;

use crate::classify;
use crate::engine::Pulse;
use crate::model::{ErrorKind, ErrorRecord, RequestContext};
use crate::trace::TraceContext;

/// An error a handler wants surfaced in the dashboard.
///
/// Insert into the response extensions; the interceptor picks up the first
/// one:
///
/// ```ignore
/// let mut response = (StatusCode::BAD_GATEWAY, "upstream failed").into_response();
/// response.extensions_mut().insert(HandlerError::new("upstream failed"));
/// ```
#[derive(Debug, Clone)]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

// ============================================================================
// Panic capture
// ============================================================================

struct CapturedPanic {
    message: String,
    stack: String,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<CapturedPanic>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Install a process-wide panic hook that stashes the panic message and a
/// cleaned backtrace in a thread-local, chained in front of the previous
/// hook. Unwinding stays on the panicking thread up to `catch_unwind`, so
/// the interceptor can read the stash after the catch.
pub(crate) fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let message = info
                .payload()
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            let stack =
                classify::clean_stack(&std::backtrace::Backtrace::force_capture().to_string());
            LAST_PANIC.with(|cell| {
                *cell.borrow_mut() = Some(CapturedPanic { message, stack });
            });
            previous(info);
        }));
    });
}

fn take_captured_panic() -> Option<CapturedPanic> {
    LAST_PANIC.with(|cell| cell.borrow_mut().take())
}

// ============================================================================
// Middleware
// ============================================================================

/// Error-capturing middleware; apply outermost.
pub async fn capture_errors(
    State(pulse): State<Arc<Pulse>>,
    request: Request,
    next: Next,
) -> Response {
    if !pulse.config().errors.is_enabled() {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| path.clone(), |m| m.as_str().to_string());
    let query = request.uri().query().map(ToString::to_string);
    let headers = classify::redact_headers(request.headers());
    let client_ip = crate::util::client_ip(request.headers());

    let (request, body_text) = maybe_capture_body(&pulse, request).await;

    let context = RequestContext {
        path,
        query,
        headers,
        body: body_text,
        client_ip,
    };

    let outcome = std::panic::AssertUnwindSafe(next.run(request))
        .catch_unwind()
        .await;

    match outcome {
        Ok(response) => {
            observe_response(&pulse, &method, &route, context, &response);
            response
        }
        Err(payload) => {
            let captured = take_captured_panic();
            let message = captured.as_ref().map_or_else(
                || {
                    payload
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panic".to_string())
                },
                |c| c.message.clone(),
            );
            let stack = captured.map(|c| c.stack);

            record_error(
                &pulse,
                &method,
                &route,
                &message,
                ErrorKind::Panic,
                stack,
                context,
            );

            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "internal server error"})),
            )
                .into_response()
        }
    }
}

/// Buffer the request body for error context when enabled, re-attaching a
/// replayable copy so handlers still see it.
///
/// Bodies longer than the configured cap are passed through untouched.
async fn maybe_capture_body(pulse: &Pulse, request: Request) -> (Request, Option<String>) {
    let errors_cfg = &pulse.config().errors;
    if !errors_cfg.capture_body {
        return (request, None);
    }
    let length: usize = match request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
    {
        Some(len) if len > 0 && len <= errors_cfg.max_body_bytes => len,
        _ => return (request, None),
    };

    let (parts, body) = request.into_parts();
    match axum::body::to_bytes(body, length).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let request = Request::from_parts(parts, Body::from(bytes));
            (request, Some(text))
        }
        Err(e) => {
            debug!(error = %e, "Failed to buffer request body for error context");
            (Request::from_parts(parts, Body::empty()), None)
        }
    }
}

/// Inspect a completed response for a handler-emitted error or a synthesized
/// 5xx and record it.
fn observe_response(
    pulse: &Pulse,
    method: &str,
    route: &str,
    context: RequestContext,
    response: &Response,
) {
    let status = response.status();

    let message = if let Some(err) = response.extensions().get::<HandlerError>() {
        Some(err.0.clone())
    } else if status.is_server_error() {
        Some(format!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("server error")
        ))
    } else {
        None
    };

    let Some(message) = message else { return };

    let kind = classify::classify(&message, status.as_u16());
    // Prefer the route the tracing layer resolved; it is attached to the
    // response by the inner middleware.
    let route = response
        .extensions()
        .get::<TraceContext>()
        .map_or(route, |t| t.route.as_str());

    record_error(pulse, method, route, &message, kind, None, context);
}

fn record_error(
    pulse: &Pulse,
    method: &str,
    route: &str,
    message: &str,
    kind: ErrorKind,
    stack: Option<String>,
    context: RequestContext,
) {
    let now = Utc::now();
    let record = ErrorRecord {
        id: Uuid::new_v4(),
        fingerprint: classify::fingerprint(method, route, message),
        method: method.to_string(),
        route: route.to_string(),
        message: message.to_string(),
        kind,
        stack,
        context: Some(context),
        count: 1,
        first_seen: now,
        last_seen: now,
        muted: false,
        resolved: false,
    };

    let merged_count = pulse.submit_error(record);

    pulse.broadcast(
        crate::live::LiveChannel::Error,
        serde_json::json!({
            "route": route,
            "message": message,
            "type": kind,
            "count": merged_count,
        }),
    );
}
