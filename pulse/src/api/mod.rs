//! Engine router.
//!
//! Everything Pulse serves under its mount prefix: the public health probes,
//! the Prometheus exposition, the live WebSocket channel, and the
//! JWT-protected dashboard API.

pub mod auth;
pub mod error;
pub mod export;
pub mod handlers;

use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;

use crate::engine::Pulse;
use crate::{live, metrics};

/// Build the engine's sub-router. Mounted under the configured prefix by
/// [`Pulse::instrument`] / [`Pulse::router`].
pub(crate) fn router(pulse: Arc<Pulse>) -> Router {
    let mut public = Router::new()
        .route("/health", get(handlers::health))
        .route("/health/live", get(handlers::health_live))
        .route("/health/ready", get(handlers::health_ready))
        .route("/ws/live", get(live::ws_live));

    if pulse.config().metrics_enabled() {
        public = public.route("/metrics", get(metrics::prometheus));
    }

    let protected = Router::new()
        .route("/auth/verify", get(auth::verify))
        .route("/overview", get(handlers::overview))
        .route("/routes", get(handlers::routes))
        .route("/routes/{method}/{*path}", get(handlers::route_detail))
        .route("/database/overview", get(handlers::database_overview))
        .route("/database/slow-queries", get(handlers::slow_queries))
        .route("/database/patterns", get(handlers::query_patterns))
        .route("/database/n1", get(handlers::n1_detections))
        .route("/database/pool", get(handlers::pool_stats))
        .route("/dependencies", get(handlers::dependencies))
        .route("/errors", get(handlers::errors))
        .route(
            "/errors/{id}",
            get(handlers::error_by_id).delete(handlers::delete_error),
        )
        .route("/errors/{id}/mute", post(handlers::mute_error))
        .route("/errors/{id}/resolve", post(handlers::resolve_error))
        .route("/runtime/current", get(handlers::runtime_current))
        .route("/runtime/history", get(handlers::runtime_history))
        .route("/runtime/info", get(handlers::runtime_info))
        .route("/health/checks", get(handlers::health_checks))
        .route(
            "/health/checks/{name}/history",
            get(handlers::health_history),
        )
        .route("/health/checks/{name}/run", post(handlers::run_health_check))
        .route("/alerts", get(handlers::alerts))
        .route("/settings", get(handlers::settings))
        .route("/data/reset", post(handlers::reset))
        .route("/data/export", post(export::export))
        .route_layer(from_fn_with_state(Arc::clone(&pulse), auth::require_auth));

    let api = Router::new()
        .route("/auth/login", post(auth::login))
        .merge(protected);

    public.nest("/api", api).with_state(pulse)
}
