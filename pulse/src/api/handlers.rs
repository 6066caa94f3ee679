//! Read API handlers.
//!
//! Handlers serve from the aggregator cache where it covers the request
//! (the default one-hour window) and recompute from storage for other
//! ranges. Empty storage yields empty collections or a small hint object,
//! never `null`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ApiError;
use crate::aggregate::{self, TickInputs};
use crate::engine::Pulse;
use crate::health;
use crate::model::{
    AlertRecord, AlertState, DependencyStats, ErrorKind, ErrorRecord, HealthResult, HealthStatus,
    N1Detection, Overview, PoolStats, QueryPattern, QueryRecord, RequestRecord, RouteStats,
    Severity, TimePoint,
};
use crate::storage::{AlertFilter, ErrorFilter};
use crate::timerange::TimeRange;

// ============================================================================
// Shared query parameters
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct RangeParams {
    #[serde(default)]
    pub range: TimeRange,
}

const fn default_limit() -> usize {
    50
}

// ============================================================================
// Overview & routes
// ============================================================================

/// `GET <p>/api/overview`
pub async fn overview(
    State(pulse): State<Arc<Pulse>>,
    Query(params): Query<RangeParams>,
) -> Json<Overview> {
    // The cache holds the default window; other ranges recompute.
    if params.range == TimeRange::OneHour {
        if let Some(cached) = pulse.cache().overview() {
            return Json(cached);
        }
    }
    Json(build_for_range(&pulse, params.range).overview.expect("build always sets overview"))
}

#[derive(Debug, Deserialize)]
pub struct RoutesParams {
    #[serde(default)]
    pub range: TimeRange,
    pub search: Option<String>,
}

/// `GET <p>/api/routes`
pub async fn routes(
    State(pulse): State<Arc<Pulse>>,
    Query(params): Query<RoutesParams>,
) -> Json<Vec<RouteStats>> {
    let mut stats = if params.range == TimeRange::OneHour {
        let cached = pulse.cache().route_stats();
        if cached.is_empty() && pulse.cache().updated_at().is_none() {
            build_for_range(&pulse, params.range).route_stats
        } else {
            cached
        }
    } else {
        build_for_range(&pulse, params.range).route_stats
    };

    if let Some(search) = params.search.filter(|s| !s.is_empty()) {
        let needle = search.to_lowercase();
        stats.retain(|s| s.route.to_lowercase().contains(&needle));
    }
    Json(stats)
}

#[derive(Debug, Serialize)]
pub struct RouteDetail {
    pub stats: RouteStats,
    pub recent: Vec<RequestRecord>,
    pub latency_series: Vec<TimePoint>,
}

/// `GET <p>/api/routes/{method}/{*path}`
pub async fn route_detail(
    State(pulse): State<Arc<Pulse>>,
    Path((method, path)): Path<(String, String)>,
    Query(params): Query<RangeParams>,
) -> Result<Json<RouteDetail>, ApiError> {
    let method = method.to_uppercase();
    // Wildcard captures arrive without their leading slash.
    let route = format!("/{path}");

    let all = build_for_range(&pulse, params.range);
    let stats = all
        .route_stats
        .into_iter()
        .find(|s| s.method == method && s.route == route)
        .ok_or_else(|| ApiError::NotFound("route".into()))?;

    let (from, to) = params.range.bounds();
    let of_route: Vec<RequestRecord> = pulse
        .storage()
        .requests_in(from, to)
        .into_iter()
        .filter(|r| r.method == method && r.route == route)
        .collect();
    let (_, _, latency_series) = aggregate::bucket_series(&of_route, from, params.range);

    let mut recent = of_route;
    recent.reverse();
    recent.truncate(50);

    Ok(Json(RouteDetail {
        stats,
        recent,
        latency_series,
    }))
}

// ============================================================================
// Database views
// ============================================================================

#[derive(Debug, Serialize)]
pub struct DatabaseOverview {
    pub total_queries: u64,
    pub slow_queries: u64,
    pub avg_duration_ms: f64,
    pub queries_per_minute: f64,
    pub n1_detections: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
}

/// `GET <p>/api/database/overview`
pub async fn database_overview(
    State(pulse): State<Arc<Pulse>>,
    Query(params): Query<RangeParams>,
) -> Json<DatabaseOverview> {
    let (from, to) = params.range.bounds();
    let queries = pulse.storage().queries_in(from, to);
    let slow_threshold = pulse.config().database.slow_query_ms as f64;

    let total = queries.len() as u64;
    let slow = queries
        .iter()
        .filter(|q| q.duration_ms >= slow_threshold)
        .count() as u64;
    let avg = if queries.is_empty() {
        0.0
    } else {
        queries.iter().map(|q| q.duration_ms).sum::<f64>() / queries.len() as f64
    };
    let minutes = (params.range.to_duration().num_seconds() as f64 / 60.0).max(1.0 / 60.0);

    Json(DatabaseOverview {
        total_queries: total,
        slow_queries: slow,
        avg_duration_ms: avg,
        queries_per_minute: total as f64 / minutes,
        n1_detections: pulse.storage().n1_detections(from).len() as u64,
        pool: pulse.storage().pool_stats(),
    })
}

#[derive(Debug, Deserialize)]
pub struct SlowQueryParams {
    /// Duration floor in milliseconds; defaults to the configured slow
    /// threshold.
    pub threshold: Option<f64>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// `GET <p>/api/database/slow-queries`
pub async fn slow_queries(
    State(pulse): State<Arc<Pulse>>,
    Query(params): Query<SlowQueryParams>,
) -> Json<Vec<QueryRecord>> {
    let threshold = params
        .threshold
        .unwrap_or(pulse.config().database.slow_query_ms as f64);
    Json(pulse.storage().slow_queries(threshold, params.limit))
}

/// `GET <p>/api/database/patterns`
pub async fn query_patterns(
    State(pulse): State<Arc<Pulse>>,
    Query(params): Query<RangeParams>,
) -> Json<Vec<QueryPattern>> {
    let (from, to) = params.range.bounds();
    Json(pulse.storage().query_patterns(from, to))
}

/// `GET <p>/api/database/n1`
pub async fn n1_detections(
    State(pulse): State<Arc<Pulse>>,
    Query(params): Query<RangeParams>,
) -> Json<Vec<N1Detection>> {
    let (from, _) = params.range.bounds();
    Json(pulse.storage().n1_detections(from))
}

/// `GET <p>/api/database/pool`
pub async fn pool_stats(State(pulse): State<Arc<Pulse>>) -> Response {
    match pulse.storage().pool_stats() {
        Some(stats) => Json(stats).into_response(),
        None => Json(serde_json::json!({
            "available": false,
            "hint": "no database pool attached; pass one to Pulse::track_pool",
        }))
        .into_response(),
    }
}

/// `GET <p>/api/dependencies`
pub async fn dependencies(State(pulse): State<Arc<Pulse>>) -> Json<Vec<DependencyStats>> {
    let mut stats = pulse.storage().dependency_stats();
    for dep in &mut stats {
        dep.breaker_state = pulse.breaker_state(&dep.name).map(ToString::to_string);
    }
    Json(stats)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ErrorsParams {
    #[serde(default)]
    pub range: TimeRange,
    #[serde(rename = "type")]
    pub kind: Option<ErrorKind>,
    pub route: Option<String>,
    pub muted: Option<bool>,
    pub resolved: Option<bool>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

/// `GET <p>/api/errors`
pub async fn errors(
    State(pulse): State<Arc<Pulse>>,
    Query(params): Query<ErrorsParams>,
) -> Json<Vec<ErrorRecord>> {
    let (from, _) = params.range.bounds();
    let filter = ErrorFilter {
        kind: params.kind,
        route: params.route,
        muted: params.muted,
        resolved: params.resolved,
        // Range filtering happens below; fetch everything matching first.
        limit: 0,
        offset: 0,
    };
    let mut all: Vec<ErrorRecord> = pulse
        .storage()
        .errors(&filter)
        .into_iter()
        .filter(|e| e.last_seen >= from)
        .collect();

    let start = params.offset.min(all.len());
    let end = if params.limit == 0 {
        all.len()
    } else {
        (start + params.limit).min(all.len())
    };
    all = all[start..end].to_vec();
    Json(all)
}

/// `GET <p>/api/errors/{id}`
pub async fn error_by_id(
    State(pulse): State<Arc<Pulse>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ErrorRecord>, ApiError> {
    pulse
        .storage()
        .error(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("error record".into()))
}

/// `POST <p>/api/errors/{id}/mute`
pub async fn mute_error(
    State(pulse): State<Arc<Pulse>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if pulse.storage().set_error_muted(id, true) {
        Ok(Json(serde_json::json!({"status": "muted"})))
    } else {
        Err(ApiError::NotFound("error record".into()))
    }
}

/// `POST <p>/api/errors/{id}/resolve`
pub async fn resolve_error(
    State(pulse): State<Arc<Pulse>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if pulse.storage().set_error_resolved(id, true) {
        Ok(Json(serde_json::json!({"status": "resolved"})))
    } else {
        Err(ApiError::NotFound("error record".into()))
    }
}

/// `DELETE <p>/api/errors/{id}`
pub async fn delete_error(
    State(pulse): State<Arc<Pulse>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if pulse.storage().delete_error(id) {
        Ok(Json(serde_json::json!({"status": "deleted"})))
    } else {
        Err(ApiError::NotFound("error record".into()))
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// `GET <p>/api/runtime/current`
pub async fn runtime_current(State(pulse): State<Arc<Pulse>>) -> Response {
    match pulse.storage().latest_runtime_sample() {
        Some(sample) => Json(sample).into_response(),
        None => Json(serde_json::json!({
            "available": false,
            "hint": "no runtime samples yet; the sampler runs every few seconds",
        }))
        .into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct RuntimePoint {
    pub timestamp: DateTime<Utc>,
    pub heap_alloc_mb: f64,
    pub rss_mb: f64,
    pub tasks: f64,
}

/// `GET <p>/api/runtime/history`. Samples bucketed at the range resolution.
pub async fn runtime_history(
    State(pulse): State<Arc<Pulse>>,
    Query(params): Query<RangeParams>,
) -> Json<Vec<RuntimePoint>> {
    let (from, to) = params.range.bounds();
    let samples = pulse.storage().runtime_samples_in(from, to);
    let step = params.range.resolution().num_seconds().max(1);
    let buckets = params.range.bucket_count();

    let mut sums = vec![(0.0f64, 0.0f64, 0.0f64, 0u32); buckets];
    for sample in &samples {
        let offset = (sample.timestamp - from).num_seconds();
        if offset < 0 {
            continue;
        }
        let idx = (offset / step) as usize;
        if idx >= buckets {
            continue;
        }
        let slot = &mut sums[idx];
        slot.0 += crate::util::bytes_to_mb(sample.heap_alloc_bytes);
        slot.1 += crate::util::bytes_to_mb(sample.rss_bytes);
        slot.2 += sample.tasks as f64;
        slot.3 += 1;
    }

    let points = sums
        .into_iter()
        .enumerate()
        .filter(|(_, (_, _, _, n))| *n > 0)
        .map(|(i, (heap, rss, tasks, n))| RuntimePoint {
            timestamp: from + chrono::Duration::seconds(step * i as i64),
            heap_alloc_mb: heap / f64::from(n),
            rss_mb: rss / f64::from(n),
            tasks: tasks / f64::from(n),
        })
        .collect();
    Json(points)
}

#[derive(Debug, Serialize)]
pub struct RuntimeInfo {
    pub system: SystemInfo,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub os: &'static str,
    pub arch: &'static str,
    pub cpus: usize,
    pub pid: u32,
    pub engine_version: &'static str,
}

/// `GET <p>/api/runtime/info`
pub async fn runtime_info(State(pulse): State<Arc<Pulse>>) -> Json<RuntimeInfo> {
    Json(RuntimeInfo {
        system: SystemInfo {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            cpus: num_cpus::get(),
            pid: std::process::id(),
            engine_version: env!("CARGO_PKG_VERSION"),
        },
        uptime_seconds: pulse.uptime().as_secs(),
    })
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct CheckEntry {
    pub status: HealthStatus,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub flapping: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthEnvelope {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime: u64,
    pub checks: BTreeMap<String, CheckEntry>,
}

fn health_envelope(pulse: &Pulse) -> HealthEnvelope {
    let mut checks = BTreeMap::new();
    for result in pulse.storage().latest_health_results() {
        let history = pulse.storage().health_history(&result.name, 6);
        checks.insert(
            result.name.clone(),
            CheckEntry {
                status: result.status,
                latency_ms: result.latency_ms,
                error: result.error,
                flapping: health::is_flapping(&history),
            },
        );
    }
    HealthEnvelope {
        status: pulse.health().composite(),
        timestamp: Utc::now(),
        uptime: pulse.uptime().as_secs(),
        checks,
    }
}

const fn composite_status_code(status: HealthStatus) -> StatusCode {
    match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::MULTI_STATUS,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// `GET <p>/health`, the public composite probe.
pub async fn health(State(pulse): State<Arc<Pulse>>) -> Response {
    let envelope = health_envelope(&pulse);
    (composite_status_code(envelope.status), Json(envelope)).into_response()
}

/// `GET <p>/health/live`: liveness, always 200.
pub async fn health_live() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "alive"}))
}

/// `GET <p>/health/ready`: readiness, 503 only when unhealthy.
pub async fn health_ready(State(pulse): State<Arc<Pulse>>) -> Response {
    if pulse.health().composite() == HealthStatus::Unhealthy {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "not_ready"})),
        )
            .into_response()
    } else {
        Json(serde_json::json!({"status": "ready"})).into_response()
    }
}

/// `GET <p>/api/health/checks`
pub async fn health_checks(State(pulse): State<Arc<Pulse>>) -> Json<HealthEnvelope> {
    Json(health_envelope(&pulse))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

const fn default_history_limit() -> usize {
    100
}

/// `GET <p>/api/health/checks/{name}/history`
pub async fn health_history(
    State(pulse): State<Arc<Pulse>>,
    Path(name): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HealthResult>>, ApiError> {
    if !pulse.health().is_registered(&name).await {
        return Err(ApiError::NotFound("health check".into()));
    }
    Ok(Json(pulse.storage().health_history(&name, params.limit)))
}

/// `POST <p>/api/health/checks/{name}/run`
pub async fn run_health_check(
    State(pulse): State<Arc<Pulse>>,
    Path(name): Path<String>,
) -> Result<Json<HealthResult>, ApiError> {
    pulse
        .run_health_check(&name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("health check".into()))
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AlertsParams {
    #[serde(default)]
    pub range: TimeRange,
    pub state: Option<AlertState>,
    pub severity: Option<Severity>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// `GET <p>/api/alerts`
pub async fn alerts(
    State(pulse): State<Arc<Pulse>>,
    Query(params): Query<AlertsParams>,
) -> Json<Vec<AlertRecord>> {
    let (from, _) = params.range.bounds();
    Json(pulse.storage().alerts(&AlertFilter {
        state: params.state,
        severity: params.severity,
        since: Some(from),
        limit: params.limit,
    }))
}

// ============================================================================
// Settings & data management
// ============================================================================

/// `GET <p>/api/settings`: the effective config, secrets redacted.
pub async fn settings(State(pulse): State<Arc<Pulse>>) -> Json<crate::config::PulseConfig> {
    Json(pulse.config().redacted())
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub confirm: bool,
}

/// `POST <p>/api/data/reset`
pub async fn reset(
    State(pulse): State<Arc<Pulse>>,
    Json(body): Json<ResetRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !body.confirm {
        return Err(ApiError::Validation(
            "pass {\"confirm\": true} to reset all telemetry data".into(),
        ));
    }
    pulse.storage().reset();
    pulse.cache().swap(aggregate::CachedAggregates::default());
    Ok(Json(serde_json::json!({"status": "data reset complete"})))
}

// ============================================================================
// Helpers
// ============================================================================

fn build_for_range(pulse: &Pulse, range: TimeRange) -> aggregate::CachedAggregates {
    aggregate::build(
        pulse.storage(),
        TickInputs {
            active_alerts: pulse.firing_alerts(),
            health: pulse.health().composite(),
        },
        range,
    )
}
