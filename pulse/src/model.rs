//! Telemetry data model.
//!
//! Record types produced by the interceptors and background samplers, plus
//! the aggregate views served by the read API. Records are written once and
//! never mutated, with one exception: [`ErrorRecord`]s are merged by
//! fingerprint inside storage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stats::LatencySummary;

// ============================================================================
// Request / query records
// ============================================================================

/// One observed HTTP request, written at response completion.
///
/// `route` is always the router's template (`/users/{id}`), never the
/// expanded path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    pub route: String,
    pub status: u16,
    pub latency_ms: f64,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub client_ip: String,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
}

/// One observed database query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub sql: String,
    pub normalized: String,
    /// `SELECT` / `INSERT` / `UPDATE` / `DELETE`, or empty for anything else.
    pub operation: String,
    pub table: String,
    pub duration_ms: f64,
    pub rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `file.rs:line` of the first application frame that issued the query.
    pub caller: String,
    /// Trace ID of the owning request; empty for background queries.
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Runtime samples
// ============================================================================

/// Point-in-time process runtime sample.
///
/// Heap figures come from the opt-in tracking allocator and read as zero when
/// the host has not installed it; `rss_bytes` is read from the OS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RuntimeSample {
    pub heap_alloc_bytes: u64,
    pub heap_in_use_bytes: u64,
    pub heap_objects: u64,
    pub total_alloc_bytes: u64,
    pub rss_bytes: u64,
    /// Alive tokio tasks (the closest analogue of a thread/goroutine count).
    pub tasks: u64,
    /// Runtime worker threads.
    pub workers: u64,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Errors
// ============================================================================

/// Classified error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Panic,
    Validation,
    Database,
    Timeout,
    Auth,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Panic => "panic",
            Self::Validation => "validation",
            Self::Database => "database",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

/// Redacted request context captured alongside an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Header map with sensitive values replaced by `[REDACTED]`.
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub client_ip: String,
}

/// Deduplicated error group.
///
/// Storage merges occurrences by `fingerprint`: the count and `last_seen`
/// advance, the stack trace and context are replaced with the latest
/// occurrence, and the operator-facing `muted` / `resolved` flags survive
/// the merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: Uuid,
    /// First 16 hex chars of SHA-256 over `method|route|message`.
    pub fingerprint: String,
    pub method: String,
    pub route: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<RequestContext>,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub muted: bool,
    pub resolved: bool,
}

// ============================================================================
// Health
// ============================================================================

/// Health state of a single check or of the composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Outcome of one health check execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    pub name: String,
    /// Registration type tag, e.g. `database`, `http`, `custom`.
    #[serde(rename = "type")]
    pub kind: String,
    pub status: HealthStatus,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Alerts
// ============================================================================

/// Severity attached to an alert rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Alert rule state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Ok,
    Pending,
    Firing,
    Resolved,
}

impl AlertState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Pending => "pending",
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

/// One firing or resolution transition, appended to the bounded alert log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub rule: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub operator: String,
    pub severity: Severity,
    pub state: AlertState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    pub message: String,
    pub fired_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Dependencies
// ============================================================================

/// One outbound HTTP call made through a wrapped client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyMetric {
    /// Dependency name chosen at wrap time.
    pub name: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub latency_ms: f64,
    pub request_bytes: u64,
    pub response_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated view of one dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyStats {
    pub name: String,
    pub count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub latency: LatencySummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaker_state: Option<String>,
}

// ============================================================================
// N+1 detections
// ============================================================================

/// One N+1 query pattern detection, fired exactly once per
/// `(trace, pattern)` when the repetition count crosses the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct N1Detection {
    pub pattern: String,
    pub count: u32,
    pub total_duration_ms: f64,
    pub trace_id: String,
    pub route: String,
    pub detected_at: DateTime<Utc>,
}

// ============================================================================
// Connection pool
// ============================================================================

/// Snapshot of the database connection pool. Overwritten in place by the
/// pool sampler; no history is kept.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub max_open: u32,
    pub open: u32,
    pub in_use: u32,
    pub idle: u32,
    pub timestamp: Option<DateTime<Utc>>,
}

// ============================================================================
// Aggregates
// ============================================================================

/// Per-route trend over two adjacent five-minute windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    #[default]
    Stable,
    Degrading,
}

impl Trend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Stable => "stable",
            Self::Degrading => "degrading",
        }
    }
}

/// Aggregated per-route statistics over a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStats {
    pub method: String,
    pub route: String,
    pub count: u64,
    pub error_count: u64,
    /// Percentage in `[0, 100]`.
    pub error_rate: f64,
    pub requests_per_minute: f64,
    pub latency: LatencySummary,
    pub trend: Trend,
}

/// One point of a time series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimePoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Aggregated view of one normalized query pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPattern {
    pub pattern: String,
    pub operation: String,
    pub table: String,
    pub count: u64,
    pub total_duration_ms: f64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Dashboard overview snapshot, recomputed by the aggregator each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overview {
    pub total_requests: u64,
    pub total_errors: u64,
    /// Percentage in `[0, 100]`.
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub requests_per_minute: f64,
    pub tasks: u64,
    pub heap_alloc_mb: f64,
    pub active_alerts: u64,
    pub top_routes: Vec<RouteStats>,
    pub recent_errors: Vec<ErrorRecord>,
    pub throughput: Vec<TimePoint>,
    pub error_series: Vec<TimePoint>,
    pub health: HealthStatus,
    pub generated_at: DateTime<Utc>,
}
