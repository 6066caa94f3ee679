//! In-memory telemetry storage.
//!
//! One ring buffer per telemetry stream, a fingerprint-keyed map of
//! deduplicated errors, per-check health history rings, a bounded alert log,
//! a bounded N+1 detection list, and a single connection-pool snapshot cell.
//!
//! Every operation is individually safe under concurrency; callers must not
//! assume transactional composition across operations. Ingest never blocks:
//! ring buffers drop their oldest element instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::config::BufferConfig;
use crate::model::{
    AlertRecord, AlertState, DependencyMetric, DependencyStats, ErrorKind, ErrorRecord,
    HealthResult, N1Detection, PoolStats, QueryPattern, QueryRecord, RequestRecord, RouteStats,
    RuntimeSample, Trend,
};
use crate::ring::RingBuffer;
use crate::stats::LatencySummary;

/// Maximum alert transitions retained; the oldest are trimmed.
const MAX_ALERTS: usize = 10_000;
/// Maximum N+1 detections retained.
const MAX_N1: usize = 1_000;

/// Filters for the error listing endpoint.
#[derive(Debug, Clone, Default)]
pub struct ErrorFilter {
    pub kind: Option<ErrorKind>,
    pub route: Option<String>,
    pub muted: Option<bool>,
    pub resolved: Option<bool>,
    /// `0` means no limit.
    pub limit: usize,
    pub offset: usize,
}

/// Filters for the alert listing endpoint.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub state: Option<AlertState>,
    pub severity: Option<crate::model::Severity>,
    pub since: Option<DateTime<Utc>>,
    /// `0` means no limit.
    pub limit: usize,
}

/// The concrete in-memory store.
pub struct MemoryStorage {
    requests: RingBuffer<RequestRecord>,
    queries: RingBuffer<QueryRecord>,
    runtime: RingBuffer<RuntimeSample>,
    dependencies: RingBuffer<DependencyMetric>,
    errors: DashMap<String, ErrorRecord>,
    health: RwLock<HashMap<String, Arc<RingBuffer<HealthResult>>>>,
    health_capacity: usize,
    alerts: Mutex<Vec<AlertRecord>>,
    n1: Mutex<Vec<N1Detection>>,
    pool: RwLock<Option<PoolStats>>,
}

impl MemoryStorage {
    pub fn new(buffers: &BufferConfig) -> Self {
        Self {
            requests: RingBuffer::new(buffers.requests),
            queries: RingBuffer::new(buffers.queries),
            runtime: RingBuffer::new(buffers.runtime_samples),
            dependencies: RingBuffer::new(buffers.dependencies),
            errors: DashMap::new(),
            health: RwLock::new(HashMap::new()),
            health_capacity: buffers.health_results,
            alerts: Mutex::new(Vec::new()),
            n1: Mutex::new(Vec::new()),
            pool: RwLock::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    pub fn add_request(&self, record: RequestRecord) {
        self.requests.push(record);
    }

    /// Oldest-first requests inside `[from, to)`.
    pub fn requests_in(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<RequestRecord> {
        self.requests
            .filter(|r| r.timestamp >= from && r.timestamp < to)
    }

    /// Up to `limit` newest requests, newest first. `0` means no limit.
    pub fn recent_requests(&self, limit: usize) -> Vec<RequestRecord> {
        let limit = if limit == 0 { self.requests.len() } else { limit };
        self.requests.last(limit)
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Per-route aggregates over a window, sorted by request count
    /// descending. Trends here are the [`Trend::Stable`] fallback; the
    /// aggregator overwrites them before anything reader-facing is served.
    pub fn route_stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<RouteStats> {
        struct Acc {
            count: u64,
            errors: u64,
            latencies: Vec<f64>,
        }

        let mut by_route: HashMap<(String, String), Acc> = HashMap::new();
        self.requests.for_each(|r| {
            if r.timestamp >= from && r.timestamp < to {
                let acc = by_route
                    .entry((r.method.clone(), r.route.clone()))
                    .or_insert_with(|| Acc {
                        count: 0,
                        errors: 0,
                        latencies: Vec::new(),
                    });
                acc.count += 1;
                if r.status >= 400 {
                    acc.errors += 1;
                }
                acc.latencies.push(r.latency_ms);
            }
            true
        });

        let minutes = ((to - from).num_seconds() as f64 / 60.0).max(1.0 / 60.0);
        let mut stats: Vec<RouteStats> = by_route
            .into_iter()
            .map(|((method, route), acc)| RouteStats {
                method,
                route,
                count: acc.count,
                error_count: acc.errors,
                error_rate: acc.errors as f64 / acc.count as f64 * 100.0,
                requests_per_minute: acc.count as f64 / minutes,
                latency: LatencySummary::from_samples(&acc.latencies),
                trend: Trend::Stable,
            })
            .collect();

        stats.sort_by(|a, b| b.count.cmp(&a.count));
        stats
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn add_query(&self, record: QueryRecord) {
        self.queries.push(record);
    }

    pub fn queries_in(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<QueryRecord> {
        self.queries
            .filter(|q| q.timestamp >= from && q.timestamp < to)
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Queries at or above `threshold_ms`, sorted by duration descending.
    /// `limit == 0` means no limit.
    pub fn slow_queries(&self, threshold_ms: f64, limit: usize) -> Vec<QueryRecord> {
        let mut slow = self.queries.filter(|q| q.duration_ms >= threshold_ms);
        slow.sort_by(|a, b| {
            b.duration_ms
                .partial_cmp(&a.duration_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if limit > 0 {
            slow.truncate(limit);
        }
        slow
    }

    /// Normalized-pattern aggregates over a window, sorted by total duration
    /// descending.
    pub fn query_patterns(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<QueryPattern> {
        struct Acc {
            operation: String,
            table: String,
            count: u64,
            total: f64,
            max: f64,
        }

        let mut by_pattern: HashMap<String, Acc> = HashMap::new();
        self.queries.for_each(|q| {
            if q.timestamp >= from && q.timestamp < to && !q.normalized.is_empty() {
                let acc = by_pattern
                    .entry(q.normalized.clone())
                    .or_insert_with(|| Acc {
                        operation: q.operation.clone(),
                        table: q.table.clone(),
                        count: 0,
                        total: 0.0,
                        max: 0.0,
                    });
                acc.count += 1;
                acc.total += q.duration_ms;
                acc.max = acc.max.max(q.duration_ms);
            }
            true
        });

        let mut patterns: Vec<QueryPattern> = by_pattern
            .into_iter()
            .map(|(pattern, acc)| QueryPattern {
                pattern,
                operation: acc.operation,
                table: acc.table,
                count: acc.count,
                total_duration_ms: acc.total,
                avg_duration_ms: acc.total / acc.count as f64,
                max_duration_ms: acc.max,
            })
            .collect();

        patterns.sort_by(|a, b| {
            b.total_duration_ms
                .partial_cmp(&a.total_duration_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        patterns
    }

    // ------------------------------------------------------------------
    // Errors (deduplicated by fingerprint)
    // ------------------------------------------------------------------

    /// Absorb an error occurrence and return the merged occurrence count.
    ///
    /// A record with the same fingerprint already present is merged: the
    /// count and `last_seen` advance, the stack trace and context are
    /// replaced by this occurrence's, and the operator flags stay. Otherwise
    /// the candidate is adopted as-is. Merging is linearized per fingerprint
    /// by the map's shard lock.
    pub fn add_error(&self, candidate: ErrorRecord) -> u64 {
        let entry = self
            .errors
            .entry(candidate.fingerprint.clone())
            .and_modify(|existing| {
                existing.count += 1;
                existing.last_seen = candidate.last_seen;
                existing.kind = candidate.kind;
                existing.stack = candidate.stack.clone();
                existing.context = candidate.context.clone();
            })
            .or_insert(candidate);
        entry.count
    }

    /// Filtered error listing, sorted by `last_seen` descending.
    pub fn errors(&self, filter: &ErrorFilter) -> Vec<ErrorRecord> {
        let mut out: Vec<ErrorRecord> = self
            .errors
            .iter()
            .filter(|entry| {
                let e = entry.value();
                filter.kind.is_none_or(|k| e.kind == k)
                    && filter.route.as_ref().is_none_or(|r| &e.route == r)
                    && filter.muted.is_none_or(|m| e.muted == m)
                    && filter.resolved.is_none_or(|r| e.resolved == r)
            })
            .map(|entry| entry.value().clone())
            .collect();

        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

        let end = if filter.limit == 0 {
            out.len()
        } else {
            (filter.offset + filter.limit).min(out.len())
        };
        let start = filter.offset.min(out.len());
        out[start..end.max(start)].to_vec()
    }

    pub fn error(&self, id: Uuid) -> Option<ErrorRecord> {
        self.errors
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| entry.value().clone())
    }

    pub fn set_error_muted(&self, id: Uuid, muted: bool) -> bool {
        self.mutate_error(id, |e| e.muted = muted)
    }

    pub fn set_error_resolved(&self, id: Uuid, resolved: bool) -> bool {
        self.mutate_error(id, |e| e.resolved = resolved)
    }

    pub fn delete_error(&self, id: Uuid) -> bool {
        let fingerprint = self
            .errors
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| entry.key().clone());
        match fingerprint {
            Some(fp) => self.errors.remove(&fp).is_some(),
            None => false,
        }
    }

    fn mutate_error(&self, id: Uuid, f: impl FnOnce(&mut ErrorRecord)) -> bool {
        for mut entry in self.errors.iter_mut() {
            if entry.value().id == id {
                f(entry.value_mut());
                return true;
            }
        }
        false
    }

    /// Newest errors by `last_seen`.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.errors(&ErrorFilter {
            limit,
            ..ErrorFilter::default()
        })
    }

    /// Occurrence counts grouped by error kind, sorted by count descending.
    pub fn errors_by_kind(&self) -> Vec<(ErrorKind, u64)> {
        let mut counts: HashMap<ErrorKind, u64> = HashMap::new();
        for entry in &self.errors {
            *counts.entry(entry.value().kind).or_default() += entry.value().count;
        }
        let mut out: Vec<(ErrorKind, u64)> = counts.into_iter().collect();
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }

    pub fn error_group_count(&self) -> usize {
        self.errors.len()
    }

    // ------------------------------------------------------------------
    // Runtime samples
    // ------------------------------------------------------------------

    pub fn add_runtime_sample(&self, sample: RuntimeSample) {
        self.runtime.push(sample);
    }

    pub fn runtime_samples_in(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<RuntimeSample> {
        self.runtime
            .filter(|s| s.timestamp >= from && s.timestamp < to)
    }

    pub fn latest_runtime_sample(&self) -> Option<RuntimeSample> {
        self.runtime.last(1).into_iter().next()
    }

    // ------------------------------------------------------------------
    // Health results
    // ------------------------------------------------------------------

    pub fn add_health_result(&self, result: HealthResult) {
        let ring = {
            let guard = self.health.read().unwrap_or_else(|e| e.into_inner());
            guard.get(&result.name).cloned()
        };
        let ring = ring.unwrap_or_else(|| {
            let mut guard = self.health.write().unwrap_or_else(|e| e.into_inner());
            guard
                .entry(result.name.clone())
                .or_insert_with(|| Arc::new(RingBuffer::new(self.health_capacity)))
                .clone()
        });
        ring.push(result);
    }

    /// Newest-first history for one check. `limit == 0` means all retained.
    pub fn health_history(&self, name: &str, limit: usize) -> Vec<HealthResult> {
        let guard = self.health.read().unwrap_or_else(|e| e.into_inner());
        guard.get(name).map_or_else(Vec::new, |ring| {
            let limit = if limit == 0 { ring.len() } else { limit };
            ring.last(limit)
        })
    }

    /// The latest result of every check that has run at least once.
    pub fn latest_health_results(&self) -> Vec<HealthResult> {
        let guard = self.health.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<HealthResult> = guard
            .values()
            .filter_map(|ring| ring.last(1).into_iter().next())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    pub fn add_alert(&self, record: AlertRecord) {
        let mut alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        alerts.push(record);
        if alerts.len() > MAX_ALERTS {
            let excess = alerts.len() - MAX_ALERTS;
            alerts.drain(..excess);
        }
    }

    /// Filtered alert log, sorted by `fired_at` descending.
    pub fn alerts(&self, filter: &AlertFilter) -> Vec<AlertRecord> {
        let alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<AlertRecord> = alerts
            .iter()
            .filter(|a| {
                filter.state.is_none_or(|s| a.state == s)
                    && filter.severity.is_none_or(|s| a.severity == s)
                    && filter.since.is_none_or(|t| a.fired_at >= t)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.fired_at.cmp(&a.fired_at));
        if filter.limit > 0 {
            out.truncate(filter.limit);
        }
        out
    }

    // ------------------------------------------------------------------
    // N+1 detections
    // ------------------------------------------------------------------

    pub fn add_n1(&self, detection: N1Detection) {
        let mut list = self.n1.lock().unwrap_or_else(|e| e.into_inner());
        list.push(detection);
        if list.len() > MAX_N1 {
            let excess = list.len() - MAX_N1;
            list.drain(..excess);
        }
    }

    /// Detections at or after `since`, newest first.
    pub fn n1_detections(&self, since: DateTime<Utc>) -> Vec<N1Detection> {
        let list = self.n1.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<N1Detection> = list
            .iter()
            .filter(|d| d.detected_at >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        out
    }

    // ------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------

    pub fn add_dependency(&self, metric: DependencyMetric) {
        self.dependencies.push(metric);
    }

    pub fn dependencies_in(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<DependencyMetric> {
        self.dependencies
            .filter(|d| d.timestamp >= from && d.timestamp < to)
    }

    /// Per-dependency aggregates over the whole retained window, sorted by
    /// request count descending.
    pub fn dependency_stats(&self) -> Vec<DependencyStats> {
        struct Acc {
            count: u64,
            errors: u64,
            latencies: Vec<f64>,
        }

        let mut by_name: HashMap<String, Acc> = HashMap::new();
        self.dependencies.for_each(|d| {
            let acc = by_name.entry(d.name.clone()).or_insert_with(|| Acc {
                count: 0,
                errors: 0,
                latencies: Vec::new(),
            });
            acc.count += 1;
            if d.error.is_some() || d.status >= 400 {
                acc.errors += 1;
            }
            acc.latencies.push(d.latency_ms);
            true
        });

        let mut out: Vec<DependencyStats> = by_name
            .into_iter()
            .map(|(name, acc)| DependencyStats {
                name,
                count: acc.count,
                error_count: acc.errors,
                error_rate: acc.errors as f64 / acc.count as f64 * 100.0,
                latency: LatencySummary::from_samples(&acc.latencies),
                breaker_state: None,
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        out
    }

    // ------------------------------------------------------------------
    // Pool stats
    // ------------------------------------------------------------------

    pub fn set_pool_stats(&self, stats: PoolStats) {
        *self.pool.write().unwrap_or_else(|e| e.into_inner()) = Some(stats);
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        *self.pool.read().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop errors, alerts and N+1 detections older than `cutoff`. Ring
    /// buffers need no sweep: their bounded size is their retention.
    pub fn cleanup(&self, cutoff: DateTime<Utc>) {
        self.errors.retain(|_, e| e.last_seen >= cutoff);

        let mut alerts = self.alerts.lock().unwrap_or_else(|e| e.into_inner());
        alerts.retain(|a| a.fired_at >= cutoff);
        drop(alerts);

        let mut n1 = self.n1.lock().unwrap_or_else(|e| e.into_inner());
        n1.retain(|d| d.detected_at >= cutoff);
    }

    /// Clear everything. Idempotent.
    pub fn reset(&self) {
        self.requests.reset();
        self.queries.reset();
        self.runtime.reset();
        self.dependencies.reset();
        self.errors.clear();
        self.health
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.alerts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.n1.lock().unwrap_or_else(|e| e.into_inner()).clear();
        *self.pool.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
