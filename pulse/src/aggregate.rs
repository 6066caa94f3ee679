//! Aggregation engine.
//!
//! A timer loop recomputes per-route statistics, time-series rollups, trend
//! labels and the dashboard overview from raw storage each tick, then swaps
//! the whole result into a read-write-locked cache in one step. Readers see
//! either the previous complete snapshot or the new one, never a mixture.

use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};

use crate::model::{HealthStatus, Overview, RequestRecord, RouteStats, TimePoint, Trend};
use crate::stats;
use crate::storage::MemoryStorage;
use crate::timerange::{TimeRange, MAX_BUCKETS};

/// Minimum requests in both comparison windows before a trend is meaningful.
const TREND_MIN_REQUESTS: u64 = 5;

// ============================================================================
// Cache
// ============================================================================

/// One complete aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct CachedAggregates {
    pub route_stats: Vec<RouteStats>,
    pub overview: Option<Overview>,
    pub throughput: Vec<TimePoint>,
    pub error_series: Vec<TimePoint>,
    pub latency_series: Vec<TimePoint>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Reader-facing cache, replaced atomically as a group each tick.
#[derive(Debug, Default)]
pub struct AggregateCache {
    inner: RwLock<CachedAggregates>,
}

impl AggregateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a freshly computed snapshot.
    pub fn swap(&self, next: CachedAggregates) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    pub fn route_stats(&self) -> Vec<RouteStats> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .route_stats
            .clone()
    }

    pub fn overview(&self) -> Option<Overview> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .overview
            .clone()
    }

    pub fn latency_series(&self) -> Vec<TimePoint> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .latency_series
            .clone()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .updated_at
    }
}

// ============================================================================
// Trend detection
// ============================================================================

/// Route behaviour over one comparison window.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowStats {
    pub p95: f64,
    /// Percentage in `[0, 100]`.
    pub error_rate: f64,
    pub requests_per_minute: f64,
    pub count: u64,
}

impl WindowStats {
    fn from_records(records: &[&RequestRecord], minutes: f64) -> Self {
        if records.is_empty() {
            return Self::default();
        }
        let latencies: Vec<f64> = records.iter().map(|r| r.latency_ms).collect();
        let errors = records.iter().filter(|r| r.status >= 400).count() as u64;
        let count = records.len() as u64;
        Self {
            p95: stats::percentile(&latencies, 95.0),
            error_rate: errors as f64 / count as f64 * 100.0,
            requests_per_minute: count as f64 / minutes,
            count,
        }
    }
}

/// Compare the last five minutes against the five before that.
///
/// Signals counted as degrading: p95 up more than 50 %, error rate up more
/// than 100 % (or above 5 % from zero), throughput down more than 50 %.
/// Improving: p95 down more than 30 %, error rate down more than 50 %.
pub fn detect_trend(current: WindowStats, previous: WindowStats) -> Trend {
    if current.count < TREND_MIN_REQUESTS || previous.count < TREND_MIN_REQUESTS {
        return Trend::Stable;
    }

    let mut degrading = 0;
    let mut improving = 0;

    if previous.p95 > 0.0 && current.p95 > previous.p95 * 1.5 {
        degrading += 1;
    }
    if previous.error_rate > 0.0 {
        if current.error_rate > previous.error_rate * 2.0 {
            degrading += 1;
        }
    } else if current.error_rate > 5.0 {
        degrading += 1;
    }
    if previous.requests_per_minute > 0.0
        && current.requests_per_minute < previous.requests_per_minute * 0.5
    {
        degrading += 1;
    }

    if previous.p95 > 0.0 && current.p95 < previous.p95 * 0.7 {
        improving += 1;
    }
    if previous.error_rate > 0.0 && current.error_rate < previous.error_rate * 0.5 {
        improving += 1;
    }

    match (degrading, improving) {
        (d, _) if d >= 2 => Trend::Degrading,
        (d, 0) if d >= 1 => Trend::Degrading,
        (_, i) if i >= 2 => Trend::Improving,
        (0, i) if i >= 1 => Trend::Improving,
        _ => Trend::Stable,
    }
}

// ============================================================================
// Series bucketing
// ============================================================================

/// Roll requests up into `(throughput, error count, average latency)` series
/// at the resolution belonging to `range`.
pub fn bucket_series(
    records: &[RequestRecord],
    from: DateTime<Utc>,
    range: TimeRange,
) -> (Vec<TimePoint>, Vec<TimePoint>, Vec<TimePoint>) {
    let step = range.resolution();
    let buckets = range.bucket_count().min(MAX_BUCKETS);
    let step_secs = step.num_seconds().max(1);

    let mut counts = vec![0u64; buckets];
    let mut errors = vec![0u64; buckets];
    let mut latency_sums = vec![0.0f64; buckets];

    for r in records {
        let offset = (r.timestamp - from).num_seconds();
        if offset < 0 {
            continue;
        }
        let idx = (offset / step_secs) as usize;
        if idx >= buckets {
            continue;
        }
        counts[idx] += 1;
        if r.status >= 400 {
            errors[idx] += 1;
        }
        latency_sums[idx] += r.latency_ms;
    }

    let mut throughput = Vec::with_capacity(buckets);
    let mut error_series = Vec::with_capacity(buckets);
    let mut latency_series = Vec::with_capacity(buckets);
    for i in 0..buckets {
        let timestamp = from + Duration::seconds(step_secs * i as i64);
        throughput.push(TimePoint {
            timestamp,
            value: counts[i] as f64,
        });
        error_series.push(TimePoint {
            timestamp,
            value: errors[i] as f64,
        });
        let avg = if counts[i] > 0 {
            latency_sums[i] / counts[i] as f64
        } else {
            0.0
        };
        latency_series.push(TimePoint {
            timestamp,
            value: avg,
        });
    }

    (throughput, error_series, latency_series)
}

// ============================================================================
// Full aggregation pass
// ============================================================================

/// Inputs the aggregator pulls from outside storage.
#[derive(Debug, Clone, Copy)]
pub struct TickInputs {
    pub active_alerts: u64,
    pub health: HealthStatus,
}

/// Recompute a complete aggregation snapshot from storage over `range`.
///
/// The aggregator tick calls this with the default one-hour window and swaps
/// the result into the cache; read handlers call it directly for other
/// ranges.
pub fn build(storage: &MemoryStorage, inputs: TickInputs, range: TimeRange) -> CachedAggregates {
    let now = Utc::now();
    let from = now - range.to_duration();

    let requests = storage.requests_in(from, now);

    // Per-route stats over the window, then the trend pass over the two
    // adjacent five-minute comparison windows.
    let mut route_stats = storage.route_stats(from, now);
    let five_ago = now - Duration::minutes(5);
    let ten_ago = now - Duration::minutes(10);
    for rs in &mut route_stats {
        let of_route: Vec<&RequestRecord> = requests
            .iter()
            .filter(|r| r.route == rs.route && r.method == rs.method)
            .collect();
        let current: Vec<&RequestRecord> = of_route
            .iter()
            .copied()
            .filter(|r| r.timestamp >= five_ago)
            .collect();
        let previous: Vec<&RequestRecord> = of_route
            .iter()
            .copied()
            .filter(|r| r.timestamp >= ten_ago && r.timestamp < five_ago)
            .collect();
        rs.trend = detect_trend(
            WindowStats::from_records(&current, 5.0),
            WindowStats::from_records(&previous, 5.0),
        );
    }

    let (throughput, error_series, latency_series) = bucket_series(&requests, from, range);

    let total_requests = requests.len() as u64;
    let total_errors = requests.iter().filter(|r| r.status >= 400).count() as u64;
    let latencies: Vec<f64> = requests.iter().map(|r| r.latency_ms).collect();
    let avg_latency = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<f64>() / latencies.len() as f64
    };
    let minutes = (range.to_duration().num_seconds() as f64 / 60.0).max(1.0 / 60.0);

    let latest_runtime = storage.latest_runtime_sample();

    let overview = Overview {
        total_requests,
        total_errors,
        error_rate: if total_requests > 0 {
            total_errors as f64 / total_requests as f64 * 100.0
        } else {
            0.0
        },
        avg_latency_ms: avg_latency,
        p95_latency_ms: stats::percentile(&latencies, 95.0),
        requests_per_minute: total_requests as f64 / minutes,
        tasks: latest_runtime.map_or(0, |s| s.tasks),
        heap_alloc_mb: latest_runtime.map_or(0.0, |s| crate::util::bytes_to_mb(s.heap_alloc_bytes)),
        active_alerts: inputs.active_alerts,
        top_routes: route_stats.iter().take(10).cloned().collect(),
        recent_errors: storage.recent_errors(5),
        throughput: throughput.clone(),
        error_series: error_series.clone(),
        health: inputs.health,
        generated_at: now,
    };

    CachedAggregates {
        route_stats,
        overview: Some(overview),
        throughput,
        error_series,
        latency_series,
        updated_at: Some(now),
    }
}
