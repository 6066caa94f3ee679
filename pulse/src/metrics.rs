//! Prometheus exposition.
//!
//! Renders the text format directly from storage at scrape time. Counters
//! and summaries reflect the retained ring-buffer window; gauges reflect the
//! latest samples.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use chrono::{Duration, Utc};

use crate::engine::Pulse;
use crate::model::HealthStatus;
use crate::stats;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
const QUANTILES: &[(f64, &str)] = &[(50.0, "0.5"), (90.0, "0.9"), (95.0, "0.95"), (99.0, "0.99")];

/// `GET <p>/metrics`
pub async fn prometheus(State(pulse): State<Arc<Pulse>>) -> Response {
    let body = render(&pulse);
    ([(CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], body).into_response()
}

fn render(pulse: &Pulse) -> String {
    let mut out = String::with_capacity(4_096);
    let now = Utc::now();
    let from = now - Duration::hours(1);
    let storage = pulse.storage();

    // HTTP request counters and latency summaries over the last hour.
    let requests = storage.requests_in(from, now);

    let mut counts: HashMap<(String, String, u16), u64> = HashMap::new();
    let mut latencies: HashMap<(String, String), Vec<f64>> = HashMap::new();
    let mut route_errors: HashMap<(String, String), (u64, u64)> = HashMap::new();
    for r in &requests {
        *counts
            .entry((r.method.clone(), r.route.clone(), r.status))
            .or_default() += 1;
        latencies
            .entry((r.method.clone(), r.route.clone()))
            .or_default()
            .push(r.latency_ms);
        let entry = route_errors
            .entry((r.method.clone(), r.route.clone()))
            .or_default();
        entry.0 += 1;
        if r.status >= 400 {
            entry.1 += 1;
        }
    }

    let _ = writeln!(out, "# HELP pulse_http_requests_total HTTP requests observed.");
    let _ = writeln!(out, "# TYPE pulse_http_requests_total counter");
    let mut keys: Vec<_> = counts.keys().cloned().collect();
    keys.sort();
    for (method, path, status) in keys {
        let count = counts[&(method.clone(), path.clone(), status)];
        let _ = writeln!(
            out,
            "pulse_http_requests_total{{method=\"{}\",path=\"{}\",status=\"{}\"}} {}",
            escape(&method),
            escape(&path),
            status,
            count
        );
    }

    let _ = writeln!(out, "# HELP pulse_http_request_duration_seconds Request latency.");
    let _ = writeln!(out, "# TYPE pulse_http_request_duration_seconds summary");
    let mut route_keys: Vec<_> = latencies.keys().cloned().collect();
    route_keys.sort();
    for (method, path) in &route_keys {
        let samples = &latencies[&(method.clone(), path.clone())];
        for (q, label) in QUANTILES {
            let _ = writeln!(
                out,
                "pulse_http_request_duration_seconds{{method=\"{}\",path=\"{}\",quantile=\"{}\"}} {:.6}",
                escape(method),
                escape(path),
                label,
                stats::percentile(samples, *q) / 1_000.0
            );
        }
        let sum: f64 = samples.iter().sum();
        let _ = writeln!(
            out,
            "pulse_http_request_duration_seconds_sum{{method=\"{}\",path=\"{}\"}} {:.6}",
            escape(method),
            escape(path),
            sum / 1_000.0
        );
        let _ = writeln!(
            out,
            "pulse_http_request_duration_seconds_count{{method=\"{}\",path=\"{}\"}} {}",
            escape(method),
            escape(path),
            samples.len()
        );
    }

    let _ = writeln!(out, "# HELP pulse_http_error_rate Error fraction per route.");
    let _ = writeln!(out, "# TYPE pulse_http_error_rate gauge");
    for (method, path) in &route_keys {
        let (total, errors) = route_errors[&(method.clone(), path.clone())];
        let rate = if total > 0 {
            errors as f64 / total as f64
        } else {
            0.0
        };
        let _ = writeln!(
            out,
            "pulse_http_error_rate{{method=\"{}\",path=\"{}\"}} {rate:.6}",
            escape(method),
            escape(path)
        );
    }

    // Runtime gauges from the latest sample.
    if let Some(sample) = storage.latest_runtime_sample() {
        let _ = writeln!(out, "# HELP pulse_runtime_tasks Alive async tasks.");
        let _ = writeln!(out, "# TYPE pulse_runtime_tasks gauge");
        let _ = writeln!(out, "pulse_runtime_tasks {}", sample.tasks);
        let _ = writeln!(out, "# HELP pulse_runtime_heap_bytes Live heap bytes.");
        let _ = writeln!(out, "# TYPE pulse_runtime_heap_bytes gauge");
        let _ = writeln!(out, "pulse_runtime_heap_bytes {}", sample.heap_alloc_bytes);
        let _ = writeln!(out, "# HELP pulse_runtime_rss_bytes Resident set size.");
        let _ = writeln!(out, "# TYPE pulse_runtime_rss_bytes gauge");
        let _ = writeln!(out, "pulse_runtime_rss_bytes {}", sample.rss_bytes);
    }

    // Health gauges: 1 healthy, 0 unhealthy, -1 degraded/unknown.
    let health_results = storage.latest_health_results();
    if !health_results.is_empty() {
        let _ = writeln!(out, "# HELP pulse_health_check_status Health check state.");
        let _ = writeln!(out, "# TYPE pulse_health_check_status gauge");
        for result in &health_results {
            let value = match result.status {
                HealthStatus::Healthy => "1",
                HealthStatus::Unhealthy => "0",
                HealthStatus::Degraded => "-1",
            };
            let _ = writeln!(
                out,
                "pulse_health_check_status{{name=\"{}\"}} {value}",
                escape(&result.name)
            );
        }
    }

    // Error counters by classified type.
    let by_kind = storage.errors_by_kind();
    if !by_kind.is_empty() {
        let _ = writeln!(out, "# HELP pulse_errors_total Captured errors by type.");
        let _ = writeln!(out, "# TYPE pulse_errors_total counter");
        for (kind, count) in by_kind {
            let _ = writeln!(
                out,
                "pulse_errors_total{{type=\"{}\"}} {count}",
                kind.as_str()
            );
        }
    }

    // Query latency summaries by operation and table.
    let queries = storage.queries_in(from, now);
    let mut query_latencies: HashMap<(String, String), Vec<f64>> = HashMap::new();
    for q in &queries {
        query_latencies
            .entry((q.operation.clone(), q.table.clone()))
            .or_default()
            .push(q.duration_ms);
    }
    if !query_latencies.is_empty() {
        let _ = writeln!(out, "# HELP pulse_db_query_duration_seconds Query latency.");
        let _ = writeln!(out, "# TYPE pulse_db_query_duration_seconds summary");
        let mut query_keys: Vec<_> = query_latencies.keys().cloned().collect();
        query_keys.sort();
        for (operation, table) in &query_keys {
            let samples = &query_latencies[&(operation.clone(), table.clone())];
            for (q, label) in QUANTILES {
                let _ = writeln!(
                    out,
                    "pulse_db_query_duration_seconds{{operation=\"{}\",table=\"{}\",quantile=\"{}\"}} {:.6}",
                    escape(operation),
                    escape(table),
                    label,
                    stats::percentile(samples, *q) / 1_000.0
                );
            }
            let sum: f64 = samples.iter().sum();
            let _ = writeln!(
                out,
                "pulse_db_query_duration_seconds_sum{{operation=\"{}\",table=\"{}\"}} {:.6}",
                escape(operation),
                escape(table),
                sum / 1_000.0
            );
            let _ = writeln!(
                out,
                "pulse_db_query_duration_seconds_count{{operation=\"{}\",table=\"{}\"}} {}",
                escape(operation),
                escape(table),
                samples.len()
            );
        }
    }

    // Pool gauges.
    if let Some(pool) = storage.pool_stats() {
        let _ = writeln!(out, "# HELP pulse_db_pool_connections Connection pool state.");
        let _ = writeln!(out, "# TYPE pulse_db_pool_open gauge");
        let _ = writeln!(out, "pulse_db_pool_open {}", pool.open);
        let _ = writeln!(out, "# TYPE pulse_db_pool_in_use gauge");
        let _ = writeln!(out, "pulse_db_pool_in_use {}", pool.in_use);
        let _ = writeln!(out, "# TYPE pulse_db_pool_idle gauge");
        let _ = writeln!(out, "pulse_db_pool_idle {}", pool.idle);
        let _ = writeln!(out, "# TYPE pulse_db_pool_max_open gauge");
        let _ = writeln!(out, "pulse_db_pool_max_open {}", pool.max_open);
    }

    // Live hub and uptime.
    let _ = writeln!(out, "# HELP pulse_live_clients Connected live clients.");
    let _ = writeln!(out, "# TYPE pulse_live_clients gauge");
    let _ = writeln!(out, "pulse_live_clients {}", pulse.hub().client_count());

    let _ = writeln!(out, "# HELP pulse_uptime_seconds Engine uptime.");
    let _ = writeln!(out, "# TYPE pulse_uptime_seconds gauge");
    let _ = writeln!(out, "pulse_uptime_seconds {}", pulse.uptime().as_secs());

    out
}

/// Escape a label value per the exposition format.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_escaping() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("with \"quote\""), "with \\\"quote\\\"");
        assert_eq!(escape("back\\slash"), "back\\\\slash");
        assert_eq!(escape("new\nline"), "new\\nline");
    }

    #[tokio::test]
    async fn renders_request_metrics() {
        let pulse = crate::engine::Pulse::start(crate::config::PulseConfig::default_for_test());
        pulse.storage().add_request(crate::model::RequestRecord {
            method: "GET".into(),
            route: "/users/{id}".into(),
            status: 200,
            latency_ms: 12.0,
            request_bytes: 0,
            response_bytes: 10,
            client_ip: "t".into(),
            user_agent: "t".into(),
            error: None,
            trace_id: "00".repeat(16),
            timestamp: Utc::now(),
        });

        let body = render(&pulse);
        assert!(body.contains(
            "pulse_http_requests_total{method=\"GET\",path=\"/users/{id}\",status=\"200\"} 1"
        ));
        assert!(body.contains("pulse_http_request_duration_seconds_count"));
        assert!(body.contains("pulse_uptime_seconds"));
        pulse.shutdown().await;
    }
}
