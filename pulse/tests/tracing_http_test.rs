//! Request tracing through the full middleware stack.

mod helpers;

use axum::http::StatusCode;
use helpers::{eventually, settle, TestApp};
use pulse::PulseConfig;

#[tokio::test]
async fn traced_request_gets_trace_header_and_route_pattern() {
    let app = TestApp::new();

    let response = app.get("/users/42").await;
    assert_eq!(response.status(), StatusCode::OK);

    let trace_id = response
        .headers()
        .get("x-pulse-trace-id")
        .expect("trace header set")
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(trace_id.len(), 32);
    assert!(trace_id.chars().all(|c| c.is_ascii_hexdigit()));

    assert!(eventually(|| app.pulse.storage().request_count() == 1).await);

    // The record carries the router template, never the expanded path.
    let recorded = app.pulse.storage().recent_requests(10);
    assert_eq!(recorded[0].route, "/users/{id}");
    assert_eq!(recorded[0].method, "GET");
    assert_eq!(recorded[0].trace_id, trace_id);

    app.pulse.shutdown().await;
}

#[tokio::test]
async fn each_request_gets_a_distinct_trace_id() {
    let app = TestApp::new();

    let a = app.get("/users/1").await;
    let b = app.get("/users/2").await;
    let id = |r: &axum::response::Response| {
        r.headers()
            .get("x-pulse-trace-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    };
    assert_ne!(id(&a), id(&b));

    app.pulse.shutdown().await;
}

#[tokio::test]
async fn engine_routes_are_excluded_from_tracing() {
    let app = TestApp::new();

    let response = app.get("/pulse/health/live").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-pulse-trace-id").is_none());

    settle().await;
    assert_eq!(app.pulse.storage().request_count(), 0);

    app.pulse.shutdown().await;
}

#[tokio::test]
async fn zero_sample_rate_still_records_errors() {
    let mut config = PulseConfig::default_for_test();
    config.tracing.sample_rate = 0.0;
    let app = TestApp::with_config(config);

    // A normal success is sampled out entirely.
    app.get("/users/1").await;
    settle().await;
    assert_eq!(app.pulse.storage().request_count(), 0);

    // An error status is always kept.
    let response = app.get("/fail").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(eventually(|| app.pulse.storage().request_count() == 1).await);

    let recorded = app.pulse.storage().recent_requests(10);
    assert_eq!(recorded[0].status, 400);
    assert_eq!(recorded[0].error.as_deref(), Some("validation failed"));

    app.pulse.shutdown().await;
}

#[tokio::test]
async fn disabled_tracing_passes_through() {
    let mut config = PulseConfig::default_for_test();
    config.tracing.enabled = Some(false);
    let app = TestApp::with_config(config);

    let response = app.get("/users/7").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-pulse-trace-id").is_none());

    settle().await;
    assert_eq!(app.pulse.storage().request_count(), 0);

    app.pulse.shutdown().await;
}
