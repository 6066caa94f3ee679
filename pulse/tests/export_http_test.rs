//! Export and reset endpoints.

mod helpers;

use axum::http::StatusCode;
use helpers::{eventually, json_body, text_body, TestApp};

#[tokio::test]
async fn json_export_round_trips_the_selection() {
    let app = TestApp::new();
    let token = app.login().await;

    for i in 0..4 {
        app.get(&format!("/users/{i}")).await;
    }
    assert!(eventually(|| app.pulse.storage().request_count() == 4).await);

    let response = app
        .post_json_auth(
            "/pulse/api/data/export",
            &token,
            serde_json::json!({"format": "json", "type": "requests", "range": "1h"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let disposition = response
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("pulse_requests_1h.json"));

    let body = json_body(response).await;
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r["route"] == "/users/{id}"));

    app.pulse.shutdown().await;
}

#[tokio::test]
async fn csv_export_has_header_and_one_row_per_record() {
    let app = TestApp::new();
    let token = app.login().await;

    for i in 0..3 {
        app.get(&format!("/users/{i}")).await;
    }
    assert!(eventually(|| app.pulse.storage().request_count() == 3).await);

    let response = app
        .post_json_auth(
            "/pulse/api/data/export",
            &token,
            serde_json::json!({"format": "csv", "type": "requests"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/csv"));

    let body = text_body(response).await;
    let lines: Vec<&str> = body.trim_end().lines().collect();
    assert_eq!(lines.len(), 4, "header plus three rows");
    assert!(lines[0].starts_with("timestamp,method,route"));

    app.pulse.shutdown().await;
}

#[tokio::test]
async fn unknown_export_type_is_rejected() {
    let app = TestApp::new();
    let token = app.login().await;

    let response = app
        .post_json_auth(
            "/pulse/api/data/export",
            &token,
            serde_json::json!({"format": "json", "type": "sessions"}),
        )
        .await;
    // Serde rejects the unknown type before the handler runs.
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    app.pulse.shutdown().await;
}

#[tokio::test]
async fn reset_requires_confirmation() {
    let app = TestApp::new();
    let token = app.login().await;

    app.get("/users/1").await;
    app.get("/fail").await;
    assert!(eventually(|| app.pulse.storage().request_count() == 2).await);
    assert_eq!(app.pulse.storage().error_group_count(), 1);

    // No confirm: 400, nothing deleted.
    let response = app
        .post_json_auth("/pulse/api/data/reset", &token, serde_json::json!({}))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.pulse.storage().request_count(), 2);

    // Confirmed: everything cleared.
    let response = app
        .post_json_auth(
            "/pulse/api/data/reset",
            &token,
            serde_json::json!({"confirm": true}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "data reset complete");
    assert_eq!(app.pulse.storage().request_count(), 0);
    assert_eq!(app.pulse.storage().error_group_count(), 0);

    app.pulse.shutdown().await;
}
