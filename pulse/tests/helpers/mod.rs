//! Reusable test helpers.
//!
//! Provides `TestApp`: a small host application instrumented with Pulse,
//! driven through `tower::ServiceExt::oneshot`, plus JSON and auth
//! conveniences.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use http_body_util::BodyExt;
use pulse::{HandlerError, Pulse, PulseConfig};
use tower::ServiceExt;

pub struct TestApp {
    pub pulse: Arc<Pulse>,
    pub router: Router,
}

impl TestApp {
    /// Instrument a representative host app with a default test config.
    pub fn new() -> Self {
        Self::with_config(PulseConfig::default_for_test())
    }

    pub fn with_config(config: PulseConfig) -> Self {
        let pulse = Pulse::start(config);
        let router = pulse.instrument(host_router());
        Self { pulse, router }
    }

    /// Send a request through the full middleware stack.
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible router")
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.request(
            Request::builder()
                .method(Method::GET)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn get_auth(&self, uri: &str, token: &str) -> Response<Body> {
        self.request(
            Request::builder()
                .method(Method::GET)
                .uri(uri)
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post_json_auth(
        &self,
        uri: &str,
        token: &str,
        body: serde_json::Value,
    ) -> Response<Body> {
        self.request(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    /// Log in with the test credentials and return the bearer token.
    pub async fn login(&self) -> String {
        let response = self
            .request(
                Request::builder()
                    .method(Method::POST)
                    .uri("/pulse/api/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"username": "admin", "password": "admin"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK, "login must succeed");
        let body = json_body(response).await;
        body["token"].as_str().expect("token issued").to_string()
    }
}

/// Poll until `condition` holds or a one-second deadline passes. Records
/// travel through the async ingest worker, so assertions on storage need a
/// moment to settle.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}

/// Let the ingest worker drain anything in flight.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

/// Collect a response body as JSON.
pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body readable")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("valid JSON body")
}

/// Collect a response body as text.
pub async fn text_body(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body readable")
        .to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// The host application the tests observe.
pub fn host_router() -> Router {
    Router::new()
        .route("/users/{id}", get(|| async { "ok" }))
        .route("/boom", get(boom_handler))
        .route("/fail", get(failing_handler))
        .route("/error500", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
}

async fn boom_handler() {
    panic!("boom handler");
}

async fn failing_handler() -> axum::response::Response {
    let mut response = (StatusCode::BAD_REQUEST, "validation failed").into_response();
    response
        .extensions_mut()
        .insert(HandlerError::new("validation failed"));
    response
}
