//! Minimal host application with Pulse mounted.
//!
//! ```sh
//! cargo run --example basic
//! # then: curl -i http://localhost:3000/hello
//! #       curl http://localhost:3000/pulse/health
//! ```

use axum::routing::get;
use axum::Router;
use pulse::{HealthCheck, Pulse, PulseConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse=debug,basic=debug".into()),
        )
        .init();

    let config = PulseConfig {
        dev: true,
        auth: pulse::config::AuthConfig {
            jwt_secret: "change-me".into(),
            username: "admin".into(),
            password: "admin".into(),
        },
        ..PulseConfig::default()
    };
    let pulse = Pulse::start(config);

    pulse
        .add_health_check(HealthCheck::new("self", "custom", || async { Ok(()) }))
        .await;

    let app = Router::new()
        .route("/hello", get(|| async { "hello" }))
        .route(
            "/flaky",
            get(|| async {
                if rand_like() {
                    axum::http::StatusCode::OK
                } else {
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
    let app = pulse.instrument(app);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    println!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    pulse.shutdown().await;
    Ok(())
}

/// Cheap pseudo-coin-flip off the clock, good enough for a demo.
fn rand_like() -> bool {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() % 3 != 0)
        .unwrap_or(true)
}
