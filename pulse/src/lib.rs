//! Pulse
//!
//! An in-process observability engine for axum + sqlx services. Mounted
//! onto a host router, it passively records requests, database queries,
//! runtime samples, errors and outbound dependency calls into bounded
//! in-memory buffers, and actively evaluates health checks and threshold
//! alerts. A read API, a WebSocket live channel, Prometheus exposition and
//! public health probes are served under one configurable prefix.
//!
//! ```ignore
//! use pulse::{Pulse, PulseConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pulse = Pulse::start(PulseConfig::default());
//!     let db = pulse.track_pool(pool);          // optional
//!     let app = pulse.instrument(app_router);   // wraps + mounts /pulse
//!     axum::serve(listener, app).await?;
//!     pulse.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod alerts;
pub mod alloc;
pub mod api;
pub mod classify;
pub mod config;
pub mod db;
pub mod deps;
pub mod engine;
pub mod errors;
pub mod health;
pub mod live;
pub mod model;
pub mod n1;
pub mod ring;
pub mod runtime;
pub mod sqlnorm;
pub mod stats;
pub mod storage;
pub mod timerange;
pub mod trace;
pub mod util;

mod ingest;
mod metrics;

pub use config::PulseConfig;
pub use db::TrackedPool;
pub use deps::{BreakerProbe, DependencyClient};
pub use engine::Pulse;
pub use errors::HandlerError;
pub use health::HealthCheck;
pub use live::LiveChannel;
pub use timerange::TimeRange;
pub use trace::{current_trace, TraceContext};
