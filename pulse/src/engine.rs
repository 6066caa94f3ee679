//! The engine root.
//!
//! [`Pulse`] owns storage, the aggregation cache, the live hub, the health
//! runner and the alert engine, and manages every background loop. Hosts
//! create one with [`Pulse::start`], wrap their router with
//! [`Pulse::instrument`], and optionally hand over a database pool with
//! [`Pulse::track_pool`].
//!
//! ```ignore
//! let pulse = Pulse::start(PulseConfig::default());
//! let db = pulse.track_pool(pool);
//! let app = pulse.instrument(app);
//! // ... axum::serve(listener, app) ...
//! pulse.shutdown().await;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::middleware::from_fn_with_state;
use axum::Router;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::{self, AggregateCache, TickInputs};
use crate::alerts::notify::Notifiers;
use crate::alerts::{AlertEngine, MetricSources};
use crate::config::PulseConfig;
use crate::db::{self, TrackedPool};
use crate::deps::{BreakerProbe, DependencyClient};
use crate::errors;
use crate::health::{HealthCheck, HealthRunner};
use crate::ingest::{self, Ingest};
use crate::live::{self, LiveChannel, LiveHub};
use crate::model::{ErrorRecord, HealthStatus, N1Detection, QueryRecord, RequestRecord};
use crate::n1::N1Tracker;
use crate::runtime::{self, LeakDetector};
use crate::storage::MemoryStorage;
use crate::{api, trace, util};

/// Retention sweep cadence.
const CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3_600);
/// Delay before the first health pass.
const HEALTH_WARMUP: std::time::Duration = std::time::Duration::from_secs(1);

/// A ticker whose first tick fires after one full period, not immediately.
fn delayed_interval(period: std::time::Duration) -> tokio::time::Interval {
    tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

/// The observability engine.
pub struct Pulse {
    config: PulseConfig,
    storage: Arc<MemoryStorage>,
    cache: AggregateCache,
    hub: LiveHub,
    health: HealthRunner,
    alerts: AlertEngine,
    notifiers: Notifiers,
    n1: N1Tracker,
    leak: LeakDetector,
    breakers: DashMap<String, Arc<dyn BreakerProbe>>,
    ingest_tx: mpsc::Sender<Ingest>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: Instant,
}

impl Pulse {
    /// Build the engine and start its background loops.
    ///
    /// Must be called from within a tokio runtime. With
    /// `config.enabled = Some(false)` the engine is inert: interceptors pass
    /// through and no loops run.
    pub fn start(config: PulseConfig) -> Arc<Self> {
        errors::install_panic_hook();

        let storage = Arc::new(MemoryStorage::new(&config.buffers));
        let (hub, hub_rx) = LiveHub::new();
        let (ingest_tx, ingest_rx) = mpsc::channel(ingest::QUEUE);

        let pulse = Arc::new(Self {
            health: HealthRunner::new(config.health.check_timeout()),
            alerts: AlertEngine::new(&config.alerts.rules),
            notifiers: Notifiers::from_config(&config.alerts),
            n1: N1Tracker::new(config.database.n1_threshold),
            leak: LeakDetector::new(config.runtime.leak_threshold_per_hour),
            breakers: DashMap::new(),
            storage,
            cache: AggregateCache::new(),
            hub,
            ingest_tx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: Instant::now(),
            config,
        });

        if pulse.config.is_enabled() {
            pulse.spawn_loops(hub_rx, ingest_rx);
            info!(prefix = %pulse.config.prefix, "Pulse engine started");
        } else {
            info!("Pulse engine disabled by configuration");
        }

        pulse
    }

    // ------------------------------------------------------------------
    // Host integration
    // ------------------------------------------------------------------

    /// Wrap the host router with both interceptors and mount the engine's
    /// own routes under the configured prefix.
    ///
    /// The error interceptor ends up outermost so it sees panics from every
    /// inner layer.
    pub fn instrument(self: &Arc<Self>, router: Router) -> Router {
        if !self.config.is_enabled() {
            return router;
        }
        router
            .merge(self.router())
            .layer(from_fn_with_state(Arc::clone(self), trace::track_requests))
            .layer(from_fn_with_state(Arc::clone(self), errors::capture_errors))
    }

    /// The engine's own routes (dashboard API, health probes, metrics,
    /// live channel), for hosts that mount manually.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new().nest(&self.config.prefix, api::router(Arc::clone(self)))
    }

    /// Wrap a database pool in the query interceptor. Also registers the
    /// automatic `database` health probe and starts the pool-stats sampler.
    pub fn track_pool(self: &Arc<Self>, pool: PgPool) -> TrackedPool {
        if self.config.is_enabled() {
            self.spawn_pool_sampler(pool.clone());

            let probe_pool = pool.clone();
            let check = HealthCheck::new("database", "database", move || {
                let pool = probe_pool.clone();
                async move {
                    sqlx::query("SELECT 1").execute(&pool).await?;
                    Ok(())
                }
            })
            .critical(true);
            let pulse = Arc::clone(self);
            self.spawn(async move {
                pulse.health.register(check).await;
            });
        }
        TrackedPool::new(pool, Arc::clone(self))
    }

    /// Wrap an outbound HTTP client under a dependency name.
    pub fn wrap_client(self: &Arc<Self>, client: reqwest::Client, name: &str) -> DependencyClient {
        DependencyClient::new(name.to_string(), client, Arc::clone(self))
    }

    /// Register a health check.
    pub async fn add_health_check(&self, check: HealthCheck) {
        self.health.register(check).await;
    }

    /// Stop every background loop and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("Pulse engine stopped");
    }

    /// Engine uptime.
    pub fn uptime(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    // ------------------------------------------------------------------
    // Internal accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &PulseConfig {
        &self.config
    }

    /// Direct access to the in-memory store. Most hosts never need this;
    /// it backs the read API and is handy for seeding tests.
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    pub(crate) fn cache(&self) -> &AggregateCache {
        &self.cache
    }

    pub(crate) fn hub(&self) -> &LiveHub {
        &self.hub
    }

    pub(crate) fn health(&self) -> &HealthRunner {
        &self.health
    }

    pub(crate) fn n1(&self) -> &N1Tracker {
        &self.n1
    }

    pub(crate) fn firing_alerts(&self) -> u64 {
        self.alerts.firing_count()
    }

    pub(crate) fn breaker_state(&self, name: &str) -> Option<&'static str> {
        self.breakers.get(name).map(|probe| probe.state())
    }

    pub(crate) fn register_breaker(&self, name: &str, probe: Arc<dyn BreakerProbe>) {
        self.breakers.insert(name.to_string(), probe);
    }

    // ------------------------------------------------------------------
    // Record submission (fire-and-forget)
    // ------------------------------------------------------------------

    pub(crate) fn submit_request(&self, record: RequestRecord) {
        if self.ingest_tx.try_send(Ingest::Request(record)).is_err() && self.config.dev {
            debug!("Ingest queue full, request record dropped");
        }
    }

    pub(crate) fn submit_query(&self, record: QueryRecord) {
        if self.ingest_tx.try_send(Ingest::Query(record)).is_err() && self.config.dev {
            debug!("Ingest queue full, query record dropped");
        }
    }

    pub(crate) fn submit_dependency(&self, metric: crate::model::DependencyMetric) {
        if self.ingest_tx.try_send(Ingest::Dependency(metric)).is_err() && self.config.dev {
            debug!("Ingest queue full, dependency metric dropped");
        }
    }

    /// Merge an error into storage synchronously (the merge is a cheap map
    /// operation and the live event needs the merged count).
    pub(crate) fn submit_error(&self, record: ErrorRecord) -> u64 {
        self.storage.add_error(record)
    }

    pub(crate) fn record_n1(&self, detection: N1Detection) {
        self.storage.add_n1(detection);
    }

    pub(crate) fn broadcast(&self, channel: LiveChannel, payload: serde_json::Value) {
        self.hub.broadcast(channel, payload);
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    fn spawn_loops(
        self: &Arc<Self>,
        hub_rx: mpsc::Receiver<live::HubCommand>,
        ingest_rx: mpsc::Receiver<Ingest>,
    ) {
        // Live hub registry.
        self.spawn(live::registry_loop(
            hub_rx,
            self.hub.registry_counter(),
            self.cancel.clone(),
        ));

        // Ingest worker.
        self.spawn(ingest::ingest_loop(
            ingest_rx,
            Arc::clone(&self.storage),
            self.cancel.clone(),
        ));

        // Runtime sampler.
        if self.config.runtime.is_enabled() {
            let pulse = Arc::clone(self);
            self.spawn(async move {
                let mut tick = delayed_interval(pulse.config.runtime.sample_interval());
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = pulse.cancel.cancelled() => break,
                        _ = tick.tick() => pulse.recovering(|p| p.sample_runtime()).await,
                    }
                }
            });
        }

        // Aggregator.
        let pulse = Arc::clone(self);
        self.spawn(async move {
            let mut tick = delayed_interval(pulse.config.aggregate_interval());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = pulse.cancel.cancelled() => break,
                    _ = tick.tick() => pulse.recovering(|p| p.aggregate_tick()).await,
                }
            }
        });

        // Health runner.
        if self.config.health.is_enabled() {
            let pulse = Arc::clone(self);
            self.spawn(async move {
                tokio::time::sleep(HEALTH_WARMUP).await;
                let mut tick = tokio::time::interval(pulse.config.health.check_interval());
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    let pulse2 = Arc::clone(&pulse);
                    tokio::select! {
                        () = pulse.cancel.cancelled() => break,
                        _ = tick.tick() => {
                            let pass = std::panic::AssertUnwindSafe(pulse2.health_pass())
                                .catch_unwind()
                                .await;
                            if pass.is_err() {
                                warn!("Health pass panicked; loop continues");
                            }
                        }
                    }
                }
            });
        }

        // Alert evaluator.
        if self.config.alerts.is_enabled() {
            let pulse = Arc::clone(self);
            self.spawn(async move {
                let mut tick = delayed_interval(pulse.config.evaluate_interval());
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = pulse.cancel.cancelled() => break,
                        _ = tick.tick() => pulse.recovering(|p| p.evaluate_alerts()).await,
                    }
                }
            });
        }

        // Retention sweeper.
        let pulse = Arc::clone(self);
        self.spawn(async move {
            let mut tick = delayed_interval(CLEANUP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = pulse.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let cutoff = Utc::now() - pulse.config.retention;
                        pulse.storage.cleanup(cutoff);
                    }
                }
            }
        });
    }

    fn spawn_pool_sampler(self: &Arc<Self>, pool: PgPool) {
        let pulse = Arc::clone(self);
        self.spawn(async move {
            let mut tick = delayed_interval(db::POOL_SAMPLE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = pulse.cancel.cancelled() => break,
                    _ = tick.tick() => {
                        pulse.storage.set_pool_stats(db::pool_snapshot(&pool));
                    }
                }
            }
        });
    }

    /// Run one synchronous tick body, recovering from panics so a bad tick
    /// never kills its loop.
    async fn recovering(self: &Arc<Self>, work: impl FnOnce(&Arc<Self>)) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work(self)));
        if result.is_err() {
            warn!("Background tick panicked; loop continues");
        }
    }

    // ------------------------------------------------------------------
    // Tick bodies
    // ------------------------------------------------------------------

    fn sample_runtime(self: &Arc<Self>) {
        let sample = runtime::capture_sample();
        self.storage.add_runtime_sample(sample);
        self.leak.observe(sample.timestamp, sample.tasks);

        self.broadcast(
            LiveChannel::Runtime,
            serde_json::json!({
                "heap_alloc_mb": util::bytes_to_mb(sample.heap_alloc_bytes),
                "heap_in_use_mb": util::bytes_to_mb(sample.heap_in_use_bytes),
                "tasks": sample.tasks,
                "rss_mb": util::bytes_to_mb(sample.rss_bytes),
                "alloc_count": sample.heap_objects,
            }),
        );
    }

    /// Recompute the aggregation cache and push the fresh overview.
    pub(crate) fn aggregate_tick(self: &Arc<Self>) {
        let inputs = TickInputs {
            active_alerts: self.alerts.firing_count(),
            health: self.health.composite(),
        };
        let next = aggregate::build(&self.storage, inputs, crate::timerange::TimeRange::OneHour);
        let overview = next.overview.clone();
        self.cache.swap(next);

        if let Some(overview) = overview {
            if let Ok(payload) = serde_json::to_value(&overview) {
                self.broadcast(LiveChannel::Overview, payload);
            }
        }
    }

    /// Evaluate the alert rules once and dispatch the outcome.
    pub(crate) fn evaluate_alerts(self: &Arc<Self>) {
        let sources = MetricSources {
            cache: &self.cache,
            storage: &self.storage,
            task_growth_per_hour: self.leak.growth_per_hour(),
            health: self.health.composite(),
        };
        let emitted = self
            .alerts
            .evaluate(&sources, self.config.alerts.cooldown(), Utc::now());

        for record in emitted {
            self.broadcast(
                LiveChannel::Alert,
                serde_json::json!({
                    "id": record.id,
                    "rule": record.rule,
                    "severity": record.severity,
                    "message": record.message,
                    "state": record.state,
                }),
            );
            self.storage.add_alert(record.clone());

            if !self.notifiers.is_empty() {
                let pulse = Arc::clone(self);
                // Best-effort delivery; never delays shutdown.
                tokio::spawn(async move {
                    pulse.notifiers.dispatch(&record).await;
                });
            }
        }
    }

    async fn health_pass(self: &Arc<Self>) {
        let latest: HashMap<String, HealthStatus> = self
            .storage
            .latest_health_results()
            .into_iter()
            .map(|r| (r.name.clone(), r.status))
            .collect();

        let mut results = Vec::new();
        self.health.run_due(&latest, |r| results.push(r)).await;

        for result in results {
            self.broadcast(
                LiveChannel::Health,
                serde_json::json!({
                    "name": result.name,
                    "status": result.status,
                    "latency_ms": result.latency_ms,
                    "error": result.error,
                }),
            );
            self.storage.add_health_result(result);
        }
    }

    /// Run one on-demand health check and record its result.
    pub(crate) async fn run_health_check(&self, name: &str) -> Option<crate::model::HealthResult> {
        let latest: HashMap<String, HealthStatus> = self
            .storage
            .latest_health_results()
            .into_iter()
            .map(|r| (r.name.clone(), r.status))
            .collect();
        let result = self.health.run_one(name, &latest).await?;
        self.storage.add_health_result(result.clone());
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_and_shutdown() {
        let pulse = Pulse::start(PulseConfig::default_for_test());
        assert!(pulse.uptime() < std::time::Duration::from_secs(5));
        pulse.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_engine_spawns_nothing() {
        let config = PulseConfig {
            enabled: Some(false),
            ..PulseConfig::default_for_test()
        };
        let pulse = Pulse::start(config);
        assert!(pulse.tasks.lock().unwrap().is_empty());
        pulse.shutdown().await;
    }

    #[tokio::test]
    async fn alert_lifecycle_through_engine() {
        let mut config = PulseConfig::default_for_test();
        config.alerts.rules = vec![crate::alerts::AlertRule {
            name: "high_error_rate".into(),
            metric: crate::alerts::AlertMetric::ErrorRate,
            operator: crate::alerts::AlertOp::Gt,
            threshold: 5.0,
            duration_secs: 0,
            severity: crate::model::Severity::Critical,
            route: None,
        }];
        let pulse = Pulse::start(config);

        let push = |status: u16, n: usize| {
            for _ in 0..n {
                pulse.storage().add_request(crate::model::RequestRecord {
                    method: "GET".into(),
                    route: "/orders".into(),
                    status,
                    latency_ms: 10.0,
                    request_bytes: 0,
                    response_bytes: 10,
                    client_ip: "t".into(),
                    user_agent: "t".into(),
                    error: None,
                    trace_id: trace::generate_trace_id(),
                    timestamp: Utc::now(),
                });
            }
        };

        // 100 requests, 20 % server errors -> rate 20 %.
        push(200, 80);
        push(500, 20);
        pulse.aggregate_tick();

        // First evaluation arms the rule, second fires it.
        pulse.evaluate_alerts();
        assert_eq!(pulse.firing_alerts(), 0);
        pulse.evaluate_alerts();
        assert_eq!(pulse.firing_alerts(), 1);

        let fired = pulse.storage().alerts(&crate::storage::AlertFilter::default());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].state, crate::model::AlertState::Firing);
        assert_eq!(fired[0].rule, "high_error_rate");

        // Recovery: a healthy window resolves the alert.
        pulse.storage().reset();
        push(200, 50);
        pulse.aggregate_tick();
        pulse.evaluate_alerts();

        assert_eq!(pulse.firing_alerts(), 0);
        let all = pulse.storage().alerts(&crate::storage::AlertFilter::default());
        assert_eq!(all.len(), 1); // reset dropped the firing record
        assert_eq!(all[0].state, crate::model::AlertState::Resolved);

        pulse.shutdown().await;
    }

    #[tokio::test]
    async fn aggregate_tick_populates_cache() {
        let pulse = Pulse::start(PulseConfig::default_for_test());
        pulse.storage().add_request(crate::model::RequestRecord {
            method: "GET".into(),
            route: "/x".into(),
            status: 200,
            latency_ms: 5.0,
            request_bytes: 0,
            response_bytes: 10,
            client_ip: "t".into(),
            user_agent: "t".into(),
            error: None,
            trace_id: trace::generate_trace_id(),
            timestamp: Utc::now(),
        });

        pulse.aggregate_tick();
        let overview = pulse.cache().overview().expect("overview cached");
        assert_eq!(overview.total_requests, 1);
        assert_eq!(pulse.cache().route_stats().len(), 1);

        pulse.shutdown().await;
    }
}
