//! Health checks.
//!
//! Registered checks run sequentially on a timer, each under its own
//! timeout. Results land in per-check history rings and feed the composite
//! state: any failing critical check makes the composite `unhealthy`, any
//! failing non-critical check `degraded`. A check whose recent history
//! oscillates is reported as flapping.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::model::{HealthResult, HealthStatus};

/// Results examined for flapping.
const FLAP_WINDOW: usize = 6;
/// Adjacent status transitions within the window that count as flapping.
const FLAP_TRANSITIONS: usize = 3;

type CheckFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// One registered health check.
#[derive(Clone)]
pub struct HealthCheck {
    pub name: String,
    /// Type tag shown in the dashboard, e.g. `database`, `http`, `custom`.
    pub kind: String,
    pub critical: bool,
    /// Per-check cadence; unset means every runner pass.
    pub interval: Option<std::time::Duration>,
    /// Per-check timeout; unset falls back to the global timeout.
    pub timeout: Option<std::time::Duration>,
    func: CheckFn,
}

impl HealthCheck {
    /// Create a check from an async probe. The probe passes when it returns
    /// `Ok(())`.
    pub fn new<F, Fut>(name: impl Into<String>, kind: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            kind: kind.into(),
            critical: false,
            interval: None,
            timeout: None,
            func: Arc::new(move || Box::pin(func())),
        }
    }

    /// A failing critical check makes the composite `unhealthy` instead of
    /// `degraded`.
    #[must_use]
    pub const fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    #[must_use]
    pub const fn interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    #[must_use]
    pub const fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Registered {
    check: HealthCheck,
    last_run: Option<Instant>,
}

/// Check registry plus composite state.
pub struct HealthRunner {
    checks: RwLock<Vec<Registered>>,
    composite: StdRwLock<HealthStatus>,
    global_timeout: std::time::Duration,
}

impl HealthRunner {
    pub fn new(global_timeout: std::time::Duration) -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
            composite: StdRwLock::new(HealthStatus::Healthy),
            global_timeout,
        }
    }

    /// Register a check. At most one registration per name; a duplicate
    /// replaces the earlier one.
    pub async fn register(&self, check: HealthCheck) {
        let mut checks = self.checks.write().await;
        checks.retain(|r| r.check.name != check.name);
        checks.push(Registered {
            check,
            last_run: None,
        });
    }

    pub async fn check_names(&self) -> Vec<String> {
        self.checks
            .read()
            .await
            .iter()
            .map(|r| r.check.name.clone())
            .collect()
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.checks
            .read()
            .await
            .iter()
            .any(|r| r.check.name == name)
    }

    /// Current composite state.
    pub fn composite(&self) -> HealthStatus {
        *self.composite.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Run every due check sequentially, handing each result to `sink`, then
    /// recompute the composite from the latest result per check.
    pub async fn run_due(&self, latest: &HashMap<String, HealthStatus>, mut sink: impl FnMut(HealthResult)) {
        let due: Vec<HealthCheck> = {
            let mut checks = self.checks.write().await;
            let now = Instant::now();
            let mut due = Vec::new();
            for registered in checks.iter_mut() {
                let ready = registered.check.interval.is_none_or(|interval| {
                    registered
                        .last_run
                        .is_none_or(|last| now.duration_since(last) >= interval)
                });
                if ready {
                    registered.last_run = Some(now);
                    due.push(registered.check.clone());
                }
            }
            due
        };

        let mut latest = latest.clone();
        for check in due {
            let result = self.execute(&check).await;
            latest.insert(result.name.clone(), result.status);
            sink(result);
        }

        self.recompute_composite(&latest).await;
    }

    /// Execute one check by name, out of band. `None` for unknown names.
    pub async fn run_one(
        &self,
        name: &str,
        latest: &HashMap<String, HealthStatus>,
    ) -> Option<HealthResult> {
        let check = {
            let checks = self.checks.read().await;
            checks
                .iter()
                .find(|r| r.check.name == name)
                .map(|r| r.check.clone())?
        };
        let result = self.execute(&check).await;

        let mut latest = latest.clone();
        latest.insert(result.name.clone(), result.status);
        self.recompute_composite(&latest).await;

        Some(result)
    }

    /// Run the probe under its timeout and shape the outcome.
    async fn execute(&self, check: &HealthCheck) -> HealthResult {
        let timeout = check.timeout.unwrap_or(self.global_timeout);
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, (check.func)()).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let (status, error) = match outcome {
            Ok(Ok(())) => (HealthStatus::Healthy, None),
            Ok(Err(e)) => (HealthStatus::Unhealthy, Some(e.to_string())),
            Err(_) => (
                HealthStatus::Unhealthy,
                Some(format!("check timed out after {}s", timeout.as_secs())),
            ),
        };

        HealthResult {
            name: check.name.clone(),
            kind: check.kind.clone(),
            status,
            latency_ms,
            error,
            timestamp: Utc::now(),
        }
    }

    async fn recompute_composite(&self, latest: &HashMap<String, HealthStatus>) {
        let checks = self.checks.read().await;
        let mut composite = HealthStatus::Healthy;
        for registered in checks.iter() {
            let Some(status) = latest.get(&registered.check.name) else {
                continue;
            };
            if *status != HealthStatus::Healthy {
                if registered.check.critical {
                    composite = HealthStatus::Unhealthy;
                    break;
                }
                composite = HealthStatus::Degraded;
            }
        }
        *self.composite.write().unwrap_or_else(|e| e.into_inner()) = composite;
    }
}

/// Whether a check's recent history oscillates: at least
/// [`FLAP_TRANSITIONS`] adjacent status changes among its last
/// [`FLAP_WINDOW`] results (newest first).
pub fn is_flapping(history: &[HealthResult]) -> bool {
    let window: Vec<HealthStatus> = history.iter().take(FLAP_WINDOW).map(|r| r.status).collect();
    if window.len() < 2 {
        return false;
    }
    let transitions = window.windows(2).filter(|w| w[0] != w[1]).count();
    transitions >= FLAP_TRANSITIONS
}
