//! Threshold alerting.
//!
//! Rules are evaluated on a timer against the aggregator cache and storage.
//! Each rule runs a small state machine with hysteresis: a breached
//! threshold must hold for the rule's duration before it fires, and a fired
//! rule emits exactly one resolution when the condition clears. A cooldown
//! suppresses repeat notifications without blocking the state transition.

pub mod notify;

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::AggregateCache;
use crate::model::{AlertRecord, AlertState, HealthStatus, Severity};
use crate::storage::MemoryStorage;

/// Metric a rule evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    /// Max p95 latency across routes (ms), or one route when `route` is set.
    P95Latency,
    /// Error rate percentage, overall or per route.
    ErrorRate,
    /// Live heap of the tracking allocator, in MB.
    HeapAllocMb,
    /// Task-count growth per hour from the leak detector.
    TaskGrowth,
    /// Composite health mapped to `1.0` / `0.5` / `0.0`.
    HealthStatus,
}

impl AlertMetric {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::P95Latency => "p95_latency",
            Self::ErrorRate => "error_rate",
            Self::HeapAllocMb => "heap_alloc_mb",
            Self::TaskGrowth => "task_growth",
            Self::HealthStatus => "health_status",
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "==")]
    Eq,
}

impl AlertOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Eq => "==",
        }
    }

    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
            Self::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

/// One alert rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: AlertMetric,
    pub operator: AlertOp,
    pub threshold: f64,
    /// How long the condition must hold before the rule fires.
    pub duration_secs: u64,
    pub severity: Severity,
    /// Restrict latency / error-rate metrics to one route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

impl AlertRule {
    const fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs as i64)
    }
}

/// Built-in rule set; user rules with the same name replace these.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            name: "high_latency".into(),
            metric: AlertMetric::P95Latency,
            operator: AlertOp::Gt,
            threshold: 2_000.0,
            duration_secs: 300,
            severity: Severity::Warning,
            route: None,
        },
        AlertRule {
            name: "high_error_rate".into(),
            metric: AlertMetric::ErrorRate,
            operator: AlertOp::Gt,
            threshold: 10.0,
            duration_secs: 180,
            severity: Severity::Critical,
            route: None,
        },
        AlertRule {
            name: "high_memory".into(),
            metric: AlertMetric::HeapAllocMb,
            operator: AlertOp::Gt,
            threshold: 500.0,
            duration_secs: 300,
            severity: Severity::Warning,
            route: None,
        },
        AlertRule {
            name: "task_leak".into(),
            metric: AlertMetric::TaskGrowth,
            operator: AlertOp::Gt,
            threshold: 100.0,
            duration_secs: 600,
            severity: Severity::Warning,
            route: None,
        },
        AlertRule {
            name: "health_check_failure".into(),
            metric: AlertMetric::HealthStatus,
            operator: AlertOp::Eq,
            threshold: 0.0,
            duration_secs: 120,
            severity: Severity::Critical,
            route: None,
        },
    ]
}

/// Everything the evaluator reads metrics from.
pub struct MetricSources<'a> {
    pub cache: &'a AggregateCache,
    pub storage: &'a MemoryStorage,
    pub task_growth_per_hour: Option<f64>,
    pub health: HealthStatus,
}

impl MetricSources<'_> {
    fn resolve(&self, rule: &AlertRule) -> Option<f64> {
        match rule.metric {
            AlertMetric::P95Latency => {
                let stats = self.cache.route_stats();
                match &rule.route {
                    Some(route) => stats
                        .iter()
                        .find(|s| &s.route == route)
                        .map(|s| s.latency.p95),
                    None => stats
                        .iter()
                        .map(|s| s.latency.p95)
                        .fold(None, |acc: Option<f64>, p| {
                            Some(acc.map_or(p, |a| a.max(p)))
                        }),
                }
            }
            AlertMetric::ErrorRate => match &rule.route {
                Some(route) => self
                    .cache
                    .route_stats()
                    .iter()
                    .find(|s| &s.route == route)
                    .map(|s| s.error_rate),
                None => self.cache.overview().map(|o| o.error_rate),
            },
            AlertMetric::HeapAllocMb => self
                .storage
                .latest_runtime_sample()
                .map(|s| crate::util::bytes_to_mb(s.heap_alloc_bytes)),
            AlertMetric::TaskGrowth => self.task_growth_per_hour,
            AlertMetric::HealthStatus => Some(match self.health {
                HealthStatus::Healthy => 1.0,
                HealthStatus::Degraded => 0.5,
                HealthStatus::Unhealthy => 0.0,
            }),
        }
    }
}

struct RuleState {
    rule: AlertRule,
    state: AlertState,
    pending_since: Option<DateTime<Utc>>,
    last_fired: Option<DateTime<Utc>>,
}

/// The per-rule state machines, linearized under one lock per tick.
pub struct AlertEngine {
    states: Mutex<Vec<RuleState>>,
}

impl AlertEngine {
    /// Merge user rules over the defaults (same name overrides).
    pub fn new(user_rules: &[AlertRule]) -> Self {
        let mut rules = default_rules();
        for user in user_rules {
            match rules.iter_mut().find(|r| r.name == user.name) {
                Some(existing) => *existing = user.clone(),
                None => rules.push(user.clone()),
            }
        }
        let states = rules
            .into_iter()
            .map(|rule| RuleState {
                rule,
                state: AlertState::Ok,
                pending_since: None,
                last_fired: None,
            })
            .collect();
        Self {
            states: Mutex::new(states),
        }
    }

    /// Number of rules currently firing.
    pub fn firing_count(&self) -> u64 {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .iter()
            .filter(|s| s.state == AlertState::Firing)
            .count() as u64
    }

    /// Run one evaluation tick.
    ///
    /// Returns the alert records created this tick (firings and
    /// resolutions); the caller stores, broadcasts and dispatches them.
    /// Inside the cooldown window a rule still transitions to `firing`, but
    /// no record is produced and no notification goes out.
    pub fn evaluate(
        &self,
        sources: &MetricSources<'_>,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Vec<AlertRecord> {
        let mut emitted = Vec::new();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());

        for rs in states.iter_mut() {
            let value = sources.resolve(&rs.rule);
            let met = value.is_some_and(|v| rs.rule.operator.compare(v, rs.rule.threshold));
            let value = value.unwrap_or(0.0);

            match rs.state {
                AlertState::Ok | AlertState::Resolved => {
                    if met {
                        rs.state = AlertState::Pending;
                        rs.pending_since = Some(now);
                    } else {
                        rs.state = AlertState::Ok;
                    }
                }
                AlertState::Pending => {
                    if !met {
                        rs.state = AlertState::Ok;
                        rs.pending_since = None;
                    } else if rs
                        .pending_since
                        .is_some_and(|since| now - since >= rs.rule.duration())
                    {
                        rs.state = AlertState::Firing;
                        let in_cooldown = rs
                            .last_fired
                            .is_some_and(|fired| now - fired < cooldown);
                        if !in_cooldown {
                            rs.last_fired = Some(now);
                            emitted.push(make_record(&rs.rule, AlertState::Firing, value, now));
                        }
                    }
                }
                AlertState::Firing => {
                    if !met {
                        rs.state = AlertState::Ok;
                        rs.pending_since = None;
                        let mut record = make_record(&rs.rule, AlertState::Resolved, value, now);
                        record.resolved_at = Some(now);
                        emitted.push(record);
                    }
                }
            }
        }

        emitted
    }
}

fn make_record(rule: &AlertRule, state: AlertState, value: f64, now: DateTime<Utc>) -> AlertRecord {
    let message = match state {
        AlertState::Resolved => format!(
            "{} recovered: {} is {:.2} (threshold {} {})",
            rule.name,
            rule.metric.as_str(),
            value,
            rule.operator.as_str(),
            rule.threshold
        ),
        _ => format!(
            "{}: {} is {:.2} (threshold {} {})",
            rule.name,
            rule.metric.as_str(),
            value,
            rule.operator.as_str(),
            rule.threshold
        ),
    };

    AlertRecord {
        id: Uuid::new_v4(),
        rule: rule.name.clone(),
        metric: rule.metric.as_str().into(),
        value,
        threshold: rule.threshold,
        operator: rule.operator.as_str().into(),
        severity: rule.severity,
        state,
        route: rule.route.clone(),
        message,
        fired_at: now,
        resolved_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateCache, CachedAggregates};
    use crate::config::BufferConfig;
    use crate::model::Overview;

    fn overview_with_error_rate(rate: f64) -> Overview {
        Overview {
            total_requests: 100,
            total_errors: (rate as u64).min(100),
            error_rate: rate,
            avg_latency_ms: 10.0,
            p95_latency_ms: 20.0,
            requests_per_minute: 10.0,
            tasks: 5,
            heap_alloc_mb: 1.0,
            active_alerts: 0,
            top_routes: Vec::new(),
            recent_errors: Vec::new(),
            throughput: Vec::new(),
            error_series: Vec::new(),
            health: HealthStatus::Healthy,
            generated_at: Utc::now(),
        }
    }

    fn cache_with_rate(rate: f64) -> AggregateCache {
        let cache = AggregateCache::new();
        cache.swap(CachedAggregates {
            overview: Some(overview_with_error_rate(rate)),
            updated_at: Some(Utc::now()),
            ..CachedAggregates::default()
        });
        cache
    }

    fn rate_rule(duration_secs: u64) -> AlertRule {
        AlertRule {
            name: "high_error_rate".into(),
            metric: AlertMetric::ErrorRate,
            operator: AlertOp::Gt,
            threshold: 5.0,
            duration_secs,
            severity: Severity::Critical,
            route: None,
        }
    }

    #[test]
    fn user_rule_overrides_default_by_name() {
        let engine = AlertEngine::new(&[rate_rule(0)]);
        let states = engine.states.lock().unwrap();
        let rule = states
            .iter()
            .map(|s| &s.rule)
            .find(|r| r.name == "high_error_rate")
            .unwrap();
        assert_eq!(rule.duration_secs, 0);
        assert!((rule.threshold - 5.0).abs() < f64::EPSILON);
        // The other defaults are still present.
        assert!(states.iter().any(|s| s.rule.name == "high_latency"));
    }

    #[test]
    fn lifecycle_ok_pending_firing_resolved() {
        let storage = MemoryStorage::new(&BufferConfig::default());
        let engine = AlertEngine::new(&[rate_rule(0)]);
        let cooldown = Duration::seconds(300);

        let breached = cache_with_rate(20.0);
        let sources = MetricSources {
            cache: &breached,
            storage: &storage,
            task_growth_per_hour: None,
            health: HealthStatus::Healthy,
        };

        // First eval: pending, nothing emitted.
        let now = Utc::now();
        assert!(engine.evaluate(&sources, cooldown, now).is_empty());
        assert_eq!(engine.firing_count(), 0);

        // Second eval: fires.
        let fired = engine.evaluate(&sources, cooldown, now + Duration::seconds(1));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].state, AlertState::Firing);
        assert_eq!(fired[0].rule, "high_error_rate");
        assert_eq!(engine.firing_count(), 1);

        // Condition clears: exactly one resolution, paired to the firing.
        let healthy = cache_with_rate(0.0);
        let sources = MetricSources {
            cache: &healthy,
            storage: &storage,
            task_growth_per_hour: None,
            health: HealthStatus::Healthy,
        };
        let resolved = engine.evaluate(&sources, cooldown, now + Duration::seconds(2));
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].state, AlertState::Resolved);
        assert!(resolved[0].resolved_at.is_some());
        assert_eq!(engine.firing_count(), 0);
    }

    #[test]
    fn pending_clears_without_firing() {
        let storage = MemoryStorage::new(&BufferConfig::default());
        let engine = AlertEngine::new(&[rate_rule(600)]);
        let cooldown = Duration::seconds(300);
        let now = Utc::now();

        let breached = cache_with_rate(20.0);
        let sources = MetricSources {
            cache: &breached,
            storage: &storage,
            task_growth_per_hour: None,
            health: HealthStatus::Healthy,
        };
        assert!(engine.evaluate(&sources, cooldown, now).is_empty());

        let healthy = cache_with_rate(0.0);
        let sources = MetricSources {
            cache: &healthy,
            storage: &storage,
            task_growth_per_hour: None,
            health: HealthStatus::Healthy,
        };
        assert!(engine
            .evaluate(&sources, cooldown, now + Duration::seconds(30))
            .is_empty());
        assert_eq!(engine.firing_count(), 0);
    }

    #[test]
    fn duration_gates_firing() {
        let storage = MemoryStorage::new(&BufferConfig::default());
        let engine = AlertEngine::new(&[rate_rule(60)]);
        let cooldown = Duration::seconds(300);
        let now = Utc::now();

        let breached = cache_with_rate(20.0);
        let sources = MetricSources {
            cache: &breached,
            storage: &storage,
            task_growth_per_hour: None,
            health: HealthStatus::Healthy,
        };

        assert!(engine.evaluate(&sources, cooldown, now).is_empty());
        // 30 s in: still pending.
        assert!(engine
            .evaluate(&sources, cooldown, now + Duration::seconds(30))
            .is_empty());
        // 61 s in: fires.
        let fired = engine.evaluate(&sources, cooldown, now + Duration::seconds(61));
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn cooldown_suppresses_repeat_notification_but_still_fires() {
        let storage = MemoryStorage::new(&BufferConfig::default());
        let engine = AlertEngine::new(&[rate_rule(0)]);
        let cooldown = Duration::seconds(300);
        let now = Utc::now();

        let breached = cache_with_rate(20.0);
        let healthy = cache_with_rate(0.0);

        let breached_sources = MetricSources {
            cache: &breached,
            storage: &storage,
            task_growth_per_hour: None,
            health: HealthStatus::Healthy,
        };
        let healthy_sources = MetricSources {
            cache: &healthy,
            storage: &storage,
            task_growth_per_hour: None,
            health: HealthStatus::Healthy,
        };

        // Fire once.
        engine.evaluate(&breached_sources, cooldown, now);
        let first = engine.evaluate(&breached_sources, cooldown, now + Duration::seconds(1));
        assert_eq!(first.len(), 1);

        // Resolve, then breach again inside the cooldown window.
        engine.evaluate(&healthy_sources, cooldown, now + Duration::seconds(2));
        engine.evaluate(&breached_sources, cooldown, now + Duration::seconds(3));
        let second = engine.evaluate(&breached_sources, cooldown, now + Duration::seconds(4));

        // State is firing again but no record was emitted.
        assert!(second.iter().all(|r| r.state != AlertState::Firing));
        assert_eq!(engine.firing_count(), 1);
    }

    #[test]
    fn health_status_rule_fires_on_unhealthy() {
        let storage = MemoryStorage::new(&BufferConfig::default());
        let mut rule = default_rules()
            .into_iter()
            .find(|r| r.name == "health_check_failure")
            .unwrap();
        rule.duration_secs = 0;
        let engine = AlertEngine::new(&[rule]);
        let cache = cache_with_rate(0.0);
        let now = Utc::now();

        let sources = MetricSources {
            cache: &cache,
            storage: &storage,
            task_growth_per_hour: None,
            health: HealthStatus::Unhealthy,
        };
        engine.evaluate(&sources, Duration::seconds(300), now);
        let fired = engine.evaluate(&sources, Duration::seconds(300), now + Duration::seconds(1));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, "health_check_failure");
    }
}
