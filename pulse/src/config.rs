//! Engine configuration.
//!
//! Integrators build a [`PulseConfig`] in code and hand it to
//! [`crate::Pulse::start`]; there are no required environment variables.
//! Boolean toggles that default to *on* are tri-state (`Option<bool>`) so
//! that "not set" and "explicitly disabled" stay distinguishable; the
//! accessor methods fill in the defaults.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::alerts::AlertRule;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// URL prefix the engine mounts under.
    pub prefix: String,

    /// Dev mode: faster aggregation/evaluation ticks and debug logging of
    /// swallowed storage failures.
    pub dev: bool,

    /// Master switch. `None` means enabled.
    pub enabled: Option<bool>,

    /// Request tracing interceptor settings.
    pub tracing: TracingConfig,

    /// Error interceptor settings.
    pub errors: ErrorConfig,

    /// Query interceptor settings.
    pub database: DatabaseConfig,

    /// Runtime sampler settings.
    pub runtime: RuntimeConfig,

    /// Health runner settings.
    pub health: HealthConfig,

    /// Alert engine settings.
    pub alerts: AlertConfig,

    /// Ring buffer capacities.
    pub buffers: BufferConfig,

    /// Dashboard authentication.
    pub auth: AuthConfig,

    /// Prometheus exposition endpoint. `None` means enabled.
    pub metrics_enabled: Option<bool>,

    /// Retention for errors, alerts and N+1 detections. Ring buffers are
    /// bounded by capacity instead.
    #[serde(with = "duration_secs")]
    pub retention: Duration,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            prefix: "/pulse".into(),
            dev: false,
            enabled: None,
            tracing: TracingConfig::default(),
            errors: ErrorConfig::default(),
            database: DatabaseConfig::default(),
            runtime: RuntimeConfig::default(),
            health: HealthConfig::default(),
            alerts: AlertConfig::default(),
            buffers: BufferConfig::default(),
            auth: AuthConfig::default(),
            metrics_enabled: None,
            retention: Duration::hours(24),
        }
    }
}

impl PulseConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled.unwrap_or(true)
    }

    /// Aggregator tick interval (10 s, 5 s in dev).
    pub fn aggregate_interval(&self) -> std::time::Duration {
        if self.dev {
            std::time::Duration::from_secs(5)
        } else {
            std::time::Duration::from_secs(10)
        }
    }

    /// Alert evaluation interval (30 s, 10 s in dev).
    pub fn evaluate_interval(&self) -> std::time::Duration {
        if self.dev {
            std::time::Duration::from_secs(10)
        } else {
            std::time::Duration::from_secs(30)
        }
    }

    /// Copy of the config safe to serve from the settings endpoint.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.auth.jwt_secret.is_empty() {
            copy.auth.jwt_secret = "[REDACTED]".into();
        }
        if !copy.auth.password.is_empty() {
            copy.auth.password = "[REDACTED]".into();
        }
        if let Some(webhook) = &mut copy.alerts.webhook {
            if webhook.secret.is_some() {
                webhook.secret = Some("[REDACTED]".into());
            }
        }
        if let Some(email) = &mut copy.alerts.email {
            if email.password.is_some() {
                email.password = Some("[REDACTED]".into());
            }
        }
        copy
    }

    /// A permissive configuration for tests: dev mode, sampling at 1.0,
    /// deterministic secret.
    pub fn default_for_test() -> Self {
        Self {
            dev: true,
            auth: AuthConfig {
                jwt_secret: "test-secret".into(),
                username: "admin".into(),
                password: "admin".into(),
            },
            ..Self::default()
        }
    }
}

/// Request tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// `None` means enabled.
    pub enabled: Option<bool>,
    /// Fraction of successful, fast requests to record. Errors and slow
    /// requests are always recorded.
    pub sample_rate: f64,
    /// Latency above which a request counts as slow.
    pub slow_request_ms: u64,
    /// Glob patterns (in addition to the built-ins) excluded from tracing.
    pub exclude: Vec<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            sample_rate: 1.0,
            slow_request_ms: 1_000,
            exclude: Vec::new(),
        }
    }
}

impl TracingConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Error interceptor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorConfig {
    /// `None` means enabled.
    pub enabled: Option<bool>,
    /// Capture request bodies into error context. Off by default: bodies may
    /// contain user data.
    pub capture_body: bool,
    /// Maximum number of request body bytes to retain.
    pub max_body_bytes: usize,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            capture_body: false,
            max_body_bytes: 4_096,
        }
    }
}

impl ErrorConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Query interceptor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `None` means enabled.
    pub enabled: Option<bool>,
    /// Duration above which a query counts as slow.
    pub slow_query_ms: u64,
    /// Identical-pattern repetitions within one request that trigger an
    /// N+1 detection.
    pub n1_threshold: u32,
    /// `None` means enabled.
    pub n1_detection: Option<bool>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            slow_query_ms: 100,
            n1_threshold: 5,
            n1_detection: None,
        }
    }
}

impl DatabaseConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn n1_enabled(&self) -> bool {
        self.n1_detection.unwrap_or(true)
    }
}

/// Runtime sampler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `None` means enabled.
    pub enabled: Option<bool>,
    pub sample_interval_secs: u64,
    /// Task growth per hour above which the process is flagged as leaking.
    pub leak_threshold_per_hour: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            sample_interval_secs: 5,
            leak_threshold_per_hour: 100.0,
        }
    }
}

impl RuntimeConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn sample_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sample_interval_secs.max(1))
    }
}

/// Health runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// `None` means enabled.
    pub enabled: Option<bool>,
    pub check_interval_secs: u64,
    /// Global per-check timeout; individual checks may override.
    pub check_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            check_interval_secs: 30,
            check_timeout_secs: 10,
        }
    }
}

impl HealthConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn check_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_timeout_secs.max(1))
    }
}

/// Alert engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// `None` means enabled.
    pub enabled: Option<bool>,
    /// Minimum interval between successive notifications for one rule.
    pub cooldown_secs: u64,
    /// User rules; a rule with the same name as a default overrides it.
    pub rules: Vec<AlertRule>,
    /// Slack incoming-webhook URL.
    pub slack_webhook_url: Option<String>,
    /// Discord webhook URL.
    pub discord_webhook_url: Option<String>,
    /// Generic webhook destination.
    pub webhook: Option<WebhookConfig>,
    /// SMTP email destination.
    pub email: Option<EmailConfig>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            cooldown_secs: 300,
            rules: Vec::new(),
            slack_webhook_url: None,
            discord_webhook_url: None,
            webhook: None,
            email: None,
        }
    }
}

impl AlertConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::seconds(i64::try_from(self.cooldown_secs).unwrap_or(300))
    }
}

/// Generic webhook notification destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// When set, each delivery carries `X-Pulse-Signature:
    /// hex(HMAC-SHA256(secret, body))`.
    pub secret: Option<String>,
}

/// SMTP email notification destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub host: String,
    pub port: u16,
    /// SMTP PLAIN auth is used when a username is set.
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

/// Ring buffer capacities per telemetry stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub requests: usize,
    pub queries: usize,
    pub runtime_samples: usize,
    /// Per-check health history depth.
    pub health_results: usize,
    pub dependencies: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            requests: 100_000,
            queries: 50_000,
            runtime_samples: 10_000,
            health_results: 1_000,
            dependencies: 50_000,
        }
    }
}

/// Dashboard authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for dashboard JWTs. Auth endpoints reject logins while
    /// this is empty.
    pub jwt_secret: String,
    pub username: String,
    pub password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            username: "admin".into(),
            password: String::new(),
        }
    }
}

mod duration_secs {
    //! Serialize a `chrono::Duration` as whole seconds.

    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(de)?;
        Ok(Duration::seconds(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tri_state_booleans_default_on() {
        let config = PulseConfig::default();
        assert!(config.is_enabled());
        assert!(config.tracing.is_enabled());
        assert!(config.database.n1_enabled());
        assert!(config.metrics_enabled());

        let disabled = PulseConfig {
            enabled: Some(false),
            ..PulseConfig::default()
        };
        assert!(!disabled.is_enabled());
    }

    #[test]
    fn dev_mode_speeds_up_ticks() {
        let prod = PulseConfig::default();
        let dev = PulseConfig {
            dev: true,
            ..PulseConfig::default()
        };
        assert!(dev.aggregate_interval() < prod.aggregate_interval());
        assert!(dev.evaluate_interval() < prod.evaluate_interval());
    }

    #[test]
    fn redaction_hides_secrets() {
        let mut config = PulseConfig::default_for_test();
        config.alerts.webhook = Some(WebhookConfig {
            url: "https://example.com/hook".into(),
            secret: Some("hunter2".into()),
        });

        let redacted = config.redacted();
        assert_eq!(redacted.auth.jwt_secret, "[REDACTED]");
        assert_eq!(redacted.auth.password, "[REDACTED]");
        assert_eq!(
            redacted.alerts.webhook.unwrap().secret.as_deref(),
            Some("[REDACTED]")
        );
        // Non-secrets survive.
        assert_eq!(redacted.auth.username, "admin");
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = PulseConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: PulseConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.prefix, config.prefix);
        assert_eq!(back.buffers.requests, config.buffers.requests);
        assert_eq!(back.retention, config.retention);
    }
}
