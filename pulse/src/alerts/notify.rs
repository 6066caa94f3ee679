//! Alert notification channels.
//!
//! Slack, Discord, email and generic webhooks share one dispatch surface.
//! Delivery is best-effort: failures are logged and never reach the request
//! path. Webhooks retry with exponential backoff and can sign their body.

use hmac::{Hmac, Mac};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::{AlertConfig, EmailConfig, WebhookConfig};
use crate::model::{AlertRecord, AlertState, Severity};

const WEBHOOK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const WEBHOOK_ATTEMPTS: u32 = 3;

/// One configured destination.
enum Notifier {
    Slack { url: String },
    Discord { url: String },
    Email { config: EmailConfig },
    Webhook { config: WebhookConfig },
}

/// All configured destinations plus the shared HTTP client.
pub struct Notifiers {
    channels: Vec<Notifier>,
    http: reqwest::Client,
}

impl Notifiers {
    pub fn from_config(config: &AlertConfig) -> Self {
        let mut channels = Vec::new();
        if let Some(url) = &config.slack_webhook_url {
            channels.push(Notifier::Slack { url: url.clone() });
        }
        if let Some(url) = &config.discord_webhook_url {
            channels.push(Notifier::Discord { url: url.clone() });
        }
        if let Some(email) = &config.email {
            channels.push(Notifier::Email {
                config: email.clone(),
            });
        }
        if let Some(webhook) = &config.webhook {
            channels.push(Notifier::Webhook {
                config: webhook.clone(),
            });
        }
        Self {
            channels,
            http: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Deliver `alert` to every destination. Best-effort; errors are logged.
    pub async fn dispatch(&self, alert: &AlertRecord) {
        for channel in &self.channels {
            let result = match channel {
                Notifier::Slack { url } => self.send_slack(url, alert).await,
                Notifier::Discord { url } => self.send_discord(url, alert).await,
                Notifier::Email { config } => send_email(config, alert).await,
                Notifier::Webhook { config } => self.send_webhook(config, alert).await,
            };
            if let Err(e) = result {
                warn!(rule = %alert.rule, error = %e, "Alert notification failed");
            }
        }
    }

    async fn send_slack(&self, url: &str, alert: &AlertRecord) -> anyhow::Result<()> {
        let payload = slack_payload(alert);
        let response = self.http.post(url).json(&payload).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("slack returned {}", response.status());
        }
        Ok(())
    }

    async fn send_discord(&self, url: &str, alert: &AlertRecord) -> anyhow::Result<()> {
        let payload = discord_payload(alert);
        let response = self.http.post(url).json(&payload).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("discord returned {}", response.status());
        }
        Ok(())
    }

    /// Deliver to the generic webhook with signing and retries.
    async fn send_webhook(&self, config: &WebhookConfig, alert: &AlertRecord) -> anyhow::Result<()> {
        let body = serde_json::to_vec(&webhook_payload(alert))?;

        let mut last_error = None;
        for attempt in 1..=WEBHOOK_ATTEMPTS {
            let mut request = self
                .http
                .post(&config.url)
                .header("content-type", "application/json")
                .body(body.clone());
            if let Some(secret) = &config.secret {
                request = request.header("x-pulse-signature", sign(secret, &body));
            }

            match request.send().await {
                Ok(response) if response.status().as_u16() < 300 => return Ok(()),
                Ok(response) => {
                    last_error = Some(anyhow::anyhow!("webhook returned {}", response.status()));
                }
                Err(e) => last_error = Some(e.into()),
            }

            if attempt < WEBHOOK_ATTEMPTS {
                let backoff = std::time::Duration::from_secs(1 << attempt);
                debug!(attempt, ?backoff, "Webhook delivery failed, retrying");
                tokio::time::sleep(backoff).await;
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("webhook delivery failed")))
    }
}

/// `hex(HMAC-SHA256(secret, body))` for the `X-Pulse-Signature` header.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Hex severity color used by Slack attachments.
fn color(alert: &AlertRecord) -> &'static str {
    if alert.state == AlertState::Resolved {
        return "#22c55e";
    }
    match alert.severity {
        Severity::Critical => "#ef4444",
        Severity::Warning => "#f97316",
        Severity::Info => "#3b82f6",
    }
}

/// Integer severity color used by Discord embeds.
const fn color_int(alert: &AlertRecord) -> u32 {
    if matches!(alert.state, AlertState::Resolved) {
        return 0x0022_c55e;
    }
    match alert.severity {
        Severity::Critical => 0x00ef_4444,
        Severity::Warning => 0x00f9_7316,
        Severity::Info => 0x003b_82f6,
    }
}

fn title(alert: &AlertRecord) -> String {
    format!(
        "[Pulse] {}: {}",
        alert.severity.as_str().to_uppercase(),
        alert.rule
    )
}

fn fields(alert: &AlertRecord) -> Vec<serde_json::Value> {
    let mut fields = vec![
        serde_json::json!({"title": "Metric", "value": alert.metric, "short": true}),
        serde_json::json!({"title": "Value", "value": format!("{:.2}", alert.value), "short": true}),
        serde_json::json!({
            "title": "Threshold",
            "value": format!("{} {}", alert.operator, alert.threshold),
            "short": true,
        }),
        serde_json::json!({"title": "State", "value": alert.state.as_str(), "short": true}),
    ];
    if let Some(route) = &alert.route {
        fields.push(serde_json::json!({"title": "Route", "value": route, "short": true}));
    }
    fields
}

fn slack_payload(alert: &AlertRecord) -> serde_json::Value {
    serde_json::json!({
        "attachments": [{
            "color": color(alert),
            "title": title(alert),
            "text": alert.message,
            "fields": fields(alert),
            "ts": alert.fired_at.timestamp(),
        }]
    })
}

fn discord_payload(alert: &AlertRecord) -> serde_json::Value {
    serde_json::json!({
        "embeds": [{
            "title": title(alert),
            "description": alert.message,
            "color": color_int(alert),
            "fields": fields(alert).into_iter().map(|f| serde_json::json!({
                "name": f["title"],
                "value": f["value"],
                "inline": true,
            })).collect::<Vec<_>>(),
            "timestamp": alert.fired_at.to_rfc3339(),
        }]
    })
}

fn webhook_payload(alert: &AlertRecord) -> serde_json::Value {
    serde_json::json!({
        "alert": alert.rule,
        "severity": alert.severity,
        "metric": alert.metric,
        "value": alert.value,
        "threshold": alert.threshold,
        "operator": alert.operator,
        "state": alert.state,
        "message": alert.message,
        "route": alert.route,
        "fired_at": alert.fired_at,
    })
}

async fn send_email(config: &EmailConfig, alert: &AlertRecord) -> anyhow::Result<()> {
    let from: Mailbox = config.from.parse()?;
    let subject = format!(
        "[Pulse Alert] {}: {}",
        alert.severity.as_str().to_uppercase(),
        alert.rule
    );
    let body = format!(
        "Rule:      {}\n\
         Severity:  {}\n\
         Metric:    {}\n\
         Value:     {:.2} (threshold {} {})\n\
         State:     {}\n\
         Time:      {}\n\
         \n\
         {}\n",
        alert.rule,
        alert.severity.as_str(),
        alert.metric,
        alert.value,
        alert.operator,
        alert.threshold,
        alert.state.as_str(),
        alert.fired_at.to_rfc3339(),
        alert.message,
    );

    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        .port(config.port);
    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        builder = builder.credentials(Credentials::new(username.clone(), password));
    }
    let mailer = builder.build();

    for to in &config.to {
        let message = Message::builder()
            .from(from.clone())
            .to(to.parse()?)
            .subject(&subject)
            .body(body.clone())?;
        mailer.send(message).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn alert(state: AlertState, severity: Severity) -> AlertRecord {
        AlertRecord {
            id: Uuid::new_v4(),
            rule: "high_error_rate".into(),
            metric: "error_rate".into(),
            value: 15.0,
            threshold: 10.0,
            operator: ">".into(),
            severity,
            state,
            route: None,
            message: "error rate high".into(),
            fired_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn severity_colors() {
        assert_eq!(color(&alert(AlertState::Firing, Severity::Critical)), "#ef4444");
        assert_eq!(color(&alert(AlertState::Firing, Severity::Warning)), "#f97316");
        assert_eq!(color(&alert(AlertState::Firing, Severity::Info)), "#3b82f6");
        assert_eq!(color(&alert(AlertState::Resolved, Severity::Critical)), "#22c55e");
        assert_eq!(color_int(&alert(AlertState::Firing, Severity::Critical)), 0x00ef_4444);
        assert_eq!(color_int(&alert(AlertState::Resolved, Severity::Warning)), 0x0022_c55e);
    }

    #[test]
    fn slack_payload_shape() {
        let payload = slack_payload(&alert(AlertState::Firing, Severity::Critical));
        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["title"], "[Pulse] CRITICAL: high_error_rate");
        assert_eq!(attachment["color"], "#ef4444");
        assert!(attachment["fields"].as_array().unwrap().len() >= 4);
        assert!(attachment["ts"].is_i64());
    }

    #[test]
    fn discord_payload_shape() {
        let payload = discord_payload(&alert(AlertState::Firing, Severity::Warning));
        let embed = &payload["embeds"][0];
        assert_eq!(embed["title"], "[Pulse] WARNING: high_error_rate");
        assert_eq!(embed["color"], 0x00f9_7316);
        assert!(embed["timestamp"].is_string());
    }

    #[test]
    fn webhook_payload_keys() {
        let payload = webhook_payload(&alert(AlertState::Firing, Severity::Critical));
        for key in [
            "alert", "severity", "metric", "value", "threshold", "operator", "state",
            "message", "route", "fired_at",
        ] {
            assert!(payload.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(payload["severity"], "critical");
        assert_eq!(payload["state"], "firing");
    }

    #[test]
    fn signature_is_stable_hex() {
        let a = sign("secret", b"body");
        let b = sign("secret", b"body");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, sign("other", b"body"));
    }

    #[test]
    fn notifiers_empty_without_destinations() {
        let notifiers = Notifiers::from_config(&AlertConfig::default());
        assert!(notifiers.is_empty());
    }
}
