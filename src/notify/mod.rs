//! Operator-facing alerts (credential expiry and similar).
//!
//! Delivery is best-effort: callers never wait on or fail because of it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::NotificationsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    Info,
    Warning,
    Critical,
}

impl Urgency {
    pub fn label(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub urgency: Urgency,
    pub title: String,
    pub body: String,
    pub remediation_url: Option<String>,
}

impl Notification {
    pub fn render(&self) -> String {
        let mut text = format!("[{}] {}\n{}", self.urgency.label(), self.title, self.body);
        if let Some(url) = &self.remediation_url {
            text.push_str("\nFix: ");
            text.push_str(url);
        }
        text
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes alerts to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        match notification.urgency {
            Urgency::Info => tracing::info!("{}", notification.render()),
            Urgency::Warning => tracing::warn!("{}", notification.render()),
            Urgency::Critical => tracing::error!("{}", notification.render()),
        }
        Ok(())
    }
}

/// Posts alerts to a Discord-style webhook as `{"content": ...}`.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        let body = serde_json::json!({ "content": notification.render() });
        let resp = self.client.post(&self.url).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("webhook returned HTTP {}", resp.status());
        }
        Ok(())
    }
}

pub fn create_notifier(config: &NotificationsConfig) -> Arc<dyn Notifier> {
    match config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => match WebhookNotifier::new(url, Duration::from_secs(config.timeout_secs.max(1))) {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                tracing::warn!("Webhook notifier unavailable, falling back to log: {e}");
                Arc::new(LogNotifier)
            }
        },
        None => Arc::new(LogNotifier),
    }
}

/// Fire-and-forget delivery on a background task.
pub fn notify_detached(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notification).await {
            tracing::warn!(
                "Failed to deliver {} notification '{}': {e}",
                notifier.name(),
                notification.title
            );
        }
    });
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_tier_and_link() {
        let n = Notification {
            urgency: Urgency::Critical,
            title: "Bot token expired".into(),
            body: "Workers cannot chat.".into(),
            remediation_url: Some("https://example.test/renew".into()),
        };
        let text = n.render();
        assert!(text.starts_with("[CRITICAL] Bot token expired"));
        assert!(text.ends_with("Fix: https://example.test/renew"));
    }

    #[test]
    fn urgency_orders_by_severity() {
        assert!(Urgency::Info < Urgency::Warning);
        assert!(Urgency::Warning < Urgency::Critical);
    }

    #[test]
    fn missing_webhook_falls_back_to_log() {
        let notifier = create_notifier(&NotificationsConfig::default());
        assert_eq!(notifier.name(), "log");
    }
}
