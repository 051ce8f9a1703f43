use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::RenewalConfig;
use crate::notify::{Notification, Notifier, Urgency, notify_detached};
use crate::platform::{PlatformApi, PlatformError};
use crate::store::CredentialStore;
use crate::util::format_remaining;

/// How close the bot-wide credential is to expiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExpiryTier {
    Healthy,
    Days,
    Hours,
    Expired,
}

impl ExpiryTier {
    /// `remaining == None` is a non-expiring token.
    pub fn classify(remaining: Option<Duration>, warn_days: u64, urgent_hours: u64) -> Self {
        let Some(left) = remaining else {
            return Self::Healthy;
        };
        if left.is_zero() {
            Self::Expired
        } else if left < Duration::from_secs(urgent_hours * 3600) {
            Self::Hours
        } else if left < Duration::from_secs(warn_days * 86_400) {
            Self::Days
        } else {
            Self::Healthy
        }
    }

    fn urgency(self) -> Urgency {
        match self {
            Self::Healthy => Urgency::Info,
            Self::Days => Urgency::Warning,
            Self::Hours | Self::Expired => Urgency::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BotCheck {
    pub tier: ExpiryTier,
    pub remaining: Option<Duration>,
    pub notified: bool,
}

/// Watches the bot-wide token. It has no refresh path, so the only action is
/// an operator alert each time the tier gets worse.
pub struct BotCredentialMonitor {
    api: Arc<dyn PlatformApi>,
    credentials: Arc<CredentialStore>,
    notifier: Arc<dyn Notifier>,
    warn_days: u64,
    urgent_hours: u64,
    remediation_url: String,
    last_tier: Mutex<ExpiryTier>,
}

impl BotCredentialMonitor {
    pub fn new(
        api: Arc<dyn PlatformApi>,
        credentials: Arc<CredentialStore>,
        notifier: Arc<dyn Notifier>,
        config: &RenewalConfig,
    ) -> Self {
        Self {
            api,
            credentials,
            notifier,
            warn_days: config.warn_days,
            urgent_hours: config.urgent_hours,
            remediation_url: config.remediation_url.clone(),
            last_tier: Mutex::new(ExpiryTier::Healthy),
        }
    }

    pub async fn check(&self) -> Result<BotCheck> {
        let mut credential = self.credentials.bot_credential()?;

        let remaining = match self.api.validate_token(&credential.access_token).await {
            Ok(info) => {
                if credential.user_id.is_none() || credential.login.is_none() {
                    credential.user_id.clone_from(&info.user_id);
                    credential.login.clone_from(&info.login);
                    self.credentials.set_bot_credential(&credential)?;
                }
                info.remaining()
            }
            Err(PlatformError::Unauthorized(_)) => Some(Duration::ZERO),
            Err(e) => return Err(e).context("Failed to validate bot credential"),
        };

        let tier = ExpiryTier::classify(remaining, self.warn_days, self.urgent_hours);
        let notified = {
            let mut last = self.last_tier.lock();
            let escalated = tier > *last;
            // A rotated token resets the ladder so the next decline alerts again.
            *last = tier;
            escalated
        };

        if notified {
            let body = match remaining {
                Some(left) if !left.is_zero() => format!(
                    "The bot token expires in {}. Every worker loses chat access when it does.",
                    format_remaining(left)
                ),
                _ => "The bot token has expired. Workers cannot chat until it is replaced.".into(),
            };
            notify_detached(
                &self.notifier,
                Notification {
                    urgency: tier.urgency(),
                    title: "Bot credential expiring".into(),
                    body,
                    remediation_url: Some(self.remediation_url.clone()),
                },
            );
        }

        tracing::debug!(?tier, notified, "Bot credential checked");
        Ok(BotCheck {
            tier,
            remaining,
            notified,
        })
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
            if *shutdown.borrow() {
                return Ok(());
            }
            if let Err(e) = self.check().await {
                tracing::warn!("Bot credential check failed: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingNotifier;
    use crate::platform::testing::FakePlatform;
    use crate::store::{BotCredential, ChannelConfigStore};
    use tempfile::TempDir;

    #[test]
    fn tiers_follow_thresholds() {
        let classify = |secs: Option<u64>| {
            ExpiryTier::classify(secs.map(Duration::from_secs), 7, 24)
        };
        assert_eq!(classify(None), ExpiryTier::Healthy);
        assert_eq!(classify(Some(30 * 86_400)), ExpiryTier::Healthy);
        assert_eq!(classify(Some(3 * 86_400)), ExpiryTier::Days);
        assert_eq!(classify(Some(5 * 3600)), ExpiryTier::Hours);
        assert_eq!(classify(Some(0)), ExpiryTier::Expired);
    }

    #[tokio::test]
    async fn notifies_only_on_escalation() {
        let tmp = TempDir::new().unwrap();
        let channels = Arc::new(ChannelConfigStore::new(
            tmp.path().join("channels"),
            tmp.path().join("locks"),
        ));
        let store = Arc::new(CredentialStore::new(tmp.path().join("credentials"), channels));
        store
            .set_bot_credential(&BotCredential {
                access_token: "bot".into(),
                login: None,
                user_id: None,
                expires_at: None,
                updated_at: None,
            })
            .unwrap();

        let api = Arc::new(FakePlatform::default().with_token("bot", "fleetbot", 2 * 86_400));
        let notifier = Arc::new(RecordingNotifier::default());
        let monitor =
            BotCredentialMonitor::new(api.clone(), store.clone(), notifier.clone(), &RenewalConfig::default());

        assert!(monitor.check().await.unwrap().notified);
        assert!(!monitor.check().await.unwrap().notified);

        api.state.lock().tokens.clear();
        let check = monitor.check().await.unwrap();
        assert_eq!(check.tier, ExpiryTier::Expired);
        assert!(check.notified);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].urgency, Urgency::Warning);
        assert_eq!(sent[1].urgency, Urgency::Critical);
        assert_eq!(
            store.bot_credential().unwrap().login.as_deref(),
            Some("fleetbot")
        );
    }
}
