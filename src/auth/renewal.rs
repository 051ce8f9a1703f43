use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::lockfile;
use crate::notify::{Notification, Notifier, Urgency, notify_detached};
use crate::platform::{PlatformApi, PlatformError};
use crate::store::{ChannelCredential, CredentialStore};
use crate::util::format_remaining;

/// Subsystems that hold connections built on channel credentials.
#[async_trait]
pub trait RenewalListener: Send + Sync {
    /// Called once per sweep with exactly the channels that were refreshed.
    async fn credentials_renewed(&self, channels: &[String]);

    /// Called once per sweep with channels whose credential became terminal.
    async fn credentials_expired(&self, _channels: &[String]) {}
}

/// Longest wait for another holder to finish with a channel's credential.
const CREDENTIAL_LOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// Channel-owner tokens for callers about to act with them.
#[async_trait]
pub trait OwnerTokenSource: Send + Sync {
    /// The channel's credential, validated first and refreshed when close to
    /// expiry. Fails when the channel has no usable credential.
    async fn usable_credential(&self, channel: &str) -> Result<ChannelCredential>;

    /// The platform rejected `rejected_token` on use. Refresh it once, unless
    /// someone already replaced it, and return the credential to retry with.
    async fn renew_rejected(&self, channel: &str, rejected_token: &str) -> Result<ChannelCredential>;
}

/// Outcome of checking one channel credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialHealth {
    /// Above the refresh threshold; `None` means it never expires.
    Valid { remaining: Option<Duration> },
    /// Refreshed and persisted under `version`.
    Refreshed { version: u64 },
    /// Under the threshold but still usable; the refresh was refused.
    RefreshFailed { remaining: Duration },
    /// Unusable and not refreshable. Needs re-authorization.
    Expired,
    /// Removed between listing and checking.
    Missing,
}

#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub checked: usize,
    pub valid: usize,
    pub refreshed: Vec<String>,
    pub refresh_failed: Vec<String>,
    pub expired: Vec<String>,
    /// Transient errors; state left unchanged for the next sweep.
    pub errored: Vec<String>,
    /// Stopped early by the shutdown signal.
    pub interrupted: bool,
}

impl SweepReport {
    pub fn summary(&self) -> String {
        let mut text = format!(
            "checked {}, valid {}, refreshed {}, refresh failed {}, expired {}, errors {}",
            self.checked,
            self.valid,
            self.refreshed.len(),
            self.refresh_failed.len(),
            self.expired.len(),
            self.errored.len()
        );
        if self.interrupted {
            text.push_str(" (interrupted)");
        }
        text
    }
}

/// Periodic validation and refresh of channel-owner credentials.
pub struct RenewalService {
    api: Arc<dyn PlatformApi>,
    credentials: Arc<CredentialStore>,
    notifier: Arc<dyn Notifier>,
    listener: Option<Arc<dyn RenewalListener>>,
    threshold: Duration,
    remediation_url: String,
}

impl RenewalService {
    pub fn new(
        api: Arc<dyn PlatformApi>,
        credentials: Arc<CredentialStore>,
        notifier: Arc<dyn Notifier>,
        threshold: Duration,
        remediation_url: String,
    ) -> Self {
        Self {
            api,
            credentials,
            notifier,
            listener: None,
            threshold,
            remediation_url,
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn RenewalListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// One pass over every stored channel credential.
    ///
    /// The shutdown signal is checked between credentials. Listeners are told
    /// about refreshed channels even for an interrupted sweep.
    pub async fn sweep(&self, shutdown: &watch::Receiver<bool>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for channel in self.credentials.list_channels()? {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }
            report.checked += 1;
            match self.check_channel(&channel).await {
                Ok(CredentialHealth::Valid { .. }) => report.valid += 1,
                Ok(CredentialHealth::Refreshed { .. }) => report.refreshed.push(channel),
                Ok(CredentialHealth::RefreshFailed { .. }) => report.refresh_failed.push(channel),
                Ok(CredentialHealth::Expired) => report.expired.push(channel),
                Ok(CredentialHealth::Missing) => report.checked -= 1,
                Err(e) => {
                    tracing::warn!(channel = %channel, "Credential check failed: {e:#}");
                    report.errored.push(channel);
                }
            }
        }

        if let Some(listener) = &self.listener {
            if !report.refreshed.is_empty() {
                listener.credentials_renewed(&report.refreshed).await;
            }
            if !report.expired.is_empty() {
                listener.credentials_expired(&report.expired).await;
            }
        }

        tracing::info!("Credential sweep: {}", report.summary());
        Ok(report)
    }

    /// Held while a channel's credential is validated or refreshed, so a
    /// rotated refresh token is never spent twice.
    async fn credential_lock(&self, channel: &str) -> Result<lockfile::LockGuard> {
        let path = self
            .credentials
            .channels()
            .locks_dir()
            .join(format!("credential-{channel}.lock"));
        lockfile::lock(&path, CREDENTIAL_LOCK_TIMEOUT).await
    }

    /// Validate one channel's credential and refresh it when needed.
    pub async fn check_channel(&self, channel: &str) -> Result<CredentialHealth> {
        let _guard = self.credential_lock(channel).await?;
        let Some(credential) = self.credentials.channel_credential(channel)? else {
            return Ok(CredentialHealth::Missing);
        };

        let remaining = match self.api.validate_token(&credential.access_token).await {
            Ok(info) => match info.remaining() {
                None => return Ok(CredentialHealth::Valid { remaining: None }),
                Some(left) if left >= self.threshold => {
                    return Ok(CredentialHealth::Valid {
                        remaining: Some(left),
                    });
                }
                Some(left) => Some(left),
            },
            Err(PlatformError::Unauthorized(_)) => None,
            Err(e) => return Err(e.into()),
        };

        self.refresh(credential, remaining).await
    }

    /// Exactly one refresh attempt. `remaining` is `None` when the access
    /// token is already unusable.
    async fn refresh(
        &self,
        credential: ChannelCredential,
        remaining: Option<Duration>,
    ) -> Result<CredentialHealth> {
        let channel = credential.channel.clone();
        let Some(refresh_token) = credential.refresh_token.clone() else {
            return match remaining {
                Some(left) => {
                    self.alert_refresh_failed(&channel, left, "no refresh token stored");
                    Ok(CredentialHealth::RefreshFailed { remaining: left })
                }
                None => {
                    self.expire(&channel, "access token invalid and no refresh token stored")
                        .await?;
                    Ok(CredentialHealth::Expired)
                }
            };
        };

        match self.api.refresh_token(&refresh_token).await {
            Ok(grant) => {
                let mut renewed = credential;
                renewed.access_token = grant.access_token;
                if let Some(next) = grant.refresh_token {
                    renewed.refresh_token = Some(next);
                }
                if !grant.scope.is_empty() {
                    renewed.scopes = grant.scope;
                }
                renewed.expires_at = if grant.expires_in > 0 {
                    i64::try_from(grant.expires_in)
                        .ok()
                        .and_then(chrono::Duration::try_seconds)
                        .map(|lifetime| Utc::now() + lifetime)
                } else {
                    None
                };
                let stored = self.credentials.set_channel_credential(&renewed)?;
                tracing::info!(channel = %channel, version = stored.version, "Refreshed channel credential");
                Ok(CredentialHealth::Refreshed {
                    version: stored.version,
                })
            }
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => match remaining {
                Some(left) => {
                    self.alert_refresh_failed(&channel, left, &e.to_string());
                    Ok(CredentialHealth::RefreshFailed { remaining: left })
                }
                None => {
                    self.expire(&channel, &e.to_string()).await?;
                    Ok(CredentialHealth::Expired)
                }
            },
        }
    }

    fn alert_refresh_failed(&self, channel: &str, remaining: Duration, reason: &str) {
        tracing::warn!(channel, "Credential refresh failed: {reason}");
        notify_detached(
            &self.notifier,
            Notification {
                urgency: Urgency::Warning,
                title: format!("Channel token for #{channel} could not be refreshed"),
                body: format!(
                    "{} left before it expires. Reason: {reason}",
                    format_remaining(remaining)
                ),
                remediation_url: Some(self.remediation_url.clone()),
            },
        );
    }

    /// Terminal expiry: switch redemptions off and alert the operator.
    async fn expire(&self, channel: &str, reason: &str) -> Result<()> {
        let configs = self.credentials.channels();
        if configs.load(channel)?.is_some_and(|c| c.redemption_enabled) {
            configs
                .update(channel, |c| c.redemption_enabled = false)
                .await?;
        }
        tracing::warn!(channel, "Channel credential expired: {reason}");
        notify_detached(
            &self.notifier,
            Notification {
                urgency: Urgency::Critical,
                title: format!("Channel token for #{channel} expired"),
                body: format!(
                    "Redemptions are disabled until the owner re-authorizes. Reason: {reason}"
                ),
                remediation_url: Some(self.remediation_url.clone()),
            },
        );
        Ok(())
    }

    fn reload(&self, channel: &str) -> Result<ChannelCredential> {
        self.credentials
            .channel_credential(channel)?
            .with_context(|| format!("Owner credential for #{channel} was removed"))
    }

    /// Sweep every `interval` until shutdown.
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
            if let Err(e) = self.sweep(&shutdown).await {
                tracing::warn!("Credential sweep failed: {e:#}");
            }
        }
    }
}

#[async_trait]
impl OwnerTokenSource for RenewalService {
    async fn usable_credential(&self, channel: &str) -> Result<ChannelCredential> {
        match self.check_channel(channel).await? {
            CredentialHealth::Valid { .. }
            | CredentialHealth::Refreshed { .. }
            | CredentialHealth::RefreshFailed { .. } => self.reload(channel),
            CredentialHealth::Expired => {
                bail!("Owner credential for #{channel} expired; the broadcaster must re-authorize")
            }
            CredentialHealth::Missing => bail!("No owner credential for #{channel}"),
        }
    }

    async fn renew_rejected(&self, channel: &str, rejected_token: &str) -> Result<ChannelCredential> {
        let _guard = self.credential_lock(channel).await?;
        let credential = self.reload(channel)?;
        if credential.access_token != rejected_token {
            return Ok(credential);
        }
        tracing::info!(channel, "Owner token rejected on use; refreshing");
        match self.refresh(credential, None).await? {
            CredentialHealth::Refreshed { .. } => self.reload(channel),
            _ => bail!("Owner credential for #{channel} expired; the broadcaster must re-authorize"),
        }
    }
}
