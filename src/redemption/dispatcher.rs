use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use super::policy::{PolicyContext, RedemptionEvent, RedemptionOutcome, evaluate};
use crate::auth::RenewalListener;
use crate::conduit::ConduitManager;
use crate::config::Config;
use crate::moderation::{CommandOrigin, ModerationCommand, ModerationSink};
use crate::platform::{PlatformApi, SubscriptionRequest, types::REDEMPTION_ADD};
use crate::store::{BotCredential, ChannelConfigStore, CredentialStore};

/// A live redemption subscription for one channel.
#[derive(Debug, Clone)]
pub struct ActiveSubscription {
    /// `None` only when the platform reported a duplicate and the existing
    /// subscription could not be looked up; `stop` looks it up again.
    pub subscription_id: Option<String>,
    pub broadcaster_id: String,
    pub conduit_id: String,
    pub started_at: DateTime<Utc>,
}

type Slot = Arc<AsyncMutex<Option<ActiveSubscription>>>;

/// Per-channel subscription state.
///
/// Each channel has its own async lock so start/stop for one channel run
/// one at a time while different channels proceed in parallel.
#[derive(Default)]
pub struct SubscriptionRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl SubscriptionRegistry {
    fn slot(&self, channel: &str) -> Slot {
        self.slots
            .lock()
            .entry(channel.to_string())
            .or_default()
            .clone()
    }

    fn snapshot(&self) -> Vec<(String, Slot)> {
        self.slots
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Channels with a live subscription right now. Channels whose lock is
    /// held by an in-flight start/stop are skipped.
    pub fn active_channels(&self) -> Vec<String> {
        let mut active: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|(_, slot)| slot.try_lock().is_ok_and(|guard| guard.is_some()))
            .map(|(channel, _)| channel)
            .collect();
        active.sort();
        active
    }

    /// The channel whose subscription belongs to `broadcaster_id`.
    pub async fn channel_for_broadcaster(&self, broadcaster_id: &str) -> Option<String> {
        for (channel, slot) in self.snapshot() {
            if slot
                .lock()
                .await
                .as_ref()
                .is_some_and(|s| s.broadcaster_id == broadcaster_id)
            {
                return Some(channel);
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Subscribed,
    AlreadyActive,
    /// Not an error: the channel is simply not set up for redemptions.
    Skipped(&'static str),
}

/// Fleet-wide policy inputs, captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct PolicySettings {
    pub bot_login: String,
    pub bot_owner: String,
    pub test_mode: bool,
    pub test_allow_list: Vec<String>,
}

impl PolicySettings {
    /// Policy inputs from config. The bot login comes from
    /// `platform.bot_username`, or from the stored bot credential when that is
    /// blank. Knowing neither is an error: the bot could not be protected.
    pub fn resolve(config: &Config, bot: &BotCredential) -> Result<Self> {
        let configured = config.platform.bot_username.trim();
        let bot_login = if configured.is_empty() {
            bot.login.as_deref().map(str::trim).unwrap_or_default()
        } else {
            configured
        };
        if bot_login.is_empty() {
            anyhow::bail!(
                "Bot login is unknown; set platform.bot_username or re-import the bot credential"
            );
        }
        Ok(Self {
            bot_login: bot_login.to_lowercase(),
            bot_owner: config.platform.bot_owner.to_lowercase(),
            test_mode: config.redemption.test_mode,
            test_allow_list: config.redemption.test_allow_list.clone(),
        })
    }
}

pub struct RedemptionDispatcher {
    api: Arc<dyn PlatformApi>,
    conduits: Arc<ConduitManager>,
    channels: Arc<ChannelConfigStore>,
    credentials: Arc<CredentialStore>,
    sink: Arc<dyn ModerationSink>,
    policy: PolicySettings,
    registry: SubscriptionRegistry,
}

impl RedemptionDispatcher {
    pub fn new(
        api: Arc<dyn PlatformApi>,
        conduits: Arc<ConduitManager>,
        credentials: Arc<CredentialStore>,
        sink: Arc<dyn ModerationSink>,
        policy: PolicySettings,
    ) -> Self {
        Self {
            api,
            conduits,
            channels: Arc::clone(credentials.channels()),
            credentials,
            sink,
            policy,
            registry: SubscriptionRegistry::default(),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    async fn subscribe(&self, channel: &str, slot: &mut Option<ActiveSubscription>) -> Result<StartOutcome> {
        if slot.is_some() {
            return Ok(StartOutcome::AlreadyActive);
        }
        let enabled = self
            .channels
            .load(channel)?
            .is_some_and(|cfg| cfg.redemption_enabled);
        if !enabled {
            return Ok(StartOutcome::Skipped("redemptions disabled"));
        }
        let Some(credential) = self.credentials.channel_credential(channel)? else {
            tracing::warn!(channel, "Redemptions enabled without an owner credential; skipping");
            return Ok(StartOutcome::Skipped("no owner credential"));
        };

        let broadcaster_id = match credential.owner_id {
            Some(id) => id,
            None => {
                self.api
                    .user_by_login(channel)
                    .await?
                    .with_context(|| format!("Unknown broadcaster '{channel}'"))?
                    .id
            }
        };
        let conduit = self.conduits.get_or_create().await?;
        let request = SubscriptionRequest::redemptions(&broadcaster_id, &conduit.id);

        let subscription_id = match self.api.create_subscription(&request).await {
            Ok(info) => Some(info.id),
            Err(e) if e.is_conflict() => self.existing_subscription(channel, &broadcaster_id).await,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to subscribe #{channel} to redemptions"));
            }
        };

        tracing::info!(channel, ?subscription_id, conduit_id = %conduit.id, "Redemption subscription started");
        *slot = Some(ActiveSubscription {
            subscription_id,
            broadcaster_id,
            conduit_id: conduit.id,
            started_at: Utc::now(),
        });
        Ok(StartOutcome::Subscribed)
    }

    /// Id of a subscription the platform already has for this broadcaster.
    async fn existing_subscription(&self, channel: &str, broadcaster_id: &str) -> Option<String> {
        match self.api.list_subscriptions(REDEMPTION_ADD, broadcaster_id).await {
            Ok(found) => {
                let id = found.into_iter().next().map(|s| s.id);
                if id.is_none() {
                    tracing::warn!(channel, "Platform reported a duplicate subscription but lists none");
                }
                id
            }
            Err(e) => {
                tracing::warn!(channel, "Failed to look up existing subscription: {e}");
                None
            }
        }
    }

    async fn unsubscribe(&self, channel: &str, slot: &mut Option<ActiveSubscription>) -> Result<bool> {
        let Some(mut active) = slot.take() else {
            return Ok(false);
        };
        if active.subscription_id.is_none() {
            active.subscription_id = self.existing_subscription(channel, &active.broadcaster_id).await;
        }
        if let Some(id) = &active.subscription_id {
            match self.api.delete_subscription(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    // Keep the bookkeeping so a later stop can retry.
                    *slot = Some(active);
                    return Err(e).with_context(|| format!("Failed to unsubscribe #{channel}"));
                }
            }
        }
        tracing::info!(channel, "Redemption subscription stopped");
        Ok(true)
    }

    /// Subscribe `channel` to redemptions. Succeeds without subscribing when
    /// the channel has redemptions off.
    pub async fn start(&self, channel: &str) -> Result<StartOutcome> {
        let slot = self.registry.slot(channel);
        let mut guard = slot.lock().await;
        self.subscribe(channel, &mut guard).await
    }

    /// Unsubscribe `channel`. Returns whether a subscription was active.
    pub async fn stop(&self, channel: &str) -> Result<bool> {
        let slot = self.registry.slot(channel);
        let mut guard = slot.lock().await;
        self.unsubscribe(channel, &mut guard).await
    }

    /// Stop then start under one hold of the channel's lock.
    pub async fn restart(&self, channel: &str) -> Result<StartOutcome> {
        let slot = self.registry.slot(channel);
        let mut guard = slot.lock().await;
        self.unsubscribe(channel, &mut guard).await?;
        self.subscribe(channel, &mut guard).await
    }

    /// Start every channel with redemptions on. One channel's failure does
    /// not affect the others. Returns the number subscribed.
    pub async fn start_all(&self) -> Result<usize> {
        let mut subscribed = 0;
        for channel in self.channels.list()? {
            match self.start(&channel).await {
                Ok(StartOutcome::Subscribed) => subscribed += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(channel = %channel, "Redemption start failed: {e:#}"),
            }
        }
        Ok(subscribed)
    }

    /// Bring subscriptions in line with the stored channel settings: start
    /// channels that turned redemptions on, stop those that turned them off.
    /// Settings are changed by other processes, so the daemon calls this
    /// periodically. Returns `(started, stopped)`.
    pub async fn reconcile(&self) -> Result<(usize, usize)> {
        let mut started = 0;
        let mut stopped = 0;
        for channel in self.channels.list()? {
            let enabled = self
                .channels
                .load(&channel)?
                .is_some_and(|cfg| cfg.redemption_enabled);
            let result = if enabled {
                self.start(&channel)
                    .await
                    .map(|outcome| started += usize::from(outcome == StartOutcome::Subscribed))
            } else {
                self.stop(&channel)
                    .await
                    .map(|was_active| stopped += usize::from(was_active))
            };
            if let Err(e) = result {
                tracing::warn!(channel = %channel, "Redemption reconcile failed: {e:#}");
            }
        }
        if started + stopped > 0 {
            tracing::info!(started, stopped, "Redemption subscriptions reconciled");
        }
        Ok((started, stopped))
    }

    /// Recreate every subscription after the conduit was replaced. The old
    /// subscriptions died with the old conduit, so nothing is deleted.
    pub async fn resubscribe_all(&self) -> Result<usize> {
        let mut subscribed = 0;
        for channel in self.channels.list()? {
            let slot = self.registry.slot(&channel);
            let mut guard = slot.lock().await;
            *guard = None;
            match self.subscribe(&channel, &mut guard).await {
                Ok(StartOutcome::Subscribed) => subscribed += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(channel = %channel, "Resubscribe failed: {e:#}"),
            }
        }
        tracing::info!(subscribed, "Redemption subscriptions recreated");
        Ok(subscribed)
    }

    /// The platform revoked a subscription; forget it without calling back.
    pub async fn on_revocation(&self, channel: &str, subscription_id: &str, reason: &str) {
        let slot = self.registry.slot(channel);
        let mut guard = slot.lock().await;
        let matches = guard
            .as_ref()
            .is_some_and(|s| s.subscription_id.as_deref().is_none_or(|id| id == subscription_id));
        if matches {
            *guard = None;
            tracing::warn!(channel, subscription_id, reason, "Redemption subscription revoked");
        }
    }

    /// Evaluate one redemption and act on the result.
    pub async fn handle_redemption(&self, event: &RedemptionEvent) -> Result<RedemptionOutcome> {
        let channel = event.channel.as_str();
        let Some(config) = self.channels.load(channel)?.filter(|c| c.redemption_enabled) else {
            tracing::debug!(channel, "Redemption for a channel with redemptions off");
            return Ok(RedemptionOutcome::Ignored {
                reason: "redemptions disabled",
            });
        };

        let ctx = PolicyContext {
            bot_login: &self.policy.bot_login,
            bot_owner: &self.policy.bot_owner,
            test_mode: self.policy.test_mode,
            test_allow_list: &self.policy.test_allow_list,
        };
        let outcome = evaluate(event, &config, &ctx);

        match &outcome {
            RedemptionOutcome::Ignored { reason } => {
                tracing::debug!(channel, title = %event.reward_title, reason, "Redemption ignored");
            }
            RedemptionOutcome::Rejected { reply } => {
                tracing::info!(channel, redeemer = %event.redeemer, "Redemption refused");
                if let Err(e) = self.sink.say(channel, reply).await {
                    tracing::warn!(channel, "Failed to post refusal: {e:#}");
                }
            }
            RedemptionOutcome::Timeout {
                request,
                announcement,
            } => {
                let command = ModerationCommand::Timeout(request.clone());
                let reply = match self.sink.execute(CommandOrigin::Redemption, &command).await {
                    Ok(()) => announcement.clone(),
                    Err(e) => {
                        tracing::warn!(channel, target = %request.target, "Redemption timeout failed: {e:#}");
                        format!(
                            "@{}, the timeout didn't go through. Ask a mod for a refund.",
                            event.redeemer
                        )
                    }
                };
                if let Err(e) = self.sink.say(channel, &reply).await {
                    tracing::warn!(channel, "Failed to post redemption result: {e:#}");
                }
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl RenewalListener for RedemptionDispatcher {
    async fn credentials_renewed(&self, channels: &[String]) {
        for channel in channels {
            if let Err(e) = self.restart(channel).await {
                tracing::warn!(channel = %channel, "Reconnect after renewal failed: {e:#}");
            }
        }
    }

    async fn credentials_expired(&self, channels: &[String]) {
        for channel in channels {
            if let Err(e) = self.stop(channel).await {
                tracing::warn!(channel = %channel, "Stop after expiry failed: {e:#}");
            }
        }
    }
}
