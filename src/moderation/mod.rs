//! Moderation capability handed to the redemption dispatcher.
//!
//! Commands travel as typed values; nothing is re-parsed from chat text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::auth::OwnerTokenSource;
use crate::platform::{PlatformApi, PlatformError, TimeoutParams};
use crate::store::CredentialStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutRequest {
    pub channel: String,
    pub target: String,
    pub requester: String,
    pub duration_secs: u64,
    pub reason: String,
}

/// Where a command came from. Internal origins have already passed their
/// own checks and are executed without user-facing permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOrigin {
    Redemption,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationCommand {
    Timeout(TimeoutRequest),
}

impl ModerationCommand {
    pub fn channel(&self) -> &str {
        match self {
            Self::Timeout(req) => &req.channel,
        }
    }
}

#[async_trait]
pub trait ModerationSink: Send + Sync {
    /// Post a chat message in `channel` as the bot.
    async fn say(&self, channel: &str, text: &str) -> Result<()>;

    /// Carry out an already-validated command.
    async fn execute(&self, origin: CommandOrigin, command: &ModerationCommand) -> Result<()>;
}

/// `ModerationSink` over the platform API.
///
/// Chat goes out under the bot token; timeouts under the channel owner's
/// token. The bot token is read from the store on every call. Owner tokens
/// come from `owner_tokens`, which validates them before use; a 401 on the
/// timeout itself gets one refresh and one retry.
pub struct HelixModerator {
    api: Arc<dyn PlatformApi>,
    credentials: Arc<CredentialStore>,
    owner_tokens: Arc<dyn OwnerTokenSource>,
    bot_user_id: OnceCell<String>,
    user_ids: Mutex<HashMap<String, String>>,
}

impl HelixModerator {
    pub fn new(
        api: Arc<dyn PlatformApi>,
        credentials: Arc<CredentialStore>,
        owner_tokens: Arc<dyn OwnerTokenSource>,
    ) -> Self {
        Self {
            api,
            credentials,
            owner_tokens,
            bot_user_id: OnceCell::new(),
            user_ids: Mutex::new(HashMap::new()),
        }
    }

    async fn bot_user_id(&self, access_token: &str) -> Result<String> {
        self.bot_user_id
            .get_or_try_init(|| async {
                let id = match self.credentials.bot_credential()?.user_id {
                    Some(id) => id,
                    None => self
                        .api
                        .validate_token(access_token)
                        .await?
                        .user_id
                        .context("Bot token has no user id")?,
                };
                anyhow::Ok(id)
            })
            .await
            .cloned()
    }

    async fn user_id(&self, login: &str) -> Result<String> {
        if let Some(id) = self.user_ids.lock().get(login) {
            return Ok(id.clone());
        }
        let user = self
            .api
            .user_by_login(login)
            .await?
            .with_context(|| format!("Unknown user '{login}'"))?;
        self.user_ids.lock().insert(login.to_string(), user.id.clone());
        Ok(user.id)
    }

    async fn timeout(&self, request: &TimeoutRequest) -> Result<()> {
        let channel = request.channel.as_str();
        let owner = self.owner_tokens.usable_credential(channel).await?;
        let broadcaster_id = match &owner.owner_id {
            Some(id) => id.clone(),
            None => self.user_id(channel).await?,
        };
        let user_id = self.user_id(&request.target).await?;
        let params = TimeoutParams {
            broadcaster_id: &broadcaster_id,
            moderator_id: &broadcaster_id,
            user_id: &user_id,
            duration_secs: request.duration_secs,
            reason: &request.reason,
        };

        let result = match self.api.timeout_user(&owner.access_token, params).await {
            Err(PlatformError::Unauthorized(reason)) => {
                tracing::warn!(channel, "Owner token rejected by timeout ({reason})");
                let renewed = self
                    .owner_tokens
                    .renew_rejected(channel, &owner.access_token)
                    .await?;
                self.api.timeout_user(&renewed.access_token, params).await
            }
            other => other,
        };
        result.with_context(|| format!("Timeout of '{}' failed", request.target))
    }
}

#[async_trait]
impl ModerationSink for HelixModerator {
    async fn say(&self, channel: &str, text: &str) -> Result<()> {
        let bot = self.credentials.bot_credential()?;
        let sender_id = self.bot_user_id(&bot.access_token).await?;
        let broadcaster_id = self.user_id(channel).await?;
        self.api
            .send_chat_message(&bot.access_token, &broadcaster_id, &sender_id, text)
            .await
            .with_context(|| format!("Failed to send chat message to #{channel}"))
    }

    async fn execute(&self, origin: CommandOrigin, command: &ModerationCommand) -> Result<()> {
        match command {
            ModerationCommand::Timeout(request) => {
                tracing::info!(
                    channel = %request.channel,
                    target = %request.target,
                    requester = %request.requester,
                    duration = request.duration_secs,
                    ?origin,
                    "Executing timeout"
                );
                self.timeout(request).await
            }
        }
    }
}
