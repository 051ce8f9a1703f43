use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::atomic::{read_optional, remove_if_exists, write_atomic};
use super::channel::ChannelConfigStore;
use crate::platform::is_valid_login;

/// Bot-wide chat credential. Rotated by hand (interactive consent), so the
/// control plane only watches its expiry.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct BotCredential {
    pub access_token: String,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Channel-owner credential granting elevated features (redemptions).
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelCredential {
    pub channel: String,
    pub owner_login: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChannelCredential {
    /// Lifetime left at `now` according to the stored expiry.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.expires_at
            .map(|expiry| (expiry - now).to_std().unwrap_or_default())
    }
}

fn redact(token: &str) -> String {
    let tail: String = token
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{tail}")
}

impl std::fmt::Debug for BotCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotCredential")
            .field("access_token", &redact(&self.access_token))
            .field("login", &self.login)
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ChannelCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCredential")
            .field("channel", &self.channel)
            .field("owner_login", &self.owner_login)
            .field("access_token", &redact(&self.access_token))
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Credential records, kept apart from channel configuration.
///
/// Layout: `<dir>/bot.json` for the bot-wide credential and
/// `<dir>/channels/<channel>.json` per channel owner. All files are 0600.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
    channels: Arc<ChannelConfigStore>,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>, channels: Arc<ChannelConfigStore>) -> Self {
        Self {
            dir: dir.into(),
            channels,
        }
    }

    /// The channel configuration store this store cascades into.
    pub fn channels(&self) -> &Arc<ChannelConfigStore> {
        &self.channels
    }

    pub fn bot_path(&self) -> PathBuf {
        self.dir.join("bot.json")
    }

    fn channel_dir(&self) -> PathBuf {
        self.dir.join("channels")
    }

    fn channel_path(&self, channel: &str) -> Result<PathBuf> {
        if !is_valid_login(channel) {
            anyhow::bail!("Invalid channel name '{channel}'");
        }
        Ok(self.channel_dir().join(format!("{channel}.json")))
    }

    /// The bot-wide credential. A missing or unreadable record is an error;
    /// nothing downstream can work without it.
    pub fn bot_credential(&self) -> Result<BotCredential> {
        let path = self.bot_path();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read bot credential {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse bot credential {}", path.display()))
    }

    pub fn set_bot_credential(&self, credential: &BotCredential) -> Result<()> {
        let mut record = credential.clone();
        record.updated_at = Some(Utc::now());
        write_json(&self.bot_path(), &record)
    }

    pub fn channel_credential(&self, channel: &str) -> Result<Option<ChannelCredential>> {
        let path = self.channel_path(channel)?;
        let Some(content) = read_optional(&path)? else {
            return Ok(None);
        };
        let credential = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse credential {}", path.display()))?;
        Ok(Some(credential))
    }

    /// Store a channel credential. The stored version is always strictly
    /// greater than the one it replaces.
    pub fn set_channel_credential(&self, credential: &ChannelCredential) -> Result<ChannelCredential> {
        let previous = self
            .channel_credential(&credential.channel)?
            .map_or(0, |c| c.version);
        let mut record = credential.clone();
        record.version = previous.max(credential.version) + 1;
        record.updated_at = Some(Utc::now());
        write_json(&self.channel_path(&credential.channel)?, &record)?;
        Ok(record)
    }

    /// Delete a channel's credential and switch its redemption feature off.
    ///
    /// The flag is cleared before the record disappears so no reader ever
    /// sees "redemption enabled" without a credential behind it.
    pub async fn remove_channel_credential(&self, channel: &str) -> Result<bool> {
        let path = self.channel_path(channel)?;
        if self.channels.exists(channel)? {
            self.channels
                .update(channel, |cfg| cfg.redemption_enabled = false)
                .await?;
        }
        let existed = remove_if_exists(&path)?;
        if existed {
            tracing::info!(channel, "Removed channel credential and disabled redemptions");
        }
        Ok(existed)
    }

    /// Channels with a stored owner credential, sorted.
    pub fn list_channels(&self) -> Result<Vec<String>> {
        let dir = self.channel_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .strip_suffix(".json")
                    .map(str::to_string)
            })
            .filter(|name| is_valid_login(name))
            .collect();
        names.sort();
        Ok(names)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("Failed to serialize credential")?;
    write_atomic(path, &bytes, true)
}
