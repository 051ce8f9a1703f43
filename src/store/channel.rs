use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::atomic::{read_optional, write_atomic};
use crate::lockfile;
use crate::platform::is_valid_login;

/// Timeout applied to redemptions when a channel has not chosen one.
pub const DEFAULT_REDEMPTION_TIMEOUT_SECS: u64 = 60;

const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

fn default_redemption_timeout_secs() -> u64 {
    DEFAULT_REDEMPTION_TIMEOUT_SECS
}

/// Per-channel settings, shared by the control plane and the channel's worker.
///
/// Fields this version does not know about are kept in `extra` and written
/// back untouched, so an older control plane never strips settings a newer
/// worker added.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub channel: String,
    #[serde(default)]
    pub moderation_enabled: bool,
    #[serde(default)]
    pub chat_only: bool,
    #[serde(default)]
    pub redemption_enabled: bool,
    /// Only redemptions of this reward are acted on when set.
    #[serde(default)]
    pub redemption_reward_id: Option<String>,
    #[serde(default = "default_redemption_timeout_secs")]
    pub redemption_timeout_secs: u64,
    #[serde(default)]
    pub excluded_commands: Vec<String>,
    /// Privileged usernames (may redeem in test mode, etc.).
    #[serde(default)]
    pub special_users: Vec<String>,
    /// Free-form locale or location string used by command handlers.
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChannelConfig {
    /// Settings a channel starts with on first enrollment.
    pub fn with_defaults(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            moderation_enabled: true,
            chat_only: false,
            redemption_enabled: false,
            redemption_reward_id: None,
            redemption_timeout_secs: DEFAULT_REDEMPTION_TIMEOUT_SECS,
            excluded_commands: Vec::new(),
            special_users: Vec::new(),
            location: None,
            updated_at: None,
            extra: Map::new(),
        }
    }

    pub fn is_command_excluded(&self, command: &str) -> bool {
        self.excluded_commands
            .iter()
            .any(|c| c.eq_ignore_ascii_case(command))
    }

    pub fn is_special_user(&self, login: &str) -> bool {
        self.special_users
            .iter()
            .any(|u| u.eq_ignore_ascii_case(login))
    }
}

/// Directory-backed store with one JSON record per channel.
#[derive(Debug, Clone)]
pub struct ChannelConfigStore {
    dir: PathBuf,
    locks_dir: PathBuf,
}

impl ChannelConfigStore {
    pub fn new(dir: impl Into<PathBuf>, locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks_dir: locks_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    /// Path of a channel's record. Rejects names outside the login grammar,
    /// which also keeps path separators out of file names.
    pub fn path_for(&self, channel: &str) -> Result<PathBuf> {
        if !is_valid_login(channel) {
            bail!("Invalid channel name '{channel}'");
        }
        Ok(self.dir.join(format!("{channel}.json")))
    }

    pub fn exists(&self, channel: &str) -> Result<bool> {
        Ok(self.path_for(channel)?.exists())
    }

    /// Load a channel's record; `None` when the channel has never been seen.
    pub fn load(&self, channel: &str) -> Result<Option<ChannelConfig>> {
        let path = self.path_for(channel)?;
        let Some(content) = read_optional(&path)? else {
            return Ok(None);
        };
        let config: ChannelConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse channel config {}", path.display()))?;
        Ok(Some(config))
    }

    /// Load a channel's record, falling back to the caller's default on first contact.
    pub fn load_or(&self, channel: &str, default: ChannelConfig) -> Result<ChannelConfig> {
        Ok(self.load(channel)?.unwrap_or(default))
    }

    /// Persist `config`, merged over whatever is on disk.
    ///
    /// Top-level keys present in `config` win; keys only present on disk are
    /// kept. The write is an atomic replace under the channel's write lock;
    /// waiting for a contended lock yields to the runtime.
    pub async fn save(&self, config: &ChannelConfig) -> Result<ChannelConfig> {
        let path = self.path_for(&config.channel)?;
        let _guard = lockfile::lock(&self.lock_path(&config.channel), WRITE_LOCK_TIMEOUT).await?;
        self.save_locked(&path, config)
    }

    /// Read-modify-write a record under the channel's write lock.
    pub async fn update<F>(&self, channel: &str, mutate: F) -> Result<ChannelConfig>
    where
        F: FnOnce(&mut ChannelConfig) + Send,
    {
        let path = self.path_for(channel)?;
        let _guard = lockfile::lock(&self.lock_path(channel), WRITE_LOCK_TIMEOUT).await?;
        let mut config = self
            .load(channel)?
            .unwrap_or_else(|| ChannelConfig::with_defaults(channel));
        mutate(&mut config);
        self.save_locked(&path, &config)
    }

    /// All channel names with a stored record, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list {}", self.dir.display()));
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json").map(str::to_string)
            })
            .filter(|name| is_valid_login(name))
            .collect();
        names.sort();
        Ok(names)
    }

    fn lock_path(&self, channel: &str) -> PathBuf {
        self.locks_dir.join(format!("channel-{channel}.lock"))
    }

    fn save_locked(&self, path: &Path, config: &ChannelConfig) -> Result<ChannelConfig> {
        let mut incoming = config.clone();
        incoming.updated_at = Some(Utc::now());
        let Value::Object(new_fields) = serde_json::to_value(&incoming)? else {
            bail!("Channel config did not serialize to an object");
        };

        let mut merged = match read_optional(path)? {
            Some(existing) => match serde_json::from_str::<Value>(&existing) {
                Ok(Value::Object(map)) => map,
                _ => {
                    tracing::warn!(
                        path = %path.display(),
                        "Existing channel config is unreadable; replacing it"
                    );
                    Map::new()
                }
            },
            None => Map::new(),
        };
        for (key, value) in new_fields {
            merged.insert(key, value);
        }

        let bytes = serde_json::to_vec_pretty(&Value::Object(merged.clone()))?;
        write_atomic(path, &bytes, false)?;
        Ok(serde_json::from_value(Value::Object(merged))?)
    }
}
