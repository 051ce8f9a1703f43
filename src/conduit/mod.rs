//! The single shared event-subscription conduit.
//!
//! The cached record in `conduit.json` is advisory. Every use re-checks the
//! remote side, and a conduit deleted out-of-band is replaced transparently.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::lockfile;
use crate::platform::PlatformApi;
use crate::store::atomic::{read_optional, write_atomic};

const SHARD_COUNT: u32 = 1;
const LOCK_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardBinding {
    pub index: u32,
    pub session_id: String,
    pub bound_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conduit {
    pub id: String,
    pub shard_count: u32,
    #[serde(default)]
    pub shards: Vec<ShardBinding>,
    pub created_at: DateTime<Utc>,
}

impl Conduit {
    fn new(id: String, shard_count: u32) -> Self {
        Self {
            id,
            shard_count,
            shards: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn bind(&mut self, index: u32, session_id: &str) {
        self.shards.retain(|s| s.index != index);
        self.shards.push(ShardBinding {
            index,
            session_id: session_id.to_string(),
            bound_at: Utc::now(),
        });
        self.shards.sort_by_key(|s| s.index);
    }

    pub fn session_for(&self, index: u32) -> Option<&str> {
        self.shards
            .iter()
            .find(|s| s.index == index)
            .map(|s| s.session_id.as_str())
    }
}

/// Result of binding a transport session to the conduit.
#[derive(Debug, Clone)]
pub struct AttachOutcome {
    pub conduit: Conduit,
    /// A new conduit replaced the cached one (or none was cached), so
    /// subscriptions routed through the old one are gone.
    pub recreated: bool,
}

pub struct ConduitManager {
    api: Arc<dyn PlatformApi>,
    path: PathBuf,
    lock_path: PathBuf,
}

impl ConduitManager {
    pub fn new(api: Arc<dyn PlatformApi>, path: PathBuf, locks_dir: PathBuf) -> Self {
        Self {
            api,
            path,
            lock_path: locks_dir.join("conduit.lock"),
        }
    }

    /// The locally cached record, without any remote verification.
    pub fn cached(&self) -> Result<Option<Conduit>> {
        let Some(content) = read_optional(&self.path)? else {
            return Ok(None);
        };
        let conduit = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(Some(conduit))
    }

    fn persist(&self, conduit: &Conduit) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(conduit).context("Failed to serialize conduit")?;
        write_atomic(&self.path, &bytes, false)
    }

    async fn create(&self) -> Result<Conduit> {
        let info = self
            .api
            .create_conduit(SHARD_COUNT)
            .await
            .context("Failed to create conduit")?;
        let conduit = Conduit::new(info.id, info.shard_count);
        self.persist(&conduit)?;
        tracing::info!(conduit_id = %conduit.id, "Created conduit");
        Ok(conduit)
    }

    /// Return a conduit that exists remotely, creating one when the cache is
    /// empty or points at a conduit the platform no longer knows.
    pub async fn get_or_create(&self) -> Result<Conduit> {
        Ok(self.ensure().await?.0)
    }

    async fn ensure(&self) -> Result<(Conduit, bool)> {
        let _guard = lockfile::lock(&self.lock_path, LOCK_TIMEOUT).await?;

        let Some(cached) = self.cached()? else {
            return Ok((self.create().await?, true));
        };

        let remote = self
            .api
            .list_conduits()
            .await
            .context("Failed to verify conduit")?;
        match remote.iter().find(|c| c.id == cached.id) {
            Some(info) => {
                let mut conduit = cached;
                if conduit.shard_count != info.shard_count {
                    conduit.shard_count = info.shard_count;
                    self.persist(&conduit)?;
                }
                Ok((conduit, false))
            }
            None => {
                tracing::warn!(conduit_id = %cached.id, "Cached conduit no longer exists remotely; recreating");
                Ok((self.create().await?, true))
            }
        }
    }

    /// Replace `stale_id` unless another caller already did.
    async fn replace_stale(&self, stale_id: &str) -> Result<Conduit> {
        let _guard = lockfile::lock(&self.lock_path, LOCK_TIMEOUT).await?;
        if let Some(current) = self.cached()? {
            if current.id != stale_id {
                tracing::debug!(conduit_id = %current.id, "Conduit already replaced by another caller");
                return Ok(current);
            }
        }
        tracing::warn!(conduit_id = %stale_id, "Conduit vanished during shard update; recreating");
        self.create().await
    }

    /// Bind `session_id` as shard 0.
    ///
    /// If the bind reports the conduit missing, a fresh conduit is created and
    /// the bind retried exactly once.
    pub async fn attach_transport_session(&self, session_id: &str) -> Result<AttachOutcome> {
        let (mut conduit, mut recreated) = self.ensure().await?;

        match self.api.assign_shard(&conduit.id, 0, session_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                conduit = self.replace_stale(&conduit.id).await?;
                recreated = true;
                self.api
                    .assign_shard(&conduit.id, 0, session_id)
                    .await
                    .with_context(|| {
                        format!("Failed to bind session to recreated conduit {}", conduit.id)
                    })?;
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to bind session to conduit {}", conduit.id));
            }
        }

        let _guard = lockfile::lock(&self.lock_path, LOCK_TIMEOUT).await?;
        // Keep whatever is newest on disk if someone replaced it meanwhile.
        if self.cached()?.is_none_or(|c| c.id == conduit.id) {
            conduit.bind(0, session_id);
            self.persist(&conduit)?;
        }
        tracing::info!(conduit_id = %conduit.id, session_id, recreated, "Transport session attached");
        Ok(AttachOutcome { conduit, recreated })
    }
}
