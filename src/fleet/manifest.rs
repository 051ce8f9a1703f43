//! The process-supervisor manifest (`ecosystem.json`), edited as data.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::store::atomic::{read_optional, write_atomic};

const WORKER_PREFIX: &str = "bot-";

pub fn worker_name(channel: &str) -> String {
    format!("{WORKER_PREFIX}{channel}")
}

fn default_true() -> bool {
    true
}

/// One supervised worker. Field names follow the supervisor's manifest
/// format; unknown fields survive a load/save cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProcessEntry {
    pub name: String,
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    #[serde(default = "default_true")]
    pub autorestart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_file: Option<String>,
    #[serde(default)]
    pub watch: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkerProcessEntry {
    pub fn channel(&self) -> Option<&str> {
        self.name.strip_prefix(WORKER_PREFIX)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub apps: Vec<WorkerProcessEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Load the manifest; a missing file is an empty fleet.
    pub fn load(path: &Path) -> Result<Self> {
        let Some(content) = read_optional(path)? else {
            return Ok(Self::default());
        };
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("Failed to serialize manifest")?;
        write_atomic(path, &bytes, false)
    }

    pub fn entry(&self, channel: &str) -> Option<&WorkerProcessEntry> {
        let name = worker_name(channel);
        self.apps.iter().find(|app| app.name == name)
    }

    /// Insert or replace by name. A replaced entry's unknown fields are kept.
    pub fn upsert(&mut self, mut entry: WorkerProcessEntry) {
        match self.apps.iter_mut().find(|app| app.name == entry.name) {
            Some(existing) => {
                for (key, value) in std::mem::take(&mut existing.extra) {
                    entry.extra.entry(key).or_insert(value);
                }
                *existing = entry;
            }
            None => self.apps.push(entry),
        }
    }

    pub fn remove(&mut self, channel: &str) -> Option<WorkerProcessEntry> {
        let name = worker_name(channel);
        let index = self.apps.iter().position(|app| app.name == name)?;
        Some(self.apps.remove(index))
    }

    /// Channels with a worker entry, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .apps
            .iter()
            .filter_map(|app| app.channel().map(str::to_string))
            .collect();
        channels.sort();
        channels
    }
}
