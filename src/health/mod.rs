//! Per-component health for the daemon, snapshotted to `daemon_state.json`.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Starting,
    Ok,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub updated_at: String,
    pub last_ok: Option<String>,
    pub last_error: Option<String>,
    pub restart_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub updated_at: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Shared by every supervised component of one daemon.
pub struct HealthRegistry {
    started_at: Instant,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            components: Mutex::new(BTreeMap::new()),
        }
    }

    fn upsert<F>(&self, component: &str, update: F)
    where
        F: FnOnce(&mut ComponentHealth),
    {
        let now = now_rfc3339();
        let mut map = self.components.lock();
        let entry = map
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth {
                status: ComponentStatus::Starting,
                updated_at: now.clone(),
                last_ok: None,
                last_error: None,
                restart_count: 0,
            });
        update(entry);
        entry.updated_at = now;
    }

    pub fn mark_ok(&self, component: &str) {
        self.upsert(component, |entry| {
            entry.status = ComponentStatus::Ok;
            entry.last_ok = Some(now_rfc3339());
            entry.last_error = None;
        });
    }

    pub fn mark_error(&self, component: &str, error: &str) {
        self.upsert(component, |entry| {
            entry.status = ComponentStatus::Error;
            entry.last_error = Some(error.to_string());
        });
    }

    pub fn mark_stopped(&self, component: &str) {
        self.upsert(component, |entry| entry.status = ComponentStatus::Stopped);
    }

    pub fn bump_restart(&self, component: &str) {
        self.upsert(component, |entry| {
            entry.restart_count = entry.restart_count.saturating_add(1);
        });
    }

    pub fn component(&self, component: &str) -> Option<ComponentHealth> {
        self.components.lock().get(component).cloned()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            pid: std::process::id(),
            updated_at: now_rfc3339(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            components: self.components.lock().clone(),
        }
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|_| {
            serde_json::json!({
                "status": "error",
                "message": "failed to serialize health snapshot"
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_then_ok_clears_the_error() {
        let health = HealthRegistry::new();
        health.mark_error("renewal", "platform unreachable");
        health.bump_restart("renewal");
        let entry = health.component("renewal").unwrap();
        assert_eq!(entry.status, ComponentStatus::Error);
        assert_eq!(entry.restart_count, 1);

        health.mark_ok("renewal");
        let entry = health.component("renewal").unwrap();
        assert_eq!(entry.status, ComponentStatus::Ok);
        assert!(entry.last_error.is_none());
        assert_eq!(entry.restart_count, 1);
    }

    #[test]
    fn snapshot_json_lists_components() {
        let health = HealthRegistry::new();
        health.mark_ok("eventsub");
        health.mark_stopped("bot-monitor");
        let json = health.snapshot_json();
        assert_eq!(json["components"]["eventsub"]["status"], "ok");
        assert_eq!(json["components"]["bot-monitor"]["status"], "stopped");
        assert!(json["pid"].as_u64().is_some());
    }
}
