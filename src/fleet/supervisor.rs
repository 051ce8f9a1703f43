use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Runtime state of one supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub name: String,
    pub online: bool,
    pub restarts: u64,
    pub memory_bytes: u64,
}

/// The external process supervisor the fleet runs under.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start `name` as described by the manifest.
    async fn start(&self, manifest: &Path, name: &str) -> Result<()>;

    async fn restart(&self, name: &str) -> Result<()>;

    async fn stop(&self, name: &str) -> Result<()>;

    /// Stop and forget `name`.
    async fn delete(&self, name: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<ProcessStatus>>;

    /// Re-read the whole manifest, starting or reloading every entry.
    async fn reload(&self, manifest: &Path) -> Result<()>;

    /// Persist the current process list across supervisor restarts.
    async fn persist(&self) -> Result<()>;

    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .list()
            .await?
            .iter()
            .any(|p| p.name == name && p.online))
    }
}

#[derive(Debug, Deserialize)]
struct JlistEntry {
    name: String,
    #[serde(default)]
    pm2_env: JlistEnv,
    #[serde(default)]
    monit: JlistMonit,
}

#[derive(Debug, Default, Deserialize)]
struct JlistEnv {
    #[serde(default)]
    status: String,
    #[serde(default)]
    restart_time: u64,
}

#[derive(Debug, Default, Deserialize)]
struct JlistMonit {
    #[serde(default)]
    memory: u64,
}

fn parse_jlist(raw: &str) -> Result<Vec<ProcessStatus>> {
    // pm2 may print warnings before the JSON array.
    let start = raw
        .find("[{")
        .or_else(|| raw.find("[]"))
        .context("pm2 jlist output has no JSON array")?;
    let entries: Vec<JlistEntry> =
        serde_json::from_str(&raw[start..]).context("Failed to parse pm2 jlist output")?;
    Ok(entries
        .into_iter()
        .map(|e| ProcessStatus {
            online: e.pm2_env.status == "online",
            name: e.name,
            restarts: e.pm2_env.restart_time,
            memory_bytes: e.monit.memory,
        })
        .collect())
}

/// `pm2` driven through its CLI.
pub struct Pm2Supervisor {
    bin: String,
    timeout: Duration,
}

impl Pm2Supervisor {
    pub fn new(bin: &str, timeout: Duration) -> Self {
        Self {
            bin: bin.to_string(),
            timeout,
        }
    }

    /// Run pm2 with `args`, failing on non-zero exit or timeout. Returns stdout.
    async fn run_checked(&self, args: &[&str]) -> Result<String> {
        let mut command = Command::new(&self.bin);
        command.args(args).kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .with_context(|| format!("{} {} timed out", self.bin, args.join(" ")))?
            .with_context(|| format!("Failed to spawn {}", self.bin))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} {} failed: {}", self.bin, args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ProcessSupervisor for Pm2Supervisor {
    async fn start(&self, manifest: &Path, name: &str) -> Result<()> {
        let manifest = manifest.to_string_lossy();
        self.run_checked(&["start", manifest.as_ref(), "--only", name])
            .await
            .map(drop)
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.run_checked(&["restart", name, "--update-env"])
            .await
            .map(drop)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.run_checked(&["stop", name]).await.map(drop)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.run_checked(&["delete", name]).await.map(drop)
    }

    async fn list(&self) -> Result<Vec<ProcessStatus>> {
        parse_jlist(&self.run_checked(&["jlist"]).await?)
    }

    async fn reload(&self, manifest: &Path) -> Result<()> {
        let manifest = manifest.to_string_lossy();
        self.run_checked(&["startOrReload", manifest.as_ref()])
            .await
            .map(drop)
    }

    async fn persist(&self) -> Result<()> {
        self.run_checked(&["save"]).await.map(drop)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// In-memory supervisor. `fail_restarts` makes the next N restarts fail.
    #[derive(Default)]
    pub struct FakeSupervisor {
        pub processes: Mutex<BTreeMap<String, bool>>,
        pub calls: Mutex<Vec<String>>,
        pub fail_restarts: Mutex<u32>,
        /// Signalled on the first restart, to request shutdown mid-operation.
        pub shutdown_on_restart: Mutex<Option<tokio::sync::watch::Sender<bool>>>,
    }

    #[async_trait]
    impl ProcessSupervisor for FakeSupervisor {
        async fn start(&self, _manifest: &Path, name: &str) -> Result<()> {
            self.calls.lock().push(format!("start {name}"));
            self.processes.lock().insert(name.to_string(), true);
            Ok(())
        }

        async fn restart(&self, name: &str) -> Result<()> {
            self.calls.lock().push(format!("restart {name}"));
            if let Some(tx) = self.shutdown_on_restart.lock().take() {
                let _ = tx.send(true);
            }
            let mut failures = self.fail_restarts.lock();
            if *failures > 0 {
                *failures -= 1;
                self.processes.lock().insert(name.to_string(), false);
                bail!("process {name} errored on start");
            }
            self.processes.lock().insert(name.to_string(), true);
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<()> {
            self.calls.lock().push(format!("stop {name}"));
            self.processes.lock().insert(name.to_string(), false);
            Ok(())
        }

        async fn delete(&self, name: &str) -> Result<()> {
            self.calls.lock().push(format!("delete {name}"));
            self.processes.lock().remove(name);
            Ok(())
        }

        async fn list(&self) -> Result<Vec<ProcessStatus>> {
            Ok(self
                .processes
                .lock()
                .iter()
                .map(|(name, online)| ProcessStatus {
                    name: name.clone(),
                    online: *online,
                    restarts: 0,
                    memory_bytes: 0,
                })
                .collect())
        }

        async fn reload(&self, _manifest: &Path) -> Result<()> {
            self.calls.lock().push("reload".into());
            Ok(())
        }

        async fn persist(&self) -> Result<()> {
            Ok(())
        }
    }
}
