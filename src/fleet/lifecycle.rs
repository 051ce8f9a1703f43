use anyhow::{Context, anyhow};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use super::manifest::{Manifest, WorkerProcessEntry, worker_name};
use super::supervisor::ProcessSupervisor;
use super::template::{self, TemplateVars};
use crate::config::{Config, FleetConfig};
use crate::lockfile::{self, LockGuard, LockOutcome};
use crate::platform::is_valid_login;
use crate::store::atomic::write_atomic;
use crate::store::{ChannelConfig, ChannelConfigStore};

const MANIFEST_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("#{0} is not enrolled")]
    NotFound(String),
    #[error("another operation on #{0} is in progress")]
    LockHeld(String),
    /// Policy or input refusal; the message is meant for the requester.
    #[error("{0}")]
    Refused(String),
    #[error("migration of #{channel} failed and was rolled back: {reason}")]
    MigrationRolledBack { channel: String, reason: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollOutcome {
    Enrolled,
    /// The worker was already running and got restarted instead.
    Restarted,
    AtCapacity { ceiling: usize },
}

impl EnrollOutcome {
    pub fn message(self, channel: &str) -> String {
        match self {
            Self::Enrolled => format!("✅ Joined #{channel}. Settings can be changed with !fleet help."),
            Self::Restarted => format!("✅ #{channel} was already running; restarted it."),
            Self::AtCapacity { ceiling } => format!(
                "⚠️ The fleet is full ({ceiling} workers), so #{channel} was not added. The bot owner has been asked to raise the limit."
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch: usize,
    pub batches: usize,
    pub migrated: usize,
    pub failed: usize,
    pub total: usize,
}

/// Result of a multi-channel migration or rollback. Partial success is
/// normal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Not attempted because shutdown was requested first.
    pub skipped: Vec<String>,
    pub interrupted: bool,
}

impl BatchReport {
    pub fn summary(&self, verb: &str) -> String {
        let mut text = format!(
            "{verb} {}/{} workers",
            self.succeeded.len(),
            self.total
        );
        if !self.failed.is_empty() {
            let names: Vec<String> = self.failed.iter().map(|(ch, _)| format!("#{ch}")).collect();
            text.push_str(&format!(", {} failed ({})", self.failed.len(), names.join(", ")));
        }
        if self.interrupted {
            text.push_str(", stopped early by shutdown");
            if !self.skipped.is_empty() {
                text.push_str(&format!(" ({} not attempted)", self.skipped.len()));
            }
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub channel: String,
    pub online: bool,
    pub restarts: u64,
    pub has_backup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetStatus {
    pub workers: Vec<WorkerStatus>,
    pub ceiling: usize,
}

impl FleetStatus {
    pub fn summary(&self) -> String {
        let online = self.workers.iter().filter(|w| w.online).count();
        let mut text = format!(
            "{}/{} workers, {online} online",
            self.workers.len(),
            self.ceiling
        );
        let offline: Vec<String> = self
            .workers
            .iter()
            .filter(|w| !w.online)
            .map(|w| format!("#{}", w.channel))
            .collect();
        if !offline.is_empty() {
            text.push_str(". Offline: ");
            text.push_str(&offline.join(", "));
        }
        text
    }
}

/// Where fleet files live on disk.
#[derive(Debug, Clone)]
pub struct FleetLayout {
    pub data_dir: PathBuf,
    pub channels_dir: PathBuf,
    pub workers_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub locks_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub conduit_path: PathBuf,
    pub template_path: PathBuf,
}

impl FleetLayout {
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            channels_dir: config.channels_dir(),
            workers_dir: config.workers_dir(),
            manifest_path: config.manifest_path(),
            locks_dir: config.locks_dir(),
            logs_dir: config.logs_dir(),
            conduit_path: config.conduit_path(),
            template_path: config.template_path(),
        }
    }
}

/// Creates, restarts, migrates and rolls back per-channel workers.
pub struct FleetManager {
    layout: FleetLayout,
    settings: FleetConfig,
    channels: Arc<ChannelConfigStore>,
    supervisor: Arc<dyn ProcessSupervisor>,
}

impl FleetManager {
    pub fn new(
        config: &Config,
        channels: Arc<ChannelConfigStore>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self {
            layout: FleetLayout::from_config(config),
            settings: config.fleet.clone(),
            channels,
            supervisor,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.settings.max_workers
    }

    // ── Paths and locks ─────────────────────────────────────────

    fn worker_dir(&self, channel: &str) -> PathBuf {
        self.layout.workers_dir.join(channel)
    }

    pub fn script_path(&self, channel: &str) -> PathBuf {
        self.worker_dir(channel).join(&self.settings.script_name)
    }

    pub fn backup_path(&self, channel: &str) -> PathBuf {
        self.worker_dir(channel)
            .join(format!("{}.bak", self.settings.script_name))
    }

    fn worker_lock(&self, channel: &str) -> Result<LockGuard, LifecycleError> {
        let path = self.layout.locks_dir.join(format!("worker-{channel}.lock"));
        match lockfile::try_lock(&path)? {
            LockOutcome::Acquired(guard) => Ok(guard),
            LockOutcome::Contended => Err(LifecycleError::LockHeld(channel.to_string())),
        }
    }

    async fn manifest_lock(&self) -> anyhow::Result<LockGuard> {
        lockfile::lock(&self.layout.locks_dir.join("manifest.lock"), MANIFEST_LOCK_TIMEOUT).await
    }

    fn validate(channel: &str) -> Result<(), LifecycleError> {
        if is_valid_login(channel) {
            Ok(())
        } else {
            Err(LifecycleError::Refused(format!(
                "'{channel}' is not a valid channel name"
            )))
        }
    }

    fn ensure_enrolled(&self, channel: &str) -> Result<Manifest, LifecycleError> {
        Self::validate(channel)?;
        let manifest = Manifest::load(&self.layout.manifest_path)?;
        if manifest.entry(channel).is_none() {
            return Err(LifecycleError::NotFound(channel.to_string()));
        }
        Ok(manifest)
    }

    // ── Script and manifest materialization ────────────────────

    fn materialize_script(&self, channel: &str) -> anyhow::Result<()> {
        let template = template::load(&self.layout.template_path)?;
        let config_path = self.layout.channels_dir.join(format!("{channel}.json"));
        let script = template::render(
            &template,
            &TemplateVars {
                channel,
                config_path: &config_path,
                conduit_path: &self.layout.conduit_path,
                data_dir: &self.layout.data_dir,
            },
        );
        write_atomic(&self.script_path(channel), script.as_bytes(), false)
    }

    fn entry_for(&self, channel: &str) -> WorkerProcessEntry {
        let path = |p: &Path| p.to_string_lossy().to_string();
        let mut env = BTreeMap::new();
        env.insert("BOT_CHANNEL".into(), channel.to_string());
        env.insert("CHATFLEET_HOME".into(), path(&self.layout.data_dir));

        WorkerProcessEntry {
            name: worker_name(channel),
            script: path(&self.script_path(channel)),
            cwd: Some(path(&self.worker_dir(channel))),
            interpreter: Some(self.settings.interpreter.clone()),
            autorestart: true,
            max_memory_restart: Some(self.settings.max_memory.clone()),
            out_file: Some(path(&self.layout.logs_dir.join(format!("{channel}-out.log")))),
            error_file: Some(path(&self.layout.logs_dir.join(format!("{channel}-error.log")))),
            watch: vec![
                path(&self.layout.channels_dir.join(format!("{channel}.json"))),
                path(&self.layout.conduit_path),
            ],
            env,
            extra: serde_json::Map::new(),
        }
    }

    async fn persist_supervisor(&self) {
        if let Err(e) = self.supervisor.persist().await {
            tracing::warn!("Failed to persist supervisor process list: {e:#}");
        }
    }

    async fn restart_and_verify(&self, channel: &str) -> anyhow::Result<()> {
        let name = worker_name(channel);
        self.supervisor.restart(&name).await?;
        if self.settings.post_restart_check_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.post_restart_check_ms)).await;
        }
        if !self.supervisor.is_running(&name).await? {
            anyhow::bail!("{name} is not running after restart");
        }
        Ok(())
    }

    fn restore_backup(&self, channel: &str) -> anyhow::Result<()> {
        let backup = self.backup_path(channel);
        let contents = std::fs::read(&backup)
            .with_context(|| format!("Failed to read backup {}", backup.display()))?;
        write_atomic(&self.script_path(channel), &contents, false)
    }

    // ── Operations ──────────────────────────────────────────────

    /// Enroll `channel`, or restart its worker if it is already running.
    pub async fn enroll(&self, channel: &str, requested_by: &str) -> Result<EnrollOutcome, LifecycleError> {
        Self::validate(channel)?;
        let _worker = self.worker_lock(channel)?;
        let _manifest_guard = self.manifest_lock().await?;
        let mut manifest = Manifest::load(&self.layout.manifest_path)?;
        let name = worker_name(channel);
        let known = manifest.entry(channel).is_some();

        if known && self.supervisor.is_running(&name).await? {
            self.supervisor.restart(&name).await?;
            tracing::info!(channel, requested_by, "Enroll of running worker; restarted");
            return Ok(EnrollOutcome::Restarted);
        }

        if !known && manifest.apps.len() >= self.settings.max_workers {
            tracing::info!(channel, requested_by, ceiling = self.settings.max_workers, "Enrollment refused at capacity");
            return Ok(EnrollOutcome::AtCapacity {
                ceiling: self.settings.max_workers,
            });
        }

        if !self.channels.exists(channel)? {
            self.channels
                .save(&ChannelConfig::with_defaults(channel))
                .await?;
        }
        self.materialize_script(channel)?;
        manifest.upsert(self.entry_for(channel));
        manifest.save(&self.layout.manifest_path)?;

        self.supervisor
            .start(&self.layout.manifest_path, &name)
            .await
            .with_context(|| format!("Failed to start worker for #{channel}"))?;
        self.persist_supervisor().await;

        tracing::info!(channel, requested_by, "Worker enrolled");
        Ok(EnrollOutcome::Enrolled)
    }

    /// Stop and remove the worker. The channel's configuration stays, so a
    /// later enroll restores its settings.
    pub async fn unenroll(&self, channel: &str, requested_by: &str) -> Result<bool, LifecycleError> {
        Self::validate(channel)?;
        let _worker = self.worker_lock(channel)?;
        let _manifest_guard = self.manifest_lock().await?;
        let mut manifest = Manifest::load(&self.layout.manifest_path)?;
        if manifest.remove(channel).is_none() {
            return Ok(false);
        }
        manifest.save(&self.layout.manifest_path)?;

        if let Err(e) = self.supervisor.delete(&worker_name(channel)).await {
            tracing::warn!(channel, "Supervisor delete failed (process may already be gone): {e:#}");
        }
        self.persist_supervisor().await;
        tracing::info!(channel, requested_by, "Worker unenrolled");
        Ok(true)
    }

    pub async fn restart(&self, channel: &str) -> Result<(), LifecycleError> {
        self.ensure_enrolled(channel)?;
        let _worker = self.worker_lock(channel)?;
        self.supervisor.restart(&worker_name(channel)).await?;
        Ok(())
    }

    /// Back up the current script, write the new one from the template and
    /// restart. A failed restart restores the backup and restarts again
    /// before the error is returned.
    pub async fn migrate_one(&self, channel: &str) -> Result<(), LifecycleError> {
        self.ensure_enrolled(channel)?;
        let _worker = self.worker_lock(channel)?;

        let script = self.script_path(channel);
        let backup = self.backup_path(channel);
        let had_script = script.exists();
        if had_script {
            std::fs::copy(&script, &backup)
                .with_context(|| format!("Failed to back up {}", script.display()))?;
        }
        self.materialize_script(channel)?;

        let Err(failure) = self.restart_and_verify(channel).await else {
            tracing::info!(channel, "Worker migrated to current template");
            return Ok(());
        };
        tracing::warn!(channel, "Migrated worker failed to restart, rolling back: {failure:#}");

        if !had_script {
            let name = worker_name(channel);
            if let Err(e) = self.supervisor.stop(&name).await {
                tracing::warn!(channel, "Failed to stop broken worker: {e:#}");
            }
            return Err(anyhow!("Migration of #{channel} failed with no backup to restore; worker stopped: {failure:#}").into());
        }

        self.restore_backup(channel)?;
        if let Err(e) = self.restart_and_verify(channel).await {
            return Err(anyhow!(
                "Migration of #{channel} failed ({failure:#}) and the rolled-back worker did not restart: {e:#}"
            )
            .into());
        }
        Err(LifecycleError::MigrationRolledBack {
            channel: channel.to_string(),
            reason: format!("{failure:#}"),
        })
    }

    /// Migrate the whole fleet in groups of `batch_size` with the configured
    /// delay between groups. Shutdown is checked before each channel; channels
    /// not started by then are reported as skipped.
    pub async fn migrate_batch<F>(
        &self,
        batch_size: usize,
        mut shutdown: watch::Receiver<bool>,
        mut on_progress: F,
    ) -> Result<BatchReport, LifecycleError>
    where
        F: FnMut(&BatchProgress) + Send,
    {
        let channels = Manifest::load(&self.layout.manifest_path)?.channels();
        let batch_size = batch_size.max(1);
        let batches = channels.len().div_ceil(batch_size);
        let mut report = BatchReport {
            total: channels.len(),
            ..BatchReport::default()
        };

        for (index, chunk) in channels.chunks(batch_size).enumerate() {
            if *shutdown.borrow() {
                report.interrupted = true;
                report
                    .skipped
                    .extend(channels[index * batch_size..].iter().cloned());
                break;
            }

            let stop = &shutdown;
            let results = join_all(chunk.iter().map(|channel| async move {
                if *stop.borrow() {
                    return (channel.clone(), None);
                }
                (channel.clone(), Some(self.migrate_one(channel).await))
            }))
            .await;
            for (channel, result) in results {
                match result {
                    Some(Ok(())) => report.succeeded.push(channel),
                    Some(Err(e)) => report.failed.push((channel, e.to_string())),
                    None => {
                        tracing::info!(channel = %channel, "Shutdown requested; migration skipped");
                        report.interrupted = true;
                        report.skipped.push(channel);
                    }
                }
            }

            on_progress(&BatchProgress {
                batch: index + 1,
                batches,
                migrated: report.succeeded.len(),
                failed: report.failed.len(),
                total: report.total,
            });

            if index + 1 < batches {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(self.settings.batch_delay_secs)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!("{}", report.summary("Migrated"));
        Ok(report)
    }

    /// Put the pre-migration script back and restart.
    pub async fn rollback_one(&self, channel: &str) -> Result<(), LifecycleError> {
        self.ensure_enrolled(channel)?;
        let _worker = self.worker_lock(channel)?;
        if !self.backup_path(channel).exists() {
            return Err(LifecycleError::Refused(format!(
                "#{channel} has no backup to roll back to"
            )));
        }
        self.restore_backup(channel)?;
        self.restart_and_verify(channel).await?;
        tracing::info!(channel, "Worker rolled back");
        Ok(())
    }

    /// Roll back every worker that has a backup.
    pub async fn rollback_all(&self) -> Result<BatchReport, LifecycleError> {
        let channels: Vec<String> = Manifest::load(&self.layout.manifest_path)?
            .channels()
            .into_iter()
            .filter(|ch| self.backup_path(ch).exists())
            .collect();
        let mut report = BatchReport {
            total: channels.len(),
            ..BatchReport::default()
        };
        for channel in channels {
            match self.rollback_one(&channel).await {
                Ok(()) => report.succeeded.push(channel),
                Err(e) => report.failed.push((channel, e.to_string())),
            }
        }
        tracing::info!("{}", report.summary("Rolled back"));
        Ok(report)
    }

    /// Regenerate every script and manifest entry from current settings,
    /// then have the supervisor reload the manifest.
    pub async fn redeploy_all(&self) -> Result<usize, LifecycleError> {
        let _manifest_guard = self.manifest_lock().await?;
        let mut manifest = Manifest::load(&self.layout.manifest_path)?;
        let channels = manifest.channels();

        let mut guards = Vec::with_capacity(channels.len());
        for channel in &channels {
            guards.push(self.worker_lock(channel)?);
        }
        for channel in &channels {
            self.materialize_script(channel)?;
            manifest.upsert(self.entry_for(channel));
        }
        manifest.save(&self.layout.manifest_path)?;
        self.supervisor.reload(&self.layout.manifest_path).await?;
        self.persist_supervisor().await;
        drop(guards);

        tracing::info!(workers = channels.len(), "Fleet redeployed");
        Ok(channels.len())
    }

    pub async fn status(&self) -> Result<FleetStatus, LifecycleError> {
        let channels = Manifest::load(&self.layout.manifest_path)?.channels();
        let processes = self.supervisor.list().await?;
        let workers = channels
            .into_iter()
            .map(|channel| {
                let name = worker_name(&channel);
                let process = processes.iter().find(|p| p.name == name);
                WorkerStatus {
                    online: process.is_some_and(|p| p.online),
                    restarts: process.map_or(0, |p| p.restarts),
                    has_backup: self.backup_path(&channel).exists(),
                    channel,
                }
            })
            .collect();
        Ok(FleetStatus {
            workers,
            ceiling: self.settings.max_workers,
        })
    }
}
