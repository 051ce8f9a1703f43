use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::auth::{BotCredentialMonitor, RenewalService};
use crate::conduit::ConduitManager;
use crate::config::Config;
use crate::eventsub::EventSubSession;
use crate::health::HealthRegistry;
use crate::moderation::{HelixModerator, ModerationSink};
use crate::notify::create_notifier;
use crate::platform::{HelixClient, PlatformApi};
use crate::redemption::{PolicySettings, RedemptionDispatcher};
use crate::store::{ChannelConfigStore, CredentialStore};

const STATUS_FLUSH_SECONDS: u64 = 5;
const REDEMPTION_SYNC_SECONDS: u64 = 60;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Run the control-plane daemon until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let initial_backoff = config.reliability.component_initial_backoff_secs.max(1);
    let max_backoff = config
        .reliability
        .component_max_backoff_secs
        .max(initial_backoff);

    let health = Arc::new(HealthRegistry::new());
    let channels = Arc::new(ChannelConfigStore::new(config.channels_dir(), config.locks_dir()));
    let credentials = Arc::new(CredentialStore::new(config.credentials_dir(), channels));

    // Without the bot token nothing can chat; refuse to start half-working.
    let mut bot = credentials.bot_credential().context(
        "Bot credential is missing or unreadable; import one with `chatfleet credentials import-bot <token>`",
    )?;

    let api: Arc<dyn PlatformApi> = Arc::new(HelixClient::new(&config.platform, &config.reliability)?);
    let notifier = create_notifier(&config.notifications);
    let conduits = Arc::new(ConduitManager::new(
        Arc::clone(&api),
        config.conduit_path(),
        config.locks_dir(),
    ));
    let bot_monitor = Arc::new(BotCredentialMonitor::new(
        Arc::clone(&api),
        Arc::clone(&credentials),
        Arc::clone(&notifier),
        &config.renewal,
    ));

    // The redemption policy must know the bot's login to protect it. A check
    // backfills it from the platform when neither config nor store has it.
    if config.platform.bot_username.trim().is_empty() && bot.login.is_none() {
        if let Err(e) = bot_monitor.check().await {
            tracing::warn!("Bot credential check failed: {e:#}");
        }
        bot = credentials.bot_credential()?;
    }
    let policy = PolicySettings::resolve(&config, &bot)
        .context("Refusing to start: redemptions could target the bot account")?;

    // Owner tokens are validated before every moderation call. The credential
    // lock keeps this and the sweep from spending one refresh token twice.
    let owner_tokens = Arc::new(RenewalService::new(
        Arc::clone(&api),
        Arc::clone(&credentials),
        Arc::clone(&notifier),
        config.renewal.refresh_threshold(),
        config.renewal.remediation_url.clone(),
    ));
    let sink: Arc<dyn ModerationSink> = Arc::new(HelixModerator::new(
        Arc::clone(&api),
        Arc::clone(&credentials),
        owner_tokens,
    ));
    let dispatcher = Arc::new(RedemptionDispatcher::new(
        Arc::clone(&api),
        Arc::clone(&conduits),
        Arc::clone(&credentials),
        sink,
        policy,
    ));
    let renewal = Arc::new(
        RenewalService::new(
            Arc::clone(&api),
            Arc::clone(&credentials),
            notifier,
            config.renewal.refresh_threshold(),
            config.renewal.remediation_url.clone(),
        )
        .with_listener(dispatcher.clone()),
    );
    let session = Arc::new(EventSubSession::new(
        &config.platform.eventsub_ws_url,
        conduits,
        Arc::clone(&dispatcher),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    health.mark_ok("daemon");

    let mut handles: Vec<JoinHandle<()>> = vec![spawn_state_writer(
        state_file_path(&config),
        Arc::clone(&health),
        shutdown_rx.clone(),
    )];

    {
        let renewal = Arc::clone(&renewal);
        let interval = config.renewal.sweep_interval();
        let rx = shutdown_rx.clone();
        handles.push(spawn_component_supervisor(
            "renewal",
            Arc::clone(&health),
            shutdown_rx.clone(),
            initial_backoff,
            max_backoff,
            move || {
                let renewal = Arc::clone(&renewal);
                let rx = rx.clone();
                async move { renewal.run(interval, rx).await }
            },
        ));
    }

    {
        let monitor = Arc::clone(&bot_monitor);
        let interval = config.renewal.bot_check_interval();
        let rx = shutdown_rx.clone();
        handles.push(spawn_component_supervisor(
            "bot-monitor",
            Arc::clone(&health),
            shutdown_rx.clone(),
            initial_backoff,
            max_backoff,
            move || {
                let monitor = Arc::clone(&monitor);
                let rx = rx.clone();
                async move { monitor.run(interval, rx).await }
            },
        ));
    }

    {
        let session = Arc::clone(&session);
        let rx = shutdown_rx.clone();
        handles.push(spawn_component_supervisor(
            "eventsub",
            Arc::clone(&health),
            shutdown_rx.clone(),
            initial_backoff,
            max_backoff,
            move || {
                let session = Arc::clone(&session);
                let rx = rx.clone();
                async move { session.run(rx).await }
            },
        ));
    }

    {
        let dispatcher = Arc::clone(&dispatcher);
        let rx = shutdown_rx.clone();
        handles.push(spawn_component_supervisor(
            "redemption-sync",
            Arc::clone(&health),
            shutdown_rx.clone(),
            initial_backoff,
            max_backoff,
            move || {
                let dispatcher = Arc::clone(&dispatcher);
                let rx = rx.clone();
                async move {
                    run_redemption_sync(&dispatcher, Duration::from_secs(REDEMPTION_SYNC_SECONDS), rx).await
                }
            },
        ));
    }

    println!("🤖 chatfleet daemon started");
    println!("   Bot:        {}", bot.login.as_deref().unwrap_or("(unknown login)"));
    println!("   Data:       {}", config.data_dir.display());
    println!("   Components: renewal, bot-monitor, eventsub, redemption-sync");
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    let drain = async {
        for handle in &mut handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("Components did not stop within {SHUTDOWN_GRACE:?}; aborting them");
        for handle in &handles {
            handle.abort();
        }
    }
    health.mark_stopped("daemon");
    Ok(())
}

pub fn state_file_path(config: &Config) -> PathBuf {
    config.state_file()
}

/// Start or stop redemption subscriptions when channel settings change.
async fn run_redemption_sync(
    dispatcher: &RedemptionDispatcher,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
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
        dispatcher.reconcile().await?;
    }
}

fn spawn_state_writer(
    path: PathBuf,
    health: Arc<HealthRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_FLUSH_SECONDS));
        loop {
            let stopping = tokio::select! {
                _ = interval.tick() => false,
                _ = shutdown.changed() => true,
            };
            let mut json = health.snapshot_json();
            if let Some(obj) = json.as_object_mut() {
                obj.insert(
                    "written_at".into(),
                    serde_json::json!(Utc::now().to_rfc3339()),
                );
            }
            let data = serde_json::to_vec_pretty(&json).unwrap_or_else(|_| b"{}".to_vec());
            let _ = tokio::fs::write(&path, data).await;
            if stopping || *shutdown.borrow() {
                return;
            }
        }
    })
}

/// Keep one component running: restart it with exponential backoff when it
/// fails or returns, until shutdown.
fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    health: Arc<HealthRegistry>,
    mut shutdown: watch::Receiver<bool>,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            health.mark_ok(name);
            let result = run_component().await;
            if *shutdown.borrow() {
                health.mark_stopped(name);
                tracing::info!("Daemon component '{name}' stopped");
                return;
            }
            match result {
                Ok(()) => {
                    health.mark_error(name, "component exited unexpectedly");
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                }
                Err(e) => {
                    health.mark_error(name, &format!("{e:#}"));
                    tracing::error!("Daemon component '{name}' failed: {e:#}");
                }
            }

            health.bump_restart(name);
            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                health.mark_stopped(name);
                return;
            }
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use tempfile::TempDir;

    #[test]
    fn state_file_lives_in_data_dir() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_from(tmp.path()).unwrap();
        assert_eq!(state_file_path(&config), tmp.path().join("daemon_state.json"));
    }

    #[tokio::test]
    async fn supervisor_marks_error_and_restart_on_failure() {
        let health = Arc::new(HealthRegistry::new());
        let (_tx, rx) = watch::channel(false);
        let handle = spawn_component_supervisor("test-fail", health.clone(), rx, 1, 1, || async {
            anyhow::bail!("boom")
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        let _ = handle.await;

        let component = health.component("test-fail").unwrap();
        assert_eq!(component.status, ComponentStatus::Error);
        assert!(component.restart_count >= 1);
        assert!(component.last_error.unwrap_or_default().contains("boom"));
    }

    #[tokio::test]
    async fn supervisor_marks_unexpected_exit_as_error() {
        let health = Arc::new(HealthRegistry::new());
        let (_tx, rx) = watch::channel(false);
        let handle = spawn_component_supervisor("test-exit", health.clone(), rx, 1, 1, || async { Ok(()) });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        let _ = handle.await;

        let component = health.component("test-exit").unwrap();
        assert_eq!(component.status, ComponentStatus::Error);
        assert!(
            component
                .last_error
                .unwrap_or_default()
                .contains("component exited unexpectedly")
        );
    }

    #[tokio::test]
    async fn supervisor_stops_on_shutdown() {
        let health = Arc::new(HealthRegistry::new());
        let (tx, rx) = watch::channel(false);
        let component_rx = rx.clone();
        let handle = spawn_component_supervisor("test-stop", health.clone(), rx, 1, 1, move || {
            let mut rx = component_rx.clone();
            async move {
                let _ = rx.wait_for(|stop| *stop).await;
                Ok(())
            }
        });

        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(health.component("test-stop").unwrap().status, ComponentStatus::Stopped);
    }

    #[tokio::test]
    async fn state_writer_flushes_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("daemon_state.json");
        let health = Arc::new(HealthRegistry::new());
        health.mark_ok("eventsub");
        let (tx, rx) = watch::channel(false);

        let handle = spawn_state_writer(path.clone(), health, rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["components"]["eventsub"]["status"], "ok");
        assert!(json["written_at"].is_string());
    }
}
