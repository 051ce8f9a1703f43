//! Chat-facing command handling: the fixed chat command registry and the
//! `!fleet` operator surface.

pub mod operator;
pub mod registry;

pub use operator::{CommandParseError, Feature, OperatorCommand, Requester};
pub use registry::{CommandContext, CommandHandler, CommandRegistry};

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;

use crate::auth::RenewalService;
use crate::auth::status::{describe_channel, fleet_sample};
use crate::config::Config;
use crate::fleet::{EnrollOutcome, FleetManager, LifecycleError};
use crate::notify::{Notification, Notifier, Urgency, notify_detached};
use crate::store::{ChannelConfig, CredentialStore};

/// Executes operator commands against the fleet and the stores.
pub struct ControlPlane {
    fleet: Arc<FleetManager>,
    credentials: Arc<CredentialStore>,
    notifier: Arc<dyn Notifier>,
    renewal: Option<Arc<RenewalService>>,
    registry: CommandRegistry,
    bot_owner: String,
    batch_size: usize,
    sample_size: usize,
    shutdown: watch::Receiver<bool>,
}

impl ControlPlane {
    pub fn new(
        config: &Config,
        fleet: Arc<FleetManager>,
        credentials: Arc<CredentialStore>,
        notifier: Arc<dyn Notifier>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        Ok(Self {
            fleet,
            credentials,
            notifier,
            renewal: None,
            registry: CommandRegistry::builtin()?,
            bot_owner: config.platform.bot_owner.to_lowercase(),
            batch_size: config.fleet.batch_size,
            sample_size: config.renewal.status_sample_size,
            shutdown,
        })
    }

    #[must_use]
    pub fn with_renewal(mut self, renewal: Arc<RenewalService>) -> Self {
        self.renewal = Some(renewal);
        self
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Handle a `!fleet` command. `None` means the text was not one.
    pub async fn handle(&self, text: &str, requester: &Requester) -> Option<String> {
        let command = match operator::parse(text, &requester.login) {
            Ok(Some(command)) => command,
            Ok(None) => return None,
            Err(e) => return Some(e.to_string()),
        };
        if let Err(refusal) = operator::authorize(&command, requester, &self.bot_owner) {
            tracing::info!(requester = %requester.login, ?command, "Operator command refused");
            return Some(refusal);
        }
        tracing::info!(requester = %requester.login, ?command, "Operator command");
        Some(match self.execute(command, requester).await {
            Ok(reply) => reply,
            Err(e) => self.describe_failure(&e),
        })
    }

    /// Run a command for the local operator, who is trusted and skips
    /// permission checks.
    pub async fn run_trusted(&self, command: OperatorCommand) -> String {
        let login = if self.bot_owner.is_empty() {
            "operator"
        } else {
            self.bot_owner.as_str()
        };
        let operator = Requester::new(login, true);
        tracing::info!(?command, "Local operator command");
        match self.execute(command, &operator).await {
            Ok(reply) => reply,
            Err(e) => self.describe_failure(&e),
        }
    }

    /// Handle any chat line said in `channel`: operator commands first, then
    /// the channel's chat commands.
    pub async fn handle_chat(
        &self,
        channel: &str,
        requester: &Requester,
        text: &str,
    ) -> Result<Option<String>> {
        if let Some(reply) = self.handle(text, requester).await {
            return Ok(Some(reply));
        }
        let config = self
            .credentials
            .channels()
            .load_or(channel, ChannelConfig::with_defaults(channel))?;
        Ok(self
            .registry
            .dispatch(&config, &requester.login, text, requester.is_moderator))
    }

    fn describe_failure(&self, error: &LifecycleError) -> String {
        match error {
            LifecycleError::Internal(e) => {
                tracing::error!("Operator command failed: {e:#}");
                format!("⚠️ Failed: {e:#}")
            }
            other => format!("⚠️ {other}"),
        }
    }

    async fn execute(&self, command: OperatorCommand, requester: &Requester) -> Result<String, LifecycleError> {
        let channels = self.credentials.channels();
        match command {
            OperatorCommand::Enroll { channel } => {
                let outcome = self.fleet.enroll(&channel, &requester.login).await?;
                if let EnrollOutcome::AtCapacity { ceiling } = outcome {
                    notify_detached(
                        &self.notifier,
                        Notification {
                            urgency: Urgency::Warning,
                            title: "Fleet at capacity".into(),
                            body: format!(
                                "{} asked to enroll #{channel} but all {ceiling} worker slots are in use.",
                                requester.login
                            ),
                            remediation_url: None,
                        },
                    );
                }
                Ok(outcome.message(&channel))
            }
            OperatorCommand::Unenroll { channel } => {
                Ok(if self.fleet.unenroll(&channel, &requester.login).await? {
                    format!("👋 Left #{channel}. Its settings are kept for next time.")
                } else {
                    format!("#{channel} is not enrolled.")
                })
            }
            OperatorCommand::Status => Ok(self.fleet.status().await?.summary()),
            OperatorCommand::Redeploy => {
                let count = self.fleet.redeploy_all().await?;
                Ok(format!("✅ Redeployed {count} workers."))
            }
            OperatorCommand::Migrate { channel } => {
                self.fleet.migrate_one(&channel).await?;
                Ok(format!("✅ #{channel} is running the current template."))
            }
            OperatorCommand::MigrateBatch { batch_size } => {
                let batch_size = batch_size.unwrap_or(self.batch_size);
                let report = self
                    .fleet
                    .migrate_batch(batch_size, self.shutdown.clone(), |progress| {
                        tracing::info!(
                            batch = progress.batch,
                            batches = progress.batches,
                            migrated = progress.migrated,
                            failed = progress.failed,
                            "Migration progress"
                        );
                    })
                    .await?;
                Ok(report.summary("Migrated"))
            }
            OperatorCommand::Rollback { channel } => {
                self.fleet.rollback_one(&channel).await?;
                Ok(format!("↩️ #{channel} rolled back to its previous script."))
            }
            OperatorCommand::RollbackAll => Ok(self.fleet.rollback_all().await?.summary("Rolled back")),
            OperatorCommand::SetFeature {
                feature,
                channel,
                enabled,
            } => {
                if feature == Feature::Redemption
                    && enabled
                    && self.credentials.channel_credential(&channel)?.is_none()
                {
                    return Err(LifecycleError::Refused(format!(
                        "#{channel} needs to authorize the bot before redemptions can be enabled."
                    )));
                }
                channels
                    .update(&channel, |c| match feature {
                        Feature::Moderation => c.moderation_enabled = enabled,
                        Feature::Redemption => c.redemption_enabled = enabled,
                    })
                    .await?;
                let state = if enabled { "enabled" } else { "disabled" };
                Ok(format!("✅ {} {state} for #{channel}.", feature.label()))
            }
            OperatorCommand::ExcludeCommand { command, channel } => {
                if !self.registry.contains(&command) {
                    return Err(LifecycleError::Refused(format!("There is no !{command} command.")));
                }
                channels
                    .update(&channel, |c| {
                        if !c.is_command_excluded(&command) {
                            c.excluded_commands.push(command.clone());
                        }
                    })
                    .await?;
                Ok(format!("✅ !{command} is now off in #{channel}."))
            }
            OperatorCommand::IncludeCommand { command, channel } => {
                channels
                    .update(&channel, |c| {
                        c.excluded_commands.retain(|c| !c.eq_ignore_ascii_case(&command));
                    })
                    .await?;
                Ok(format!("✅ !{command} is now on in #{channel}."))
            }
            OperatorCommand::Tokens { channel } => {
                let now = Utc::now();
                Ok(match channel {
                    Some(channel) => describe_channel(&self.credentials, &channel, now)?,
                    None => fleet_sample(&self.credentials, self.sample_size, now)?,
                })
            }
            OperatorCommand::Renew => match &self.renewal {
                Some(renewal) => Ok(format!(
                    "Renewal sweep: {}",
                    renewal.sweep(&self.shutdown).await?.summary()
                )),
                None => Ok("Tokens renew automatically; no manual sweep is available here.".into()),
            },
            OperatorCommand::Help => Ok(operator::HELP.to_string()),
        }
    }
}
