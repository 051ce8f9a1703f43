#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};

use chatfleet::auth::{self, RenewalService};
use chatfleet::commands::{ControlPlane, OperatorCommand, Requester};
use chatfleet::config::Config;
use chatfleet::fleet::{FleetManager, Pm2Supervisor};
use chatfleet::notify::create_notifier;
use chatfleet::platform::{HelixClient, PlatformApi};
use chatfleet::store::{ChannelConfigStore, CredentialStore};
use chatfleet::util::normalize_channel;

/// `chatfleet` - control plane for a fleet of per-channel chat bots.
#[derive(Parser, Debug)]
#[command(name = "chatfleet")]
#[command(version)]
#[command(about = "Run and manage a fleet of per-channel chat bot workers.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the long-lived daemon (renewal, bot token monitor, EventSub)
    Daemon,

    /// Enroll a channel, or restart its worker if it is already running
    Enroll {
        channel: String,
    },

    /// Stop and remove a channel's worker (settings are kept)
    Unenroll {
        channel: String,
    },

    /// Show fleet status
    Status,

    /// Move workers to the current script template
    Migrate {
        /// Single channel to migrate; omit to migrate the whole fleet
        channel: Option<String>,

        /// Channels per batch when migrating the whole fleet
        #[arg(long)]
        batch: Option<usize>,
    },

    /// Restore workers' pre-migration scripts
    Rollback {
        channel: Option<String>,

        /// Roll back every worker that has a backup
        #[arg(long, conflicts_with = "channel")]
        all: bool,
    },

    /// Regenerate every script and the supervisor manifest, then reload
    Redeploy,

    /// Run one credential renewal sweep now
    Renew,

    /// Manage stored OAuth credentials
    Credentials {
        #[command(subcommand)]
        credential_command: CredentialCommands,
    },

    /// Run a chat-style `!fleet ...` command as a given user
    Fleet {
        /// Full command text, e.g. "!fleet enable redemption"
        text: String,

        /// Login of the user issuing the command
        #[arg(long = "as")]
        requester: String,

        /// Treat the requester as a moderator
        #[arg(long)]
        moderator: bool,

        /// Channel the message was said in; enables chat command dispatch
        #[arg(long)]
        channel: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum CredentialCommands {
    /// Show token status for one channel or a fleet sample
    Status { channel: Option<String> },

    /// Store a channel owner's token pair after authorization
    Import {
        channel: String,

        #[arg(long)]
        access_token: String,

        #[arg(long)]
        refresh_token: Option<String>,
    },

    /// Store the bot-wide token
    ImportBot { access_token: String },

    /// Revoke and delete a channel's owner token (switches redemptions off)
    Revoke { channel: String },
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Warning: failed to install log subscriber: {e}");
    }
}

struct Operator {
    credentials: Arc<CredentialStore>,
    api: Arc<dyn PlatformApi>,
    plane: ControlPlane,
    _shutdown: Arc<watch::Sender<bool>>,
}

/// Stores, client and control plane for one CLI invocation. Ctrl-C flips
/// the shutdown signal so batch operations stop between units of work.
fn build_context(config: &Config) -> Result<Operator> {
    let channels = Arc::new(ChannelConfigStore::new(config.channels_dir(), config.locks_dir()));
    let credentials = Arc::new(CredentialStore::new(config.credentials_dir(), Arc::clone(&channels)));
    let api: Arc<dyn PlatformApi> = Arc::new(HelixClient::new(&config.platform, &config.reliability)?);
    let notifier = create_notifier(&config.notifications);
    let supervisor = Arc::new(Pm2Supervisor::new(
        &config.fleet.supervisor_bin,
        std::time::Duration::from_secs(config.fleet.supervisor_timeout_secs),
    ));
    let fleet = Arc::new(FleetManager::new(config, channels, supervisor));
    let renewal = Arc::new(RenewalService::new(
        Arc::clone(&api),
        Arc::clone(&credentials),
        Arc::clone(&notifier),
        config.renewal.refresh_threshold(),
        config.renewal.remediation_url.clone(),
    ));

    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    {
        let tx = Arc::clone(&tx);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received; stopping after the current step");
                let _ = tx.send(true);
            }
        });
    }

    let plane = ControlPlane::new(config, fleet, Arc::clone(&credentials), notifier, rx)?.with_renewal(renewal);
    Ok(Operator {
        credentials,
        api,
        plane,
        _shutdown: tx,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();
    let config = Config::load_or_init().context("Failed to load configuration")?;
    init_tracing(&config);

    let ctx = build_context(&config)?;
    let reply = match cli.command {
        Commands::Daemon => {
            drop(ctx);
            return chatfleet::daemon::run(config).await;
        }
        Commands::Enroll { channel } => {
            ctx.plane
                .run_trusted(OperatorCommand::Enroll {
                    channel: normalize_channel(&channel),
                })
                .await
        }
        Commands::Unenroll { channel } => {
            ctx.plane
                .run_trusted(OperatorCommand::Unenroll {
                    channel: normalize_channel(&channel),
                })
                .await
        }
        Commands::Status => ctx.plane.run_trusted(OperatorCommand::Status).await,
        Commands::Migrate { channel, batch } => {
            let command = match channel {
                Some(channel) => OperatorCommand::Migrate {
                    channel: normalize_channel(&channel),
                },
                None => OperatorCommand::MigrateBatch { batch_size: batch },
            };
            ctx.plane.run_trusted(command).await
        }
        Commands::Rollback { channel, all } => {
            let command = match (channel, all) {
                (_, true) => OperatorCommand::RollbackAll,
                (Some(channel), false) => OperatorCommand::Rollback {
                    channel: normalize_channel(&channel),
                },
                (None, false) => bail!("Give a channel or --all"),
            };
            ctx.plane.run_trusted(command).await
        }
        Commands::Redeploy => ctx.plane.run_trusted(OperatorCommand::Redeploy).await,
        Commands::Renew => ctx.plane.run_trusted(OperatorCommand::Renew).await,
        Commands::Credentials { credential_command } => match credential_command {
            CredentialCommands::Status { channel } => {
                let now = Utc::now();
                match channel {
                    Some(channel) => {
                        auth::status::describe_channel(&ctx.credentials, &normalize_channel(&channel), now)?
                    }
                    None => auth::status::fleet_sample(&ctx.credentials, usize::MAX, now)?,
                }
            }
            CredentialCommands::Import {
                channel,
                access_token,
                refresh_token,
            } => {
                let channel = normalize_channel(&channel);
                let stored = auth::import_channel_credential(
                    ctx.api.as_ref(),
                    &ctx.credentials,
                    &channel,
                    &access_token,
                    refresh_token.as_deref(),
                )
                .await?;
                format!("✅ Stored token for #{} (v{})", stored.channel, stored.version)
            }
            CredentialCommands::ImportBot { access_token } => {
                let stored = auth::import_bot_credential(ctx.api.as_ref(), &ctx.credentials, &access_token).await?;
                format!(
                    "✅ Stored bot token for {}",
                    stored.login.as_deref().unwrap_or("(unknown login)")
                )
            }
            CredentialCommands::Revoke { channel } => {
                let channel = normalize_channel(&channel);
                if auth::revoke_channel_credential(ctx.api.as_ref(), &ctx.credentials, &channel).await? {
                    format!("🗑️ Revoked #{channel}'s token; redemptions are off.")
                } else {
                    format!("#{channel} had no stored token.")
                }
            }
        },
        Commands::Fleet {
            text,
            requester,
            moderator,
            channel,
        } => {
            let requester = Requester::new(&requester, moderator);
            let reply = match channel {
                Some(channel) => {
                    ctx.plane
                        .handle_chat(&normalize_channel(&channel), &requester, &text)
                        .await?
                }
                None => ctx.plane.handle(&text, &requester).await,
            };
            reply.unwrap_or_default()
        }
    };

    if !reply.is_empty() {
        println!("{reply}");
    }
    Ok(())
}
