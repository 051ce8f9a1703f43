//! `!fleet ...` operator commands: parsing and permission gating.

use thiserror::Error;

use super::registry::is_valid_command_name;
use crate::platform::is_valid_login;
use crate::util::normalize_channel;

pub const COMMAND_PREFIX: &str = "!fleet";
pub const MAX_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Moderation,
    Redemption,
}

impl Feature {
    pub fn label(self) -> &'static str {
        match self {
            Self::Moderation => "moderation",
            Self::Redemption => "redemptions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Enroll { channel: String },
    Unenroll { channel: String },
    Status,
    Redeploy,
    Migrate { channel: String },
    /// `None` uses the configured batch size.
    MigrateBatch { batch_size: Option<usize> },
    Rollback { channel: String },
    RollbackAll,
    SetFeature {
        feature: Feature,
        channel: String,
        enabled: bool,
    },
    ExcludeCommand { command: String, channel: String },
    IncludeCommand { command: String, channel: String },
    /// `None` samples the whole fleet.
    Tokens { channel: Option<String> },
    Renew,
    Help,
}

/// Who may run a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Anyone,
    /// Bot owner, moderators, or the channel's own broadcaster.
    Channel(&'a str),
    /// Bot owner or moderators.
    Fleet,
}

impl OperatorCommand {
    pub fn scope(&self) -> Scope<'_> {
        match self {
            Self::Status | Self::Help => Scope::Anyone,
            Self::Enroll { channel }
            | Self::Unenroll { channel }
            | Self::Migrate { channel }
            | Self::Rollback { channel }
            | Self::SetFeature { channel, .. }
            | Self::ExcludeCommand { channel, .. }
            | Self::IncludeCommand { channel, .. }
            | Self::Tokens {
                channel: Some(channel),
            } => Scope::Channel(channel),
            Self::Redeploy
            | Self::MigrateBatch { .. }
            | Self::RollbackAll
            | Self::Renew
            | Self::Tokens { channel: None } => Scope::Fleet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("Usage: !fleet <command>. Try !fleet help.")]
    MissingVerb,
    #[error("Unknown command '{0}'. Try !fleet help.")]
    UnknownVerb(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("'{0}' is not a valid channel name")]
    InvalidChannel(String),
    #[error("'{0}' is not a valid command name")]
    InvalidCommandName(String),
    #[error("Batch size must be a number from 1 to {MAX_BATCH_SIZE}, got '{0}'")]
    InvalidBatchSize(String),
}

pub const HELP: &str = "!fleet enroll|unenroll [channel] · status · redeploy · \
migrate <channel>|batch [n] · rollback <channel>|all · \
enable|disable moderation|redemption [channel] · exclude|include <command> [channel] · \
tokens [channel] · renew";

/// The person issuing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub login: String,
    pub is_moderator: bool,
}

impl Requester {
    pub fn new(login: &str, is_moderator: bool) -> Self {
        Self {
            login: normalize_channel(login),
            is_moderator,
        }
    }
}

fn channel_arg(raw: Option<&str>, default: &str) -> Result<String, CommandParseError> {
    let channel = normalize_channel(raw.unwrap_or(default));
    if is_valid_login(&channel) {
        Ok(channel)
    } else {
        Err(CommandParseError::InvalidChannel(channel))
    }
}

fn required_channel(raw: Option<&str>, usage: &'static str) -> Result<String, CommandParseError> {
    let raw = raw.ok_or(CommandParseError::Usage(usage))?;
    channel_arg(Some(raw), raw)
}

fn command_arg(raw: Option<&str>, usage: &'static str) -> Result<String, CommandParseError> {
    let name = raw
        .ok_or(CommandParseError::Usage(usage))?
        .trim_start_matches('!')
        .to_lowercase();
    if is_valid_command_name(&name) {
        Ok(name)
    } else {
        Err(CommandParseError::InvalidCommandName(name))
    }
}

/// Parse `text` as an operator command. Returns `Ok(None)` when the text is
/// not addressed to the fleet at all. Omitted channel arguments default to
/// the requester's own channel.
pub fn parse(text: &str, requester: &str) -> Result<Option<OperatorCommand>, CommandParseError> {
    let mut words = text.split_whitespace();
    match words.next() {
        Some(first) if first.eq_ignore_ascii_case(COMMAND_PREFIX) => {}
        _ => return Ok(None),
    }
    let verb = words.next().ok_or(CommandParseError::MissingVerb)?.to_lowercase();
    let first = words.next();
    let second = words.next();

    let command = match verb.as_str() {
        "enroll" | "join" => OperatorCommand::Enroll {
            channel: channel_arg(first, requester)?,
        },
        "unenroll" | "leave" => OperatorCommand::Unenroll {
            channel: channel_arg(first, requester)?,
        },
        "status" => OperatorCommand::Status,
        "redeploy" => OperatorCommand::Redeploy,
        "migrate" => match first {
            Some(arg) if arg.eq_ignore_ascii_case("batch") => {
                let batch_size = second
                    .map(|n| {
                        n.parse::<usize>()
                            .ok()
                            .filter(|n| (1..=MAX_BATCH_SIZE).contains(n))
                            .ok_or_else(|| CommandParseError::InvalidBatchSize(n.to_string()))
                    })
                    .transpose()?;
                OperatorCommand::MigrateBatch { batch_size }
            }
            other => OperatorCommand::Migrate {
                channel: required_channel(other, "!fleet migrate <channel> | !fleet migrate batch [n]")?,
            },
        },
        "rollback" => match first {
            Some(arg) if arg.eq_ignore_ascii_case("all") => OperatorCommand::RollbackAll,
            other => OperatorCommand::Rollback {
                channel: required_channel(other, "!fleet rollback <channel> | !fleet rollback all")?,
            },
        },
        "enable" | "disable" => {
            const USAGE: &str = "!fleet enable|disable moderation|redemption [channel]";
            let feature = match first.map(str::to_lowercase).as_deref() {
                Some("moderation" | "mod") => Feature::Moderation,
                Some("redemption" | "redemptions") => Feature::Redemption,
                _ => return Err(CommandParseError::Usage(USAGE)),
            };
            OperatorCommand::SetFeature {
                feature,
                channel: channel_arg(second, requester)?,
                enabled: verb == "enable",
            }
        }
        "exclude" => OperatorCommand::ExcludeCommand {
            command: command_arg(first, "!fleet exclude <command> [channel]")?,
            channel: channel_arg(second, requester)?,
        },
        "include" => OperatorCommand::IncludeCommand {
            command: command_arg(first, "!fleet include <command> [channel]")?,
            channel: channel_arg(second, requester)?,
        },
        "tokens" => OperatorCommand::Tokens {
            channel: first.map(|c| channel_arg(Some(c), c)).transpose()?,
        },
        "renew" => OperatorCommand::Renew,
        "help" => OperatorCommand::Help,
        other => return Err(CommandParseError::UnknownVerb(other.to_string())),
    };
    Ok(Some(command))
}

/// Check `requester` against the command's scope. The error is the reply.
pub fn authorize(command: &OperatorCommand, requester: &Requester, bot_owner: &str) -> Result<(), String> {
    let privileged = requester.is_moderator
        || (!bot_owner.is_empty() && requester.login.eq_ignore_ascii_case(bot_owner));
    match command.scope() {
        Scope::Anyone => Ok(()),
        Scope::Channel(channel) if privileged || requester.login == channel => Ok(()),
        Scope::Channel(channel) => Err(format!(
            "@{}, only #{channel}'s broadcaster or a moderator can do that.",
            requester.login
        )),
        Scope::Fleet if privileged => Ok(()),
        Scope::Fleet => Err(format!(
            "@{}, only the bot owner or a moderator can do that.",
            requester.login
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(text: &str) -> OperatorCommand {
        parse(text, "alice").unwrap().unwrap()
    }

    #[test]
    fn non_fleet_text_is_ignored() {
        assert_eq!(parse("hello there", "alice"), Ok(None));
        assert_eq!(parse("!fleetwood", "alice"), Ok(None));
    }

    #[test]
    fn channel_defaults_to_requester() {
        assert_eq!(parsed("!fleet enroll"), OperatorCommand::Enroll { channel: "alice".into() });
        assert_eq!(parsed("!FLEET join #Bob"), OperatorCommand::Enroll { channel: "bob".into() });
        assert_eq!(
            parsed("!fleet disable redemption"),
            OperatorCommand::SetFeature {
                feature: Feature::Redemption,
                channel: "alice".into(),
                enabled: false,
            }
        );
    }

    #[test]
    fn batch_and_all_forms() {
        assert_eq!(parsed("!fleet migrate batch"), OperatorCommand::MigrateBatch { batch_size: None });
        assert_eq!(parsed("!fleet migrate batch 3"), OperatorCommand::MigrateBatch { batch_size: Some(3) });
        assert_eq!(parsed("!fleet rollback all"), OperatorCommand::RollbackAll);
        assert_eq!(parsed("!fleet migrate carol"), OperatorCommand::Migrate { channel: "carol".into() });
        assert_eq!(parsed("!fleet tokens"), OperatorCommand::Tokens { channel: None });
    }

    #[test]
    fn malformed_input_gets_a_usage_message() {
        assert_eq!(parse("!fleet", "alice"), Err(CommandParseError::MissingVerb));
        assert_eq!(
            parse("!fleet dance", "alice"),
            Err(CommandParseError::UnknownVerb("dance".into()))
        );
        assert!(matches!(parse("!fleet migrate", "alice"), Err(CommandParseError::Usage(_))));
        assert_eq!(
            parse("!fleet migrate batch 0", "alice"),
            Err(CommandParseError::InvalidBatchSize("0".into()))
        );
        assert_eq!(
            parse("!fleet enroll bad-name!", "alice"),
            Err(CommandParseError::InvalidChannel("bad-name!".into()))
        );
        assert_eq!(
            parse("!fleet exclude Bad-Cmd", "alice"),
            Err(CommandParseError::InvalidCommandName("bad-cmd".into()))
        );
        assert!(parse("!fleet enable games", "alice").unwrap_err().to_string().starts_with("Usage:"));
    }

    #[test]
    fn broadcaster_controls_only_their_channel() {
        let alice = Requester::new("alice", false);
        assert!(authorize(&parsed("!fleet disable moderation"), &alice, "owner").is_ok());
        assert!(authorize(&parsed("!fleet disable moderation bob"), &alice, "owner").is_err());
        assert!(authorize(&parsed("!fleet redeploy"), &alice, "owner").is_err());
        assert!(authorize(&parsed("!fleet status"), &alice, "owner").is_ok());
    }

    #[test]
    fn owner_and_moderators_run_fleet_commands() {
        let owner = Requester::new("Owner", false);
        let moderator = Requester::new("mod_person", true);
        for requester in [&owner, &moderator] {
            assert!(authorize(&parsed("!fleet redeploy"), requester, "owner").is_ok());
            assert!(authorize(&parsed("!fleet enroll bob"), requester, "owner").is_ok());
        }
    }
}
