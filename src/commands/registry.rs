use anyhow::{Result, bail};
use regex::Regex;
use std::sync::LazyLock;

use crate::store::ChannelConfig;

static COMMAND_NAME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[a-z0-9_]{1,32}$").unwrap()
});

/// Command names: lowercase ASCII letters, digits and underscore, 1–32 chars.
pub fn is_valid_command_name(name: &str) -> bool {
    COMMAND_NAME.is_match(name)
}

/// Everything a chat command sees about the message that triggered it.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub sender: &'a str,
    pub message: &'a str,
    /// Whitespace-separated words after the command name.
    pub args: &'a [&'a str],
    pub channel: &'a ChannelConfig,
    pub is_moderator: bool,
}

/// A stateless chat command.
pub trait CommandHandler: Send + Sync {
    /// Name without the leading `!`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Reply text, or `None` to stay silent.
    fn handle(&self, ctx: &CommandContext<'_>) -> Option<String>;
}

pub struct PingCommand;

impl CommandHandler for PingCommand {
    fn name(&self) -> &str {
        "ping"
    }

    fn description(&self) -> &str {
        "Check that the bot is alive"
    }

    fn handle(&self, ctx: &CommandContext<'_>) -> Option<String> {
        Some(format!("@{} pong", ctx.sender))
    }
}

pub struct LocationCommand;

impl CommandHandler for LocationCommand {
    fn name(&self) -> &str {
        "location"
    }

    fn description(&self) -> &str {
        "Where the broadcaster is based"
    }

    fn handle(&self, ctx: &CommandContext<'_>) -> Option<String> {
        let location = ctx.channel.location.as_deref()?.trim();
        if location.is_empty() {
            return None;
        }
        Some(format!("#{} streams from {location}", ctx.channel.channel))
    }
}

/// The fixed set of chat commands shipped with the bot.
pub fn builtin_handlers() -> Vec<Box<dyn CommandHandler>> {
    vec![Box::new(PingCommand), Box::new(LocationCommand)]
}

/// Name-indexed chat commands, built once at startup.
pub struct CommandRegistry {
    handlers: Vec<Box<dyn CommandHandler>>,
}

impl CommandRegistry {
    /// Build from a fixed list. Invalid or duplicate names are rejected.
    pub fn new(handlers: Vec<Box<dyn CommandHandler>>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for handler in &handlers {
            let name = handler.name();
            if !is_valid_command_name(name) {
                bail!("Invalid command name '{name}'");
            }
            if name == "commands" {
                bail!("'commands' is reserved for the command listing");
            }
            if !seen.insert(name.to_string()) {
                bail!("Duplicate command '{name}'");
            }
        }
        Ok(Self { handlers })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(builtin_handlers())
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        name == "commands" || self.handlers.iter().any(|h| h.name() == name)
    }

    fn find(&self, name: &str) -> Option<&dyn CommandHandler> {
        self.handlers
            .iter()
            .find(|h| h.name() == name)
            .map(AsRef::as_ref)
    }

    /// Run the command in `message` (`!name args...`) for a channel.
    ///
    /// Unknown, malformed and excluded commands produce no reply.
    pub fn dispatch(
        &self,
        channel: &ChannelConfig,
        sender: &str,
        message: &str,
        is_moderator: bool,
    ) -> Option<String> {
        let rest = message.trim().strip_prefix('!')?;
        let mut words = rest.split_whitespace();
        let name = words.next()?.to_lowercase();
        if !is_valid_command_name(&name) || channel.is_command_excluded(&name) {
            return None;
        }
        if name == "commands" {
            return Some(self.listing(channel));
        }
        let args: Vec<&str> = words.collect();
        let handler = self.find(&name)?;
        handler.handle(&CommandContext {
            sender,
            message,
            args: &args,
            channel,
            is_moderator,
        })
    }

    /// Commands available in `channel`, excluded ones left out.
    pub fn listing(&self, channel: &ChannelConfig) -> String {
        let names: Vec<String> = self
            .handlers
            .iter()
            .filter(|h| !channel.is_command_excluded(h.name()))
            .map(|h| format!("!{}", h.name()))
            .collect();
        if names.is_empty() {
            "No commands are enabled here.".into()
        } else {
            format!("Commands: {}", names.join(", "))
        }
    }
}
