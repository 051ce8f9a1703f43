//! Validation and permission policy for timeout redemptions. Pure: no IO.

use rand::Rng;

use super::classify::{is_timeout_redemption, sanitize_target};
use crate::moderation::TimeoutRequest;
use crate::platform::is_valid_login;
use crate::store::ChannelConfig;

/// Longest timeout the platform accepts (two weeks).
pub const MAX_TIMEOUT_SECS: u64 = 1_209_600;

const BOT_REFUSALS: [&str; 5] = [
    "nice try, but I'm not timing myself out.",
    "I don't think so. Points well spent though.",
    "the bot is immune. Better luck next time!",
    "error 418: I'm a teapot, and teapots can't be timed out.",
    "you thought. The bot stays.",
];

/// A reward redemption pushed by the platform. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionEvent {
    pub channel: String,
    pub redeemer: String,
    pub user_input: String,
    pub reward_id: String,
    pub reward_title: String,
    pub reward_cost: u64,
}

/// Fleet-wide settings the policy needs alongside the channel record.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub bot_login: &'a str,
    pub bot_owner: &'a str,
    pub test_mode: bool,
    pub test_allow_list: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionOutcome {
    /// Not ours to handle; logged and dropped.
    Ignored { reason: &'static str },
    /// Refused; `reply` goes to chat.
    Rejected { reply: String },
    Timeout {
        request: TimeoutRequest,
        announcement: String,
    },
}

fn may_redeem_in_test_mode(event: &RedemptionEvent, ctx: &PolicyContext<'_>, config: &ChannelConfig) -> bool {
    let who = event.redeemer.as_str();
    who == event.channel
        || who.eq_ignore_ascii_case(ctx.bot_owner)
        || ctx.test_allow_list.iter().any(|u| u.eq_ignore_ascii_case(who))
        || config.is_special_user(who)
}

fn bot_refusal() -> &'static str {
    let mut rng = rand::rng();
    let index = rng.next_u32() as usize % BOT_REFUSALS.len();
    BOT_REFUSALS[index]
}

/// Run the redemption checks in order; the first failing check decides.
pub fn evaluate(event: &RedemptionEvent, config: &ChannelConfig, ctx: &PolicyContext<'_>) -> RedemptionOutcome {
    if !is_timeout_redemption(&event.reward_title) {
        return RedemptionOutcome::Ignored {
            reason: "reward title is not a timeout reward",
        };
    }

    if let Some(reward_id) = config.redemption_reward_id.as_deref().filter(|id| !id.is_empty()) {
        if reward_id != event.reward_id {
            return RedemptionOutcome::Ignored {
                reason: "reward is not the channel's configured timeout reward",
            };
        }
    }

    let redeemer = event.redeemer.as_str();
    let Some(target) = sanitize_target(&event.user_input).filter(|t| is_valid_login(t)) else {
        return RedemptionOutcome::Rejected {
            reply: format!(
                "@{redeemer}, '{}' is not a valid username. Put only the username in the message.",
                crate::util::truncate_with_ellipsis(event.user_input.trim(), 40)
            ),
        };
    };

    if ctx.test_mode && !may_redeem_in_test_mode(event, ctx, config) {
        return RedemptionOutcome::Rejected {
            reply: format!(
                "@{redeemer}, timeout redemptions are in test mode right now. Ask a mod to refund your points."
            ),
        };
    }

    // Without a known bot login the bot cannot be protected, so nothing runs.
    if ctx.bot_login.is_empty() {
        return RedemptionOutcome::Rejected {
            reply: format!("@{redeemer}, timeout redemptions are unavailable right now. Ask a mod to refund your points."),
        };
    }

    if target.eq_ignore_ascii_case(ctx.bot_login) {
        return RedemptionOutcome::Rejected {
            reply: format!("@{redeemer}, {}", bot_refusal()),
        };
    }

    if target == event.channel {
        return RedemptionOutcome::Rejected {
            reply: format!("@{redeemer}, the broadcaster can't be timed out."),
        };
    }

    let duration_secs = config.redemption_timeout_secs.clamp(1, MAX_TIMEOUT_SECS);
    let announcement = if target == redeemer {
        format!("{redeemer} spent {} points to time themselves out for {duration_secs}s.", event.reward_cost)
    } else {
        format!(
            "{redeemer} spent {} points to time out {target} for {duration_secs}s!",
            event.reward_cost
        )
    };

    RedemptionOutcome::Timeout {
        request: TimeoutRequest {
            channel: event.channel.clone(),
            target,
            requester: redeemer.to_string(),
            duration_secs,
            reason: format!("Channel points redemption by {redeemer}"),
        },
        announcement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_ALLOW_LIST: &[String] = &[];

    fn ctx(test_mode: bool) -> PolicyContext<'static> {
        PolicyContext {
            bot_login: "fleetbot",
            bot_owner: "operator",
            test_mode,
            test_allow_list: NO_ALLOW_LIST,
        }
    }

    fn event(redeemer: &str, input: &str) -> RedemptionEvent {
        RedemptionEvent {
            channel: "alice".into(),
            redeemer: redeemer.into(),
            user_input: input.into(),
            reward_id: "reward-1".into(),
            reward_title: "Timeout a viewer".into(),
            reward_cost: 500,
        }
    }

    fn config() -> ChannelConfig {
        let mut cfg = ChannelConfig::with_defaults("alice");
        cfg.redemption_enabled = true;
        cfg
    }

    fn assert_rejected(outcome: &RedemptionOutcome) -> &str {
        match outcome {
            RedemptionOutcome::Rejected { reply } => reply,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn normal_mode_produces_timeout() {
        let outcome = evaluate(&event("viewer", "@Troll"), &config(), &ctx(false));
        let RedemptionOutcome::Timeout { request, .. } = outcome else {
            panic!("expected timeout");
        };
        assert_eq!(request.target, "troll");
        assert_eq!(request.requester, "viewer");
        assert_eq!(request.duration_secs, 60);
    }

    #[test]
    fn test_mode_refuses_ordinary_viewer() {
        let outcome = evaluate(&event("viewer", "troll"), &config(), &ctx(true));
        assert!(assert_rejected(&outcome).contains("refund"));
    }

    #[test]
    fn test_mode_admits_broadcaster_owner_and_special_users() {
        let mut cfg = config();
        cfg.special_users = vec!["trusted".into()];
        for who in ["alice", "operator", "trusted"] {
            let outcome = evaluate(&event(who, "troll"), &cfg, &ctx(true));
            assert!(matches!(outcome, RedemptionOutcome::Timeout { .. }), "{who}");
        }
    }

    #[test]
    fn self_timeout_is_allowed() {
        let outcome = evaluate(&event("viewer", "viewer"), &config(), &ctx(false));
        let RedemptionOutcome::Timeout { request, announcement } = outcome else {
            panic!("expected timeout");
        };
        assert_eq!(request.target, "viewer");
        assert!(announcement.contains("themselves"));
    }

    #[test]
    fn bot_and_broadcaster_are_protected() {
        let bot = evaluate(&event("viewer", "FleetBot"), &config(), &ctx(false));
        let reply = assert_rejected(&bot);
        assert!(BOT_REFUSALS.iter().any(|r| reply.ends_with(r)));

        let broadcaster = evaluate(&event("viewer", "alice"), &config(), &ctx(false));
        assert!(assert_rejected(&broadcaster).contains("broadcaster"));
    }

    #[test]
    fn unknown_bot_login_refuses_every_target() {
        let blind = PolicyContext {
            bot_login: "",
            ..ctx(false)
        };
        for target in ["fleetbot", "troll"] {
            let outcome = evaluate(&event("viewer", target), &config(), &blind);
            assert!(assert_rejected(&outcome).contains("unavailable"), "{target}");
        }
    }

    #[test]
    fn invalid_username_is_rejected_with_message() {
        let outcome = evaluate(&event("viewer", "not-a-user!!"), &config(), &ctx(false));
        assert!(assert_rejected(&outcome).contains("not a valid username"));
    }

    #[test]
    fn other_rewards_and_titles_are_ignored() {
        let mut cfg = config();
        cfg.redemption_reward_id = Some("reward-2".into());
        let outcome = evaluate(&event("viewer", "troll"), &cfg, &ctx(false));
        assert!(matches!(outcome, RedemptionOutcome::Ignored { .. }));

        let mut song = event("viewer", "troll");
        song.reward_title = "Play a Song".into();
        assert!(matches!(
            evaluate(&song, &config(), &ctx(false)),
            RedemptionOutcome::Ignored { .. }
        ));
    }

    #[test]
    fn duration_is_clamped_to_platform_limit() {
        let mut cfg = config();
        cfg.redemption_timeout_secs = 10 * MAX_TIMEOUT_SECS;
        let RedemptionOutcome::Timeout { request, .. } = evaluate(&event("viewer", "troll"), &cfg, &ctx(false))
        else {
            panic!("expected timeout");
        };
        assert_eq!(request.duration_secs, MAX_TIMEOUT_SECS);
    }
}
