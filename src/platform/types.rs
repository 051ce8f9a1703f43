use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token introspection result.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Seconds left; `0` means the token does not expire.
    #[serde(default)]
    pub expires_in: u64,
}

impl TokenInfo {
    /// Remaining lifetime, `None` for non-expiring tokens.
    pub fn remaining(&self) -> Option<Duration> {
        (self.expires_in > 0).then(|| Duration::from_secs(self.expires_in))
    }
}

/// Result of a refresh-token or client-credentials exchange.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Vec<String>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformUser {
    pub id: String,
    pub login: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConduitInfo {
    pub id: String,
    pub shard_count: u32,
}

/// Event subscription routed through a conduit.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub condition: serde_json::Value,
    pub transport: SubscriptionTransport,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionTransport {
    pub method: String,
    pub conduit_id: String,
}

pub const REDEMPTION_ADD: &str = "channel.channel_points_custom_reward_redemption.add";

impl SubscriptionRequest {
    /// Reward-redemption notifications for one broadcaster.
    pub fn redemptions(broadcaster_id: &str, conduit_id: &str) -> Self {
        Self {
            kind: REDEMPTION_ADD.into(),
            version: "1".into(),
            condition: serde_json::json!({ "broadcaster_user_id": broadcaster_id }),
            transport: SubscriptionTransport {
                method: "conduit".into(),
                conduit_id: conduit_id.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub condition: serde_json::Value,
}

impl SubscriptionInfo {
    /// Whether this subscription is of `kind` and for `broadcaster_id`.
    pub fn matches(&self, kind: &str, broadcaster_id: &str) -> bool {
        self.kind == kind
            && self.condition.get("broadcaster_user_id").and_then(|v| v.as_str())
                == Some(broadcaster_id)
    }
}

/// Ban-with-duration issued under a user token.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutParams<'a> {
    pub broadcaster_id: &'a str,
    pub moderator_id: &'a str,
    pub user_id: &'a str,
    pub duration_secs: u64,
    pub reason: &'a str,
}
