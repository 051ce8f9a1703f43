//! EventSub WebSocket frames.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::redemption::RedemptionEvent;

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub message_id: String,
    pub message_type: String,
    #[serde(default)]
    pub message_timestamp: Option<String>,
    #[serde(default)]
    pub subscription_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawFrame {
    metadata: Metadata,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub reconnect_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub broadcaster_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub condition: Condition,
}

#[derive(Debug, Clone, Deserialize)]
struct Reward {
    id: String,
    title: String,
    #[serde(default)]
    cost: u64,
}

/// `channel.channel_points_custom_reward_redemption.add` event body.
#[derive(Debug, Clone, Deserialize)]
struct RedemptionPayload {
    broadcaster_user_login: String,
    user_login: String,
    #[serde(default)]
    user_input: String,
    reward: Reward,
}

impl From<RedemptionPayload> for RedemptionEvent {
    fn from(raw: RedemptionPayload) -> Self {
        Self {
            channel: raw.broadcaster_user_login.to_lowercase(),
            redeemer: raw.user_login.to_lowercase(),
            user_input: raw.user_input,
            reward_id: raw.reward.id,
            reward_title: raw.reward.title,
            reward_cost: raw.reward.cost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Welcome(Session),
    Keepalive,
    Notification {
        subscription: SubscriptionRef,
        event: serde_json::Value,
    },
    Reconnect(Session),
    Revocation(SubscriptionRef),
    /// A message type this client does not know.
    Other(String),
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    session: Session,
}

#[derive(Debug, Deserialize)]
struct NotificationPayload {
    subscription: SubscriptionRef,
    #[serde(default)]
    event: serde_json::Value,
}

fn payload<T: serde::de::DeserializeOwned>(value: serde_json::Value, what: &str) -> Result<T> {
    serde_json::from_value(value).with_context(|| format!("Malformed {what} payload"))
}

/// Decode one text frame.
pub fn parse_frame(text: &str) -> Result<(Metadata, ServerMessage)> {
    let raw: RawFrame = serde_json::from_str(text).context("Malformed EventSub frame")?;
    let message = match raw.metadata.message_type.as_str() {
        "session_welcome" => {
            ServerMessage::Welcome(payload::<SessionPayload>(raw.payload, "welcome")?.session)
        }
        "session_keepalive" => ServerMessage::Keepalive,
        "session_reconnect" => {
            ServerMessage::Reconnect(payload::<SessionPayload>(raw.payload, "reconnect")?.session)
        }
        "notification" => {
            let body: NotificationPayload = payload(raw.payload, "notification")?;
            ServerMessage::Notification {
                subscription: body.subscription,
                event: body.event,
            }
        }
        "revocation" => {
            ServerMessage::Revocation(payload::<NotificationPayload>(raw.payload, "revocation")?.subscription)
        }
        other => ServerMessage::Other(other.to_string()),
    };
    Ok((raw.metadata, message))
}

/// Read a redemption out of a notification's `event` object.
pub fn redemption_event(event: serde_json::Value) -> Result<RedemptionEvent> {
    let raw: RedemptionPayload = payload(event, "redemption")?;
    Ok(raw.into())
}
