use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, Stream, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::messages::{ServerMessage, Session, parse_frame, redemption_event};
use crate::conduit::ConduitManager;
use crate::platform::types::REDEMPTION_ADD;
use crate::redemption::{RedemptionDispatcher, RedemptionEvent};

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_KEEPALIVE_SECS: u64 = 10;
const SEEN_CAPACITY: NonZeroUsize = NonZeroUsize::MIN.saturating_add(1023);

/// What the session loop should do with one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inbound {
    Welcome(Session),
    Keepalive,
    Redemption(RedemptionEvent),
    Reconnect(String),
    Revoked {
        subscription_id: String,
        broadcaster_id: Option<String>,
        reason: String,
    },
    /// Already handled (the platform delivers at least once).
    Duplicate,
    Ignored,
}

/// Decode a text frame and drop repeats by message id.
pub(crate) fn classify(text: &str, seen: &mut LruCache<String, ()>) -> Result<Inbound> {
    let (metadata, message) = parse_frame(text)?;
    if matches!(message, ServerMessage::Notification { .. } | ServerMessage::Revocation(_))
        && seen.put(metadata.message_id.clone(), ()).is_some()
    {
        return Ok(Inbound::Duplicate);
    }

    Ok(match message {
        ServerMessage::Welcome(session) => Inbound::Welcome(session),
        ServerMessage::Keepalive => Inbound::Keepalive,
        ServerMessage::Notification {
            subscription,
            event,
        } if subscription.kind == REDEMPTION_ADD => Inbound::Redemption(redemption_event(event)?),
        ServerMessage::Notification { subscription, .. } => {
            tracing::debug!(kind = %subscription.kind, "Ignoring notification type");
            Inbound::Ignored
        }
        ServerMessage::Reconnect(session) => match session.reconnect_url {
            Some(url) => Inbound::Reconnect(url),
            None => bail!("session_reconnect without a reconnect_url"),
        },
        ServerMessage::Revocation(subscription) => Inbound::Revoked {
            subscription_id: subscription.id,
            broadcaster_id: subscription.condition.broadcaster_user_id,
            reason: subscription.status,
        },
        ServerMessage::Other(kind) => {
            tracing::debug!(kind, "Ignoring unknown EventSub message type");
            Inbound::Ignored
        }
    })
}

/// The daemon's EventSub WebSocket connection, bound to the shared conduit.
pub struct EventSubSession {
    url: String,
    conduits: Arc<ConduitManager>,
    dispatcher: Arc<RedemptionDispatcher>,
    seen: Mutex<LruCache<String, ()>>,
}

enum SessionEnd {
    Shutdown,
    Reconnect(String),
}

impl EventSubSession {
    pub fn new(url: &str, conduits: Arc<ConduitManager>, dispatcher: Arc<RedemptionDispatcher>) -> Self {
        Self {
            url: url.to_string(),
            conduits,
            dispatcher,
            seen: Mutex::new(LruCache::new(SEEN_CAPACITY)),
        }
    }

    /// Connect, bind to the conduit and route events until shutdown.
    ///
    /// Returns an error when the connection dies or goes silent; the daemon
    /// supervisor reconnects with backoff.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut url = self.url.clone();
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.connect_once(&url, &mut shutdown).await? {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Reconnect(next) => {
                    tracing::info!(url = %next, "EventSub asked us to reconnect");
                    url = next;
                }
            }
        }
    }

    async fn wait_for_welcome<S>(&self, read: &mut S) -> Result<Session>
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        while let Some(message) = read.next().await {
            if let Message::Text(text) = message? {
                let inbound = classify(text.as_str(), &mut self.seen.lock())?;
                match inbound {
                    Inbound::Welcome(session) => return Ok(session),
                    other => tracing::debug!(?other, "Frame before welcome"),
                }
            }
        }
        bail!("EventSub closed before the welcome message")
    }

    async fn connect_once(&self, url: &str, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        let (stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to EventSub at {url}"))?;
        let (mut write, mut read) = stream.split();

        let session = tokio::time::timeout(WELCOME_TIMEOUT, self.wait_for_welcome(&mut read))
            .await
            .context("No EventSub welcome message in time")??;

        let keepalive = Duration::from_secs(
            session
                .keepalive_timeout_seconds
                .unwrap_or(DEFAULT_KEEPALIVE_SECS),
        ) + KEEPALIVE_GRACE;
        tracing::info!(session_id = %session.id, ?keepalive, "EventSub session established");

        let attached = self.conduits.attach_transport_session(&session.id).await?;
        let subscribed = if attached.recreated {
            self.dispatcher.resubscribe_all().await?
        } else {
            self.dispatcher.start_all().await?
        };
        tracing::info!(conduit_id = %attached.conduit.id, subscribed, "Conduit bound to session");

        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                frame = tokio::time::timeout(keepalive, read.next()) => frame,
            };
            let message = match frame {
                Err(_) => bail!("EventSub silent for longer than {keepalive:?}"),
                Ok(None) => bail!("EventSub connection closed"),
                Ok(Some(message)) => message.context("EventSub read failed")?,
            };

            let text = match message {
                Message::Text(text) => text,
                Message::Ping(data) => {
                    write.send(Message::Pong(data)).await?;
                    continue;
                }
                Message::Close(frame) => bail!("EventSub closed the connection: {frame:?}"),
                _ => continue,
            };

            let inbound = match classify(text.as_str(), &mut self.seen.lock()) {
                Ok(inbound) => inbound,
                Err(e) => {
                    tracing::warn!("Dropping EventSub frame: {e:#}");
                    continue;
                }
            };
            match inbound {
                Inbound::Redemption(event) => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    tokio::spawn(async move {
                        if let Err(e) = dispatcher.handle_redemption(&event).await {
                            tracing::warn!(channel = %event.channel, "Redemption handling failed: {e:#}");
                        }
                    });
                }
                Inbound::Reconnect(next) => return Ok(SessionEnd::Reconnect(next)),
                Inbound::Revoked {
                    subscription_id,
                    broadcaster_id,
                    reason,
                } => {
                    let channel = match &broadcaster_id {
                        Some(id) => self.dispatcher.registry().channel_for_broadcaster(id).await,
                        None => None,
                    };
                    match channel {
                        Some(channel) => {
                            self.dispatcher
                                .on_revocation(&channel, &subscription_id, &reason)
                                .await;
                        }
                        None => tracing::warn!(subscription_id, reason, "Revocation for an unknown subscription"),
                    }
                }
                Inbound::Welcome(_) | Inbound::Keepalive | Inbound::Duplicate | Inbound::Ignored => {}
            }
        }
    }
}
