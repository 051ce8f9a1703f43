//! In-memory `PlatformApi` for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::client::PlatformApi;
use super::error::PlatformError;
use super::types::{
    ConduitInfo, PlatformUser, SubscriptionInfo, SubscriptionRequest, TimeoutParams, TokenGrant,
    TokenInfo,
};

#[derive(Default)]
pub struct FakeState {
    pub conduits: Vec<ConduitInfo>,
    pub conduits_created: u32,
    /// (conduit id, session id) per successful shard assignment.
    pub shard_assignments: Vec<(String, String)>,
    /// Access token -> introspection result. Unknown tokens are unauthorized.
    pub tokens: HashMap<String, TokenInfo>,
    /// Refresh token -> grant. Unknown refresh tokens are rejected.
    pub grants: HashMap<String, TokenGrant>,
    pub refresh_calls: Vec<String>,
    pub revoked: Vec<String>,
    pub users: HashMap<String, PlatformUser>,
    pub subscriptions: Vec<(String, SubscriptionRequest)>,
    pub deleted_subscriptions: Vec<String>,
    /// (broadcaster id, message)
    pub chat: Vec<(String, String)>,
    /// (broadcaster id, target user id, seconds)
    pub timeouts: Vec<(String, String, u64)>,
    /// User tokens the moderation endpoints answer with 401.
    pub rejected_user_tokens: Vec<String>,
    /// Latency added to subscription create and delete.
    pub subscription_delay: Option<std::time::Duration>,
}

#[derive(Default)]
pub struct FakePlatform {
    pub state: Mutex<FakeState>,
}

impl FakePlatform {
    async fn delay(&self) {
        let delay = self.state.lock().subscription_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn with_user(self, login: &str, id: &str) -> Self {
        self.state.lock().users.insert(
            login.to_string(),
            PlatformUser {
                id: id.to_string(),
                login: login.to_string(),
                display_name: login.to_string(),
            },
        );
        self
    }

    pub fn with_token(self, access_token: &str, login: &str, expires_in: u64) -> Self {
        self.state.lock().tokens.insert(
            access_token.to_string(),
            TokenInfo {
                client_id: None,
                login: Some(login.to_string()),
                user_id: None,
                scopes: Vec::new(),
                expires_in,
            },
        );
        self
    }

    pub fn with_grant(self, refresh_token: &str, access_token: &str, expires_in: u64) -> Self {
        self.state.lock().grants.insert(
            refresh_token.to_string(),
            TokenGrant {
                access_token: access_token.to_string(),
                refresh_token: Some(format!("{refresh_token}-next")),
                expires_in,
                scope: Vec::new(),
            },
        );
        self
    }
}

#[async_trait]
impl PlatformApi for FakePlatform {
    async fn validate_token(&self, access_token: &str) -> Result<TokenInfo, PlatformError> {
        self.state
            .lock()
            .tokens
            .get(access_token)
            .cloned()
            .ok_or_else(|| PlatformError::Unauthorized("invalid access token".into()))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, PlatformError> {
        let mut state = self.state.lock();
        state.refresh_calls.push(refresh_token.to_string());
        state
            .grants
            .get(refresh_token)
            .cloned()
            .ok_or_else(|| PlatformError::Rejected {
                status: 400,
                message: "Invalid refresh token".into(),
            })
    }

    async fn revoke_token(&self, access_token: &str) -> Result<(), PlatformError> {
        self.state.lock().revoked.push(access_token.to_string());
        Ok(())
    }

    async fn user_by_login(&self, login: &str) -> Result<Option<PlatformUser>, PlatformError> {
        Ok(self.state.lock().users.get(login).cloned())
    }

    async fn list_conduits(&self) -> Result<Vec<ConduitInfo>, PlatformError> {
        Ok(self.state.lock().conduits.clone())
    }

    async fn create_conduit(&self, shard_count: u32) -> Result<ConduitInfo, PlatformError> {
        let mut state = self.state.lock();
        state.conduits_created += 1;
        let conduit = ConduitInfo {
            id: format!("conduit-{}", state.conduits_created),
            shard_count,
        };
        state.conduits.push(conduit.clone());
        Ok(conduit)
    }

    async fn assign_shard(
        &self,
        conduit_id: &str,
        _shard_index: u32,
        session_id: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        if !state.conduits.iter().any(|c| c.id == conduit_id) {
            return Err(PlatformError::NotFound("conduit not found".into()));
        }
        state
            .shard_assignments
            .push((conduit_id.to_string(), session_id.to_string()));
        Ok(())
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionInfo, PlatformError> {
        self.delay().await;
        let mut state = self.state.lock();
        let duplicate = state.subscriptions.iter().any(|(id, existing)| {
            !state.deleted_subscriptions.contains(id)
                && existing.kind == request.kind
                && existing.condition == request.condition
                && existing.transport.conduit_id == request.transport.conduit_id
        });
        if duplicate {
            return Err(PlatformError::Rejected {
                status: 409,
                message: "subscription already exists".into(),
            });
        }
        let id = format!("sub-{}", state.subscriptions.len() + 1);
        state.subscriptions.push((id.clone(), request.clone()));
        Ok(SubscriptionInfo {
            id,
            status: "enabled".into(),
            kind: request.kind.clone(),
            condition: request.condition.clone(),
        })
    }

    async fn list_subscriptions(
        &self,
        kind: &str,
        broadcaster_id: &str,
    ) -> Result<Vec<SubscriptionInfo>, PlatformError> {
        let state = self.state.lock();
        Ok(state
            .subscriptions
            .iter()
            .filter(|(id, _)| !state.deleted_subscriptions.contains(id))
            .map(|(id, request)| SubscriptionInfo {
                id: id.clone(),
                status: "enabled".into(),
                kind: request.kind.clone(),
                condition: request.condition.clone(),
            })
            .filter(|info| info.matches(kind, broadcaster_id))
            .collect())
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), PlatformError> {
        self.delay().await;
        self.state
            .lock()
            .deleted_subscriptions
            .push(subscription_id.to_string());
        Ok(())
    }

    async fn send_chat_message(
        &self,
        _user_token: &str,
        broadcaster_id: &str,
        _sender_id: &str,
        message: &str,
    ) -> Result<(), PlatformError> {
        self.state
            .lock()
            .chat
            .push((broadcaster_id.to_string(), message.to_string()));
        Ok(())
    }

    async fn timeout_user(
        &self,
        user_token: &str,
        params: TimeoutParams<'_>,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        if state.rejected_user_tokens.iter().any(|t| t == user_token) {
            return Err(PlatformError::Unauthorized("invalid access token".into()));
        }
        state.timeouts.push((
            params.broadcaster_id.to_string(),
            params.user_id.to_string(),
            params.duration_secs,
        ));
        Ok(())
    }
}
