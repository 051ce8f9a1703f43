use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

use super::error::PlatformError;
use super::types::{
    ConduitInfo, PlatformUser, SubscriptionInfo, SubscriptionRequest, TimeoutParams, TokenGrant,
    TokenInfo,
};
use crate::config::{PlatformConfig, ReliabilityConfig};

/// One first attempt plus at most one retry.
const MAX_ATTEMPTS: u32 = 2;
/// Upper bound on pages followed when listing subscriptions.
const MAX_SUBSCRIPTION_PAGES: usize = 20;
/// Refetch the app token this long before it actually expires.
const APP_TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Remote calls the control plane makes against the platform.
///
/// Calls taking a `user_token` act on behalf of that user; the rest use the
/// application's client-credentials token.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn validate_token(&self, access_token: &str) -> Result<TokenInfo, PlatformError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, PlatformError>;

    async fn revoke_token(&self, access_token: &str) -> Result<(), PlatformError>;

    async fn user_by_login(&self, login: &str) -> Result<Option<PlatformUser>, PlatformError>;

    async fn list_conduits(&self) -> Result<Vec<ConduitInfo>, PlatformError>;

    async fn create_conduit(&self, shard_count: u32) -> Result<ConduitInfo, PlatformError>;

    async fn assign_shard(
        &self,
        conduit_id: &str,
        shard_index: u32,
        session_id: &str,
    ) -> Result<(), PlatformError>;

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionInfo, PlatformError>;

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), PlatformError>;

    /// Existing subscriptions of `kind` for one broadcaster.
    async fn list_subscriptions(
        &self,
        kind: &str,
        broadcaster_id: &str,
    ) -> Result<Vec<SubscriptionInfo>, PlatformError>;

    async fn send_chat_message(
        &self,
        user_token: &str,
        broadcaster_id: &str,
        sender_id: &str,
        message: &str,
    ) -> Result<(), PlatformError>;

    async fn timeout_user(
        &self,
        user_token: &str,
        params: TimeoutParams<'_>,
    ) -> Result<(), PlatformError>;
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ShardUpdateResponse {
    #[serde(default)]
    errors: Vec<ShardUpdateError>,
}

#[derive(Debug, Deserialize)]
struct ShardUpdateError {
    #[serde(default)]
    id: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

struct CachedToken {
    token: String,
    valid_until: Instant,
}

/// `reqwest`-backed client for the Helix REST API and the OAuth endpoints.
pub struct HelixClient {
    http: reqwest::Client,
    api_base: String,
    auth_base: String,
    client_id: String,
    client_secret: String,
    retry_backoff: Duration,
    app_token: Mutex<Option<CachedToken>>,
}

impl HelixClient {
    pub fn new(platform: &PlatformConfig, reliability: &ReliabilityConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(reliability.request_timeout())
            .connect_timeout(reliability.request_timeout())
            .build()?;

        Ok(Self {
            http,
            api_base: platform.api_base.trim_end_matches('/').to_string(),
            auth_base: platform.auth_base.trim_end_matches('/').to_string(),
            client_id: platform.client_id.clone(),
            client_secret: platform.client_secret.clone(),
            retry_backoff: reliability.retry_backoff(),
            app_token: Mutex::new(None),
        })
    }

    /// Point both REST and OAuth traffic at `base` (tests against a mock server).
    #[must_use]
    pub fn with_endpoints(mut self, api_base: &str, auth_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.auth_base = auth_base.trim_end_matches('/').to_string();
        self
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}{path}", self.auth_base)
    }

    fn form_body(pairs: &[(&str, &str)]) -> String {
        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn form_post(&self, url: String, pairs: &[(&str, &str)]) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(Self::form_body(pairs))
    }

    fn helix(&self, method: reqwest::Method, url: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Client-Id", &self.client_id)
            .bearer_auth(token)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, PlatformError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| crate::util::truncate_with_ellipsis(&text, 200));
        Err(PlatformError::from_status(status.as_u16(), message))
    }

    /// Send a request, retrying once on transient failure.
    async fn execute<F>(&self, what: &str, build: F) -> Result<reqwest::Response, PlatformError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        self.send_attempts(what, MAX_ATTEMPTS, build).await
    }

    async fn send_attempts<F>(
        &self,
        what: &str,
        max_attempts: u32,
        build: F,
    ) -> Result<reqwest::Response, PlatformError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match build().send().await {
                Ok(resp) => Self::check_status(resp).await,
                Err(e) => Err(PlatformError::from_transport(&e)),
            };
            match result {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    tracing::warn!("{what} failed (attempt {attempt}), retrying: {e}");
                    tokio::time::sleep(self.retry_backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Send an app-token request. A transient failure or a 401 (after which
    /// the cached token is dropped and refetched) gets the request's single
    /// retry; there is never a third send.
    async fn execute_as_app<F>(
        &self,
        what: &str,
        build: F,
    ) -> Result<reqwest::Response, PlatformError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut token = self.app_access_token().await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_attempts(what, 1, || build(&token)).await {
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!("{what} failed (attempt {attempt}), retrying: {e}");
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(PlatformError::Unauthorized(reason)) if attempt < MAX_ATTEMPTS => {
                    tracing::debug!("App token rejected ({reason}); fetching a new one");
                    self.app_token.lock().take();
                    token = self.app_access_token().await?;
                }
                other => return other,
            }
        }
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, PlatformError> {
        resp.json::<T>()
            .await
            .map_err(|e| PlatformError::Decode(e.to_string()))
    }

    async fn first<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, PlatformError> {
        Self::decode::<DataEnvelope<T>>(resp)
            .await?
            .data
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::Decode("empty data array".into()))
    }

    /// Client-credentials token, cached until shortly before expiry.
    pub async fn app_access_token(&self) -> Result<String, PlatformError> {
        if let Some(cached) = self.app_token.lock().as_ref() {
            if Instant::now() < cached.valid_until {
                return Ok(cached.token.clone());
            }
        }

        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(PlatformError::Config(
                "client_id and client_secret are required".into(),
            ));
        }

        let url = self.auth_url("/token");
        let resp = self
            .execute("client credentials grant", || {
                self.form_post(
                    url.clone(),
                    &[
                        ("client_id", self.client_id.as_str()),
                        ("client_secret", self.client_secret.as_str()),
                        ("grant_type", "client_credentials"),
                    ],
                )
            })
            .await?;
        let grant: TokenGrant = Self::decode(resp).await?;

        let lifetime = Duration::from_secs(grant.expires_in.max(1));
        let valid_until = Instant::now() + lifetime.saturating_sub(APP_TOKEN_EXPIRY_MARGIN);
        *self.app_token.lock() = Some(CachedToken {
            token: grant.access_token.clone(),
            valid_until,
        });
        Ok(grant.access_token)
    }
}

#[async_trait]
impl PlatformApi for HelixClient {
    async fn validate_token(&self, access_token: &str) -> Result<TokenInfo, PlatformError> {
        let url = self.auth_url("/validate");
        let resp = self
            .execute("token validation", || {
                self.http
                    .get(&url)
                    .header(reqwest::header::AUTHORIZATION, format!("OAuth {access_token}"))
            })
            .await?;
        Self::decode(resp).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, PlatformError> {
        let url = self.auth_url("/token");
        let resp = self
            .execute("token refresh", || {
                self.form_post(
                    url.clone(),
                    &[
                        ("client_id", self.client_id.as_str()),
                        ("client_secret", self.client_secret.as_str()),
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                    ],
                )
            })
            .await?;
        Self::decode(resp).await
    }

    async fn revoke_token(&self, access_token: &str) -> Result<(), PlatformError> {
        let url = self.auth_url("/revoke");
        self.execute("token revoke", || {
            self.form_post(
                url.clone(),
                &[("client_id", self.client_id.as_str()), ("token", access_token)],
            )
        })
        .await?;
        Ok(())
    }

    async fn user_by_login(&self, login: &str) -> Result<Option<PlatformUser>, PlatformError> {
        let url = self.api_url(&format!("/users?login={}", urlencoding::encode(login)));
        let resp = self
            .execute_as_app("user lookup", |token| {
                self.helix(reqwest::Method::GET, &url, token)
            })
            .await?;
        let envelope: DataEnvelope<PlatformUser> = Self::decode(resp).await?;
        Ok(envelope.data.into_iter().next())
    }

    async fn list_conduits(&self) -> Result<Vec<ConduitInfo>, PlatformError> {
        let url = self.api_url("/eventsub/conduits");
        let resp = self
            .execute_as_app("conduit list", |token| {
                self.helix(reqwest::Method::GET, &url, token)
            })
            .await?;
        let envelope: DataEnvelope<ConduitInfo> = Self::decode(resp).await?;
        Ok(envelope.data)
    }

    async fn create_conduit(&self, shard_count: u32) -> Result<ConduitInfo, PlatformError> {
        let url = self.api_url("/eventsub/conduits");
        let body = serde_json::json!({ "shard_count": shard_count });
        let resp = self
            .execute_as_app("conduit create", |token| {
                self.helix(reqwest::Method::POST, &url, token).json(&body)
            })
            .await?;
        Self::first(resp).await
    }

    async fn assign_shard(
        &self,
        conduit_id: &str,
        shard_index: u32,
        session_id: &str,
    ) -> Result<(), PlatformError> {
        let url = self.api_url("/eventsub/conduits/shards");
        let body = serde_json::json!({
            "conduit_id": conduit_id,
            "shards": [{
                "id": shard_index.to_string(),
                "transport": { "method": "websocket", "session_id": session_id },
            }],
        });
        let resp = self
            .execute_as_app("conduit shard update", |token| {
                self.helix(reqwest::Method::PATCH, &url, token).json(&body)
            })
            .await?;

        // Per-shard failures come back inside a 202.
        let update: ShardUpdateResponse = resp.json().await.unwrap_or_default();
        if let Some(err) = update.errors.into_iter().next() {
            return Err(PlatformError::Rejected {
                status: 202,
                message: format!("shard {}: {}", err.id, err.message),
            });
        }
        Ok(())
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<SubscriptionInfo, PlatformError> {
        let url = self.api_url("/eventsub/subscriptions");
        let resp = self
            .execute_as_app("subscription create", |token| {
                self.helix(reqwest::Method::POST, &url, token).json(request)
            })
            .await?;
        Self::first(resp).await
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<(), PlatformError> {
        let url = self.api_url(&format!(
            "/eventsub/subscriptions?id={}",
            urlencoding::encode(subscription_id)
        ));
        self.execute_as_app("subscription delete", |token| {
            self.helix(reqwest::Method::DELETE, &url, token)
        })
        .await?;
        Ok(())
    }

    async fn list_subscriptions(
        &self,
        kind: &str,
        broadcaster_id: &str,
    ) -> Result<Vec<SubscriptionInfo>, PlatformError> {
        // The endpoint takes a single filter; the type is matched here.
        let base = self.api_url(&format!(
            "/eventsub/subscriptions?user_id={}",
            urlencoding::encode(broadcaster_id)
        ));
        let mut found = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_SUBSCRIPTION_PAGES {
            let url = match &cursor {
                Some(after) => format!("{base}&after={}", urlencoding::encode(after)),
                None => base.clone(),
            };
            let resp = self
                .execute_as_app("subscription list", |token| {
                    self.helix(reqwest::Method::GET, &url, token)
                })
                .await?;
            let page: Page<SubscriptionInfo> = Self::decode(resp).await?;
            found.extend(page.data.into_iter().filter(|s| s.matches(kind, broadcaster_id)));
            match page.pagination.cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(found)
    }

    async fn send_chat_message(
        &self,
        user_token: &str,
        broadcaster_id: &str,
        sender_id: &str,
        message: &str,
    ) -> Result<(), PlatformError> {
        let url = self.api_url("/chat/messages");
        let body = serde_json::json!({
            "broadcaster_id": broadcaster_id,
            "sender_id": sender_id,
            "message": message,
        });
        self.execute("chat message", || {
            self.helix(reqwest::Method::POST, &url, user_token).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn timeout_user(
        &self,
        user_token: &str,
        params: TimeoutParams<'_>,
    ) -> Result<(), PlatformError> {
        let url = self.api_url(&format!(
            "/moderation/bans?broadcaster_id={}&moderator_id={}",
            urlencoding::encode(params.broadcaster_id),
            urlencoding::encode(params.moderator_id)
        ));
        let body = serde_json::json!({
            "data": {
                "user_id": params.user_id,
                "duration": params.duration_secs,
                "reason": params.reason,
            }
        });
        self.execute("timeout", || {
            self.helix(reqwest::Method::POST, &url, user_token).json(&body)
        })
        .await?;
        Ok(())
    }
}
