//! Credential lifecycle: import, revocation, renewal sweeps and expiry
//! monitoring.

pub mod bot;
pub mod renewal;
pub mod status;

pub use bot::{BotCredentialMonitor, ExpiryTier};
pub use renewal::{CredentialHealth, OwnerTokenSource, RenewalListener, RenewalService, SweepReport};

use anyhow::{Context, Result, bail};
use chrono::Utc;

use crate::platform::{PlatformApi, PlatformError, TokenInfo};
use crate::store::{BotCredential, ChannelCredential, CredentialStore};

fn expires_at(info: &TokenInfo) -> Option<chrono::DateTime<Utc>> {
    info.remaining()
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d)
}

/// Validate a freshly authorized owner token pair and store it for `channel`.
///
/// The token must belong to the channel's broadcaster.
pub async fn import_channel_credential(
    api: &dyn PlatformApi,
    store: &CredentialStore,
    channel: &str,
    access_token: &str,
    refresh_token: Option<&str>,
) -> Result<ChannelCredential> {
    let info = api
        .validate_token(access_token)
        .await
        .context("Token validation failed")?;
    let owner_login = info
        .login
        .clone()
        .context("Token has no associated user; an app token cannot own a channel")?;
    if !owner_login.eq_ignore_ascii_case(channel) {
        bail!("Token belongs to '{owner_login}', not to channel '{channel}'");
    }

    let credential = ChannelCredential {
        channel: channel.to_string(),
        owner_login,
        owner_id: info.user_id.clone(),
        access_token: access_token.to_string(),
        refresh_token: refresh_token.map(str::to_string),
        scopes: info.scopes.clone(),
        expires_at: expires_at(&info),
        version: 0,
        updated_at: None,
    };
    let stored = store.set_channel_credential(&credential)?;
    tracing::info!(channel, version = stored.version, "Imported channel credential");
    Ok(stored)
}

/// Validate and store the bot-wide token.
pub async fn import_bot_credential(
    api: &dyn PlatformApi,
    store: &CredentialStore,
    access_token: &str,
) -> Result<BotCredential> {
    let info = api
        .validate_token(access_token)
        .await
        .context("Token validation failed")?;
    let credential = BotCredential {
        access_token: access_token.to_string(),
        login: info.login.clone(),
        user_id: info.user_id.clone(),
        expires_at: expires_at(&info),
        updated_at: None,
    };
    store.set_bot_credential(&credential)?;
    tracing::info!(login = ?credential.login, "Imported bot credential");
    Ok(credential)
}

/// Revoke a channel's owner token remotely (best-effort) and delete it,
/// which also switches the channel's redemptions off.
pub async fn revoke_channel_credential(
    api: &dyn PlatformApi,
    store: &CredentialStore,
    channel: &str,
) -> Result<bool> {
    if let Some(credential) = store.channel_credential(channel)? {
        match api.revoke_token(&credential.access_token).await {
            Ok(()) => {}
            // Already invalid remotely; deleting locally is all that is left.
            Err(PlatformError::Rejected { .. } | PlatformError::Unauthorized(_)) => {}
            Err(e) => tracing::warn!(channel, "Remote revoke failed, removing locally: {e}"),
        }
    }
    store.remove_channel_credential(channel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;
    use crate::store::ChannelConfigStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> CredentialStore {
        let channels = Arc::new(ChannelConfigStore::new(
            tmp.path().join("channels"),
            tmp.path().join("locks"),
        ));
        CredentialStore::new(tmp.path().join("credentials"), channels)
    }

    #[tokio::test]
    async fn import_rejects_token_of_another_user() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let api = FakePlatform::default().with_token("tok", "mallory", 3600);

        let err = import_channel_credential(&api, &store, "alice", "tok", Some("r"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mallory"));
        assert!(store.channel_credential("alice").unwrap().is_none());
    }

    #[tokio::test]
    async fn import_then_revoke() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let api = FakePlatform::default().with_token("tok", "alice", 3600);

        let stored = import_channel_credential(&api, &store, "alice", "tok", Some("r"))
            .await
            .unwrap();
        assert_eq!(stored.version, 1);
        assert!(stored.expires_at.is_some());

        assert!(revoke_channel_credential(&api, &store, "alice").await.unwrap());
        assert_eq!(api.state.lock().revoked, vec!["tok".to_string()]);
        assert!(store.channel_credential("alice").unwrap().is_none());
    }
}
