//! Renewal sweeps against a mock OAuth endpoint: refresh near expiry, and
//! terminal expiry that switches redemptions off and pages the operator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatfleet::auth::renewal::{RenewalListener, RenewalService};
use chatfleet::config::{PlatformConfig, ReliabilityConfig};
use chatfleet::notify::{Notification, Notifier, Urgency, WebhookNotifier};
use chatfleet::platform::HelixClient;
use chatfleet::store::{ChannelConfig, ChannelConfigStore, ChannelCredential, CredentialStore};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct ChannelNotifier(mpsc::UnboundedSender<Notification>);

#[async_trait]
impl Notifier for ChannelNotifier {
    fn name(&self) -> &str {
        "test"
    }

    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        let _ = self.0.send(notification.clone());
        Ok(())
    }
}

#[derive(Default)]
struct Listener {
    renewed: Mutex<Vec<String>>,
    expired: Mutex<Vec<String>>,
}

#[async_trait]
impl RenewalListener for Listener {
    async fn credentials_renewed(&self, channels: &[String]) {
        self.renewed.lock().extend_from_slice(channels);
    }

    async fn credentials_expired(&self, channels: &[String]) {
        self.expired.lock().extend_from_slice(channels);
    }
}

struct Fixture {
    _tmp: TempDir,
    credentials: Arc<CredentialStore>,
    configs: Arc<ChannelConfigStore>,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let configs = Arc::new(ChannelConfigStore::new(
        tmp.path().join("channels"),
        tmp.path().join("locks"),
    ));
    let credentials = Arc::new(CredentialStore::new(
        tmp.path().join("credentials"),
        Arc::clone(&configs),
    ));
    Fixture {
        _tmp: tmp,
        credentials,
        configs,
    }
}

fn client(server: &MockServer) -> Arc<HelixClient> {
    let platform = PlatformConfig {
        client_id: "cid".into(),
        client_secret: "secret".into(),
        ..PlatformConfig::default()
    };
    let reliability = ReliabilityConfig {
        retry_backoff_ms: 10,
        ..ReliabilityConfig::default()
    };
    let base = server.uri();
    Arc::new(
        HelixClient::new(&platform, &reliability)
            .unwrap()
            .with_endpoints(&format!("{base}/helix"), &format!("{base}/oauth2")),
    )
}

fn credential(channel: &str, access: &str, refresh: &str) -> ChannelCredential {
    ChannelCredential {
        channel: channel.into(),
        owner_login: channel.into(),
        owner_id: Some("42".into()),
        access_token: access.into(),
        refresh_token: Some(refresh.into()),
        scopes: vec!["channel:read:redemptions".into()],
        expires_at: None,
        version: 0,
        updated_at: None,
    }
}

#[tokio::test]
async fn token_near_expiry_is_refreshed_and_listener_told() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/oauth2/validate"))
        .and(header("authorization", "OAuth old-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "client_id": "cid",
            "login": "alice",
            "user_id": "42",
            "scopes": ["channel:read:redemptions"],
            "expires_in": 600
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=old-refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "new-access",
            "refresh_token": "new-refresh",
            "expires_in": 14400,
            "scope": ["channel:read:redemptions"],
            "token_type": "bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fx = fixture();
    let stored = fx
        .credentials
        .set_channel_credential(&credential("alice", "old-access", "old-refresh"))
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let listener = Arc::new(Listener::default());
    let service = RenewalService::new(
        client(&server),
        Arc::clone(&fx.credentials),
        Arc::new(ChannelNotifier(tx)),
        Duration::from_secs(3600),
        "https://example.test/reauth".into(),
    )
    .with_listener(listener.clone());

    let (_stop, shutdown) = watch::channel(false);
    let report = service.sweep(&shutdown).await.unwrap();
    assert_eq!(report.refreshed, vec!["alice".to_string()]);
    assert!(report.expired.is_empty());

    let renewed = fx.credentials.channel_credential("alice").unwrap().unwrap();
    assert_eq!(renewed.access_token, "new-access");
    assert_eq!(renewed.refresh_token.as_deref(), Some("new-refresh"));
    assert!(renewed.version > stored.version);
    assert!(renewed.expires_at.is_some());

    assert_eq!(*listener.renewed.lock(), vec!["alice".to_string()]);
    assert!(listener.expired.lock().is_empty());
}

#[tokio::test]
async fn rejected_refresh_of_dead_token_disables_redemptions() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/oauth2/validate"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "status": 401,
            "message": "invalid access token"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "status": 400,
            "message": "Invalid refresh token"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fx = fixture();
    let mut config = ChannelConfig::with_defaults("bob");
    config.redemption_enabled = true;
    fx.configs.save(&config).await.unwrap();
    fx.credentials
        .set_channel_credential(&credential("bob", "dead", "revoked"))
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = Arc::new(Listener::default());
    let service = RenewalService::new(
        client(&server),
        Arc::clone(&fx.credentials),
        Arc::new(ChannelNotifier(tx)),
        Duration::from_secs(3600),
        "https://example.test/reauth".into(),
    )
    .with_listener(listener.clone());

    let (_stop, shutdown) = watch::channel(false);
    let report = service.sweep(&shutdown).await.unwrap();
    assert_eq!(report.expired, vec!["bob".to_string()]);

    assert!(!fx.configs.load("bob").unwrap().unwrap().redemption_enabled);
    assert_eq!(*listener.expired.lock(), vec!["bob".to_string()]);

    let alert = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("alert delivered")
        .unwrap();
    assert_eq!(alert.urgency, Urgency::Critical);
    assert!(alert.title.contains("#bob"));
    assert_eq!(
        alert.remediation_url.as_deref(),
        Some("https://example.test/reauth")
    );
}

#[tokio::test]
async fn transient_validation_failure_leaves_credential_untouched() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/oauth2/validate"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let fx = fixture();
    let stored = fx
        .credentials
        .set_channel_credential(&credential("carol", "access", "refresh"))
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let service = RenewalService::new(
        client(&server),
        Arc::clone(&fx.credentials),
        Arc::new(ChannelNotifier(tx)),
        Duration::from_secs(3600),
        "https://example.test/reauth".into(),
    );

    let (_stop, shutdown) = watch::channel(false);
    let report = service.sweep(&shutdown).await.unwrap();
    assert_eq!(report.errored, vec!["carol".to_string()]);

    let after = fx.credentials.channel_credential("carol").unwrap().unwrap();
    assert_eq!(after.version, stored.version);
    assert_eq!(after.access_token, "access");
}

#[tokio::test]
async fn webhook_notifier_posts_rendered_alert() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_string_contains("[CRITICAL] Channel token for #bob expired"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let notifier =
        WebhookNotifier::new(&format!("{}/hook", server.uri()), Duration::from_secs(2)).unwrap();
    notifier
        .notify(&Notification {
            urgency: Urgency::Critical,
            title: "Channel token for #bob expired".into(),
            body: "Redemptions are disabled.".into(),
            remediation_url: None,
        })
        .await
        .unwrap();
}
