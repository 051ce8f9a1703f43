//! A timeout redemption from subscription to ban and chat announcement,
//! against a mock platform.

use std::sync::Arc;
use std::time::Duration;

use chatfleet::auth::RenewalService;
use chatfleet::conduit::ConduitManager;
use chatfleet::config::{PlatformConfig, ReliabilityConfig};
use chatfleet::moderation::HelixModerator;
use chatfleet::notify::LogNotifier;
use chatfleet::platform::{HelixClient, PlatformApi};
use chatfleet::redemption::{
    PolicySettings, RedemptionDispatcher, RedemptionEvent, RedemptionOutcome, StartOutcome,
};
use chatfleet::store::{
    BotCredential, ChannelConfig, ChannelConfigStore, ChannelCredential, CredentialStore,
};
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    _tmp: TempDir,
    dispatcher: RedemptionDispatcher,
}

fn client(server: &MockServer) -> Arc<dyn PlatformApi> {
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

async fn fixture(server: &MockServer) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let channels = Arc::new(ChannelConfigStore::new(
        tmp.path().join("channels"),
        tmp.path().join("locks"),
    ));
    let credentials = Arc::new(CredentialStore::new(
        tmp.path().join("credentials"),
        Arc::clone(&channels),
    ));

    credentials
        .set_bot_credential(&BotCredential {
            access_token: "bot-token".into(),
            login: Some("fleetbot".into()),
            user_id: Some("900".into()),
            expires_at: None,
            updated_at: None,
        })
        .unwrap();
    credentials
        .set_channel_credential(&ChannelCredential {
            channel: "alice".into(),
            owner_login: "alice".into(),
            owner_id: Some("100".into()),
            access_token: "owner-token".into(),
            refresh_token: Some("owner-refresh".into()),
            scopes: vec![
                "channel:read:redemptions".into(),
                "moderator:manage:banned_users".into(),
            ],
            expires_at: None,
            version: 0,
            updated_at: None,
        })
        .unwrap();
    let mut config = ChannelConfig::with_defaults("alice");
    config.redemption_enabled = true;
    config.redemption_timeout_secs = 120;
    channels.save(&config).await.unwrap();

    let api = client(server);
    let conduits = Arc::new(ConduitManager::new(
        Arc::clone(&api),
        tmp.path().join("conduit.json"),
        tmp.path().join("locks"),
    ));
    let owner_tokens = Arc::new(RenewalService::new(
        Arc::clone(&api),
        Arc::clone(&credentials),
        Arc::new(LogNotifier),
        Duration::from_secs(3600),
        "https://example.test/renew".into(),
    ));
    let moderator = Arc::new(HelixModerator::new(
        Arc::clone(&api),
        Arc::clone(&credentials),
        owner_tokens,
    ));
    let dispatcher = RedemptionDispatcher::new(
        api,
        conduits,
        credentials,
        moderator,
        PolicySettings {
            bot_login: "fleetbot".into(),
            bot_owner: "ops".into(),
            ..PolicySettings::default()
        },
    );
    Fixture {
        _tmp: tmp,
        dispatcher,
    }
}

async fn mock_app_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "app-token",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

async fn mock_conduit_create(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/helix/eventsub/conduits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"id": "conduit-1", "shard_count": 1}]
        })))
        .expect(1)
        .mount(server)
        .await;
}

/// The owner token is checked before it is used for a ban.
async fn mock_owner_token_valid(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/oauth2/validate"))
        .and(header("authorization", "OAuth owner-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "client_id": "cid",
            "login": "alice",
            "user_id": "100",
            "scopes": ["channel:read:redemptions", "moderator:manage:banned_users"],
            "expires_in": 14400
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mock_user(server: &MockServer, login: &str, id: &str) {
    Mock::given(method("GET"))
        .and(path("/helix/users"))
        .and(query_param("login", login))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"id": id, "login": login, "display_name": login}]
        })))
        .mount(server)
        .await;
}

fn redemption(redeemer: &str, input: &str) -> RedemptionEvent {
    RedemptionEvent {
        channel: "alice".into(),
        redeemer: redeemer.into(),
        user_input: input.into(),
        reward_id: "reward-1".into(),
        reward_title: "Timeout a chatter".into(),
        reward_cost: 500,
    }
}

#[tokio::test]
async fn redemption_times_out_target_and_announces_it() {
    let server = MockServer::start().await;
    mock_app_token(&server).await;
    mock_conduit_create(&server).await;
    mock_owner_token_valid(&server).await;
    mock_user(&server, "alice", "100").await;
    mock_user(&server, "trollface", "555").await;

    Mock::given(method("POST"))
        .and(path("/helix/eventsub/subscriptions"))
        .and(header("authorization", "Bearer app-token"))
        .and(body_partial_json(serde_json::json!({
            "type": "channel.channel_points_custom_reward_redemption.add",
            "condition": {"broadcaster_user_id": "100"},
            "transport": {"method": "conduit", "conduit_id": "conduit-1"}
        })))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
            "data": [{
                "id": "sub-1",
                "status": "enabled",
                "type": "channel.channel_points_custom_reward_redemption.add"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/helix/moderation/bans"))
        .and(query_param("broadcaster_id", "100"))
        .and(query_param("moderator_id", "100"))
        .and(header("authorization", "Bearer owner-token"))
        .and(body_partial_json(serde_json::json!({
            "data": {"user_id": "555", "duration": 120}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/helix/chat/messages"))
        .and(header("authorization", "Bearer bot-token"))
        .and(body_partial_json(serde_json::json!({
            "broadcaster_id": "100",
            "sender_id": "900",
            "message": "bob spent 500 points to time out trollface for 120s!"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/helix/eventsub/subscriptions"))
        .and(query_param("id", "sub-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(&server).await;
    assert_eq!(f.dispatcher.start("alice").await.unwrap(), StartOutcome::Subscribed);
    assert_eq!(f.dispatcher.start("alice").await.unwrap(), StartOutcome::AlreadyActive);
    assert_eq!(
        f.dispatcher.registry().channel_for_broadcaster("100").await.as_deref(),
        Some("alice")
    );

    let outcome = f
        .dispatcher
        .handle_redemption(&redemption("bob", "@TrollFace pls"))
        .await
        .unwrap();
    assert!(matches!(outcome, RedemptionOutcome::Timeout { .. }));

    assert!(f.dispatcher.stop("alice").await.unwrap());
    assert!(f.dispatcher.registry().active_channels().is_empty());
}

/// After a daemon restart the platform still holds the subscription. The
/// duplicate is looked up so disabling redemptions really unsubscribes.
#[tokio::test]
async fn existing_subscription_is_adopted_and_deleted_on_stop() {
    let server = MockServer::start().await;
    mock_app_token(&server).await;
    mock_conduit_create(&server).await;

    Mock::given(method("POST"))
        .and(path("/helix/eventsub/subscriptions"))
        .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
            "error": "Conflict",
            "status": 409,
            "message": "subscription already exists"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/helix/eventsub/subscriptions"))
        .and(query_param("user_id", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [
                {
                    "id": "other-type",
                    "status": "enabled",
                    "type": "channel.follow",
                    "condition": {"broadcaster_user_id": "100"}
                },
                {
                    "id": "sub-existing",
                    "status": "enabled",
                    "type": "channel.channel_points_custom_reward_redemption.add",
                    "condition": {"broadcaster_user_id": "100"}
                }
            ],
            "pagination": {}
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/helix/eventsub/subscriptions"))
        .and(query_param("id", "sub-existing"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(&server).await;
    assert_eq!(f.dispatcher.start("alice").await.unwrap(), StartOutcome::Subscribed);
    assert_eq!(f.dispatcher.registry().active_channels(), vec!["alice".to_string()]);
    assert!(f.dispatcher.stop("alice").await.unwrap());
}

#[tokio::test]
async fn targeting_the_bot_is_refused_in_chat_without_a_ban() {
    let server = MockServer::start().await;
    mock_app_token(&server).await;
    mock_user(&server, "alice", "100").await;

    Mock::given(method("POST"))
        .and(path("/helix/moderation/bans"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/helix/chat/messages"))
        .and(header("authorization", "Bearer bot-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(&server).await;
    let outcome = f
        .dispatcher
        .handle_redemption(&redemption("bob", "FleetBot"))
        .await
        .unwrap();
    match outcome {
        RedemptionOutcome::Rejected { reply } => assert!(reply.starts_with("@bob, ")),
        other => panic!("expected a refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_ban_is_reported_to_the_redeemer() {
    let server = MockServer::start().await;
    mock_app_token(&server).await;
    mock_owner_token_valid(&server).await;
    mock_user(&server, "alice", "100").await;
    mock_user(&server, "trollface", "555").await;

    Mock::given(method("POST"))
        .and(path("/helix/moderation/bans"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "status": 400,
            "message": "user is already banned"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/helix/chat/messages"))
        .and(body_partial_json(serde_json::json!({
            "message": "@bob, the timeout didn't go through. Ask a mod for a refund."
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(&server).await;
    f.dispatcher
        .handle_redemption(&redemption("bob", "trollface"))
        .await
        .unwrap();
}
