//! Wiring rules across the whole session.

use crate::tests::harness::{wait_for_event, MockAuthServer, MockGateway, WsBehavior};
use crate::{SessionCoordinator, SessionEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tether_api::{CredentialEvent, Credentials};
use tether_core::Config;
use tether_gateway::{ConnectionState, DispatchEvent, GatewayEvent};
use tether_queue::{ActionHandler, PendingAction, QueueEvent};
use tether_storage::MemoryStorage;
use tokio::time::{sleep, Duration};

struct NoopHandler;

#[async_trait]
impl ActionHandler for NoopHandler {
    async fn execute(&self, _action: &PendingAction) -> anyhow::Result<()> {
        Ok(())
    }
}

fn test_config(ws: &MockGateway, http: &MockAuthServer) -> Config {
    let mut config = Config::default();
    config.gateway_url = ws.url();
    config.api_url = http.url();
    config.heartbeat_interval_ms = 10_000;
    config.reconnect_base_delay_ms = 50;
    config.reconnect_max_delay_ms = 200;
    config.max_reconnect_attempts = 3;
    config.ack_timeout_ms = 500;
    config.request_timeout_ms = 1_000;
    config.retry_delay_ms = 20;
    config
}

async fn new_session(config: &Config) -> SessionCoordinator {
    let storage = Arc::new(MemoryStorage::new());
    let session = SessionCoordinator::new(config, storage, Arc::new(NoopHandler)).unwrap();
    session.start().await;
    session
}

#[tokio::test]
async fn test_connect_drives_queue_online_and_acks_flow() {
    let ws = MockGateway::start().await;
    let http = MockAuthServer::start().await;
    let config = test_config(&ws, &http);
    let session = new_session(&config).await;
    session.set_credentials(Credentials::bearer("tok-1")).await;
    let mut events = session.subscribe();

    // Queued while offline; replayed once the gateway connects.
    let action_id = session
        .queue_action("send_note", serde_json::json!({"n": 1}))
        .await
        .unwrap();
    assert!(!session.queue().is_online());

    session.connect().await.unwrap();

    wait_for_event(&mut events, 2_000, |e| {
        matches!(e, SessionEvent::Gateway(GatewayEvent::Connected))
    })
    .await
    .expect("gateway should connect");

    wait_for_event(&mut events, 2_000, |e| {
        matches!(e, SessionEvent::Queue(QueueEvent::ActionCompleted { id }) if *id == action_id)
    })
    .await
    .expect("queued action should replay");

    // The echo gateway acks dispatcher sends.
    let msg_id = session
        .send("notes", "created", Some(serde_json::json!({"n": 1})))
        .await;
    wait_for_event(&mut events, 2_000, |e| {
        matches!(e, SessionEvent::Dispatch(DispatchEvent::Acknowledged { id }) if *id == msg_id)
    })
    .await
    .expect("message should be acknowledged");

    session.shutdown().await;
}

#[tokio::test]
async fn test_credential_rejection_renews_and_reconnects() {
    let ws = MockGateway::start().await;
    let http = MockAuthServer::start().await;
    ws.queue_behavior(WsBehavior::CloseWithCode(4002));
    http.queue(200, r#"{"accessToken":"tok-2"}"#);
    let config = test_config(&ws, &http);
    let session = new_session(&config).await;
    session.set_credentials(Credentials::bearer("tok-1")).await;
    let mut events = session.subscribe();

    session.connect().await.unwrap();

    wait_for_event(&mut events, 2_000, |e| {
        matches!(e, SessionEvent::Gateway(GatewayEvent::CredentialRejected(4002)))
    })
    .await
    .expect("close code 4002 should surface as rejection");

    wait_for_event(&mut events, 2_000, |e| {
        matches!(e, SessionEvent::Credential(CredentialEvent::Refreshed))
    })
    .await
    .expect("rejection should trigger renewal");

    wait_for_event(&mut events, 2_000, |e| {
        matches!(e, SessionEvent::Gateway(GatewayEvent::Connected))
    })
    .await
    .expect("session should reconnect after renewal");

    assert_eq!(http.hits(), 1, "Exactly one renewal call");
    let uris = ws.request_uris();
    assert_eq!(uris.len(), 2);
    assert!(uris[0].contains("token=tok-1"));
    assert!(uris[1].contains("token=tok-2"), "Reconnect carries the new token");
    // The renewal path never burns generic reconnect attempts.
    assert_eq!(session.gateway().reconnect_attempts().await, 0);

    session.shutdown().await;
}

#[tokio::test]
async fn test_terminal_renewal_failure_tears_down() {
    let ws = MockGateway::start().await;
    let http = MockAuthServer::start().await;
    ws.queue_behavior(WsBehavior::CloseWithCode(4001));
    http.queue(401, r#"{"message":"revoked"}"#);
    let config = test_config(&ws, &http);
    let session = new_session(&config).await;
    session.set_credentials(Credentials::bearer("tok-1")).await;
    let mut events = session.subscribe();

    session.connect().await.unwrap();

    wait_for_event(&mut events, 2_000, |e| {
        matches!(e, SessionEvent::AuthFailure)
    })
    .await
    .expect("failed renewal should surface as auth failure");

    assert!(session.api().access_token().is_none());
    assert_eq!(session.gateway().state().await, ConnectionState::Disconnected);
    assert!(!session.queue().is_online());

    // No reconnect loop with a dead credential.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(ws.connection_count(), 1);

    session.shutdown().await;
}

#[tokio::test]
async fn test_network_blip_reconnects_and_restores_queue() {
    let ws = MockGateway::start().await;
    let http = MockAuthServer::start().await;
    // Non-auth close routes through generic backoff reconnect.
    ws.queue_behavior(WsBehavior::CloseWithCode(1012));
    let config = test_config(&ws, &http);
    let session = new_session(&config).await;
    session.set_credentials(Credentials::bearer("tok-1")).await;
    let mut events = session.subscribe();

    session.connect().await.unwrap();

    wait_for_event(&mut events, 2_000, |e| {
        matches!(e, SessionEvent::Gateway(GatewayEvent::Connected))
    })
    .await
    .expect("initial connect");

    wait_for_event(&mut events, 2_000, |e| {
        matches!(e, SessionEvent::Gateway(GatewayEvent::Disconnected(_)))
    })
    .await
    .expect("server close should surface");
    assert!(!session.queue().is_online());

    wait_for_event(&mut events, 2_000, |e| {
        matches!(e, SessionEvent::Gateway(GatewayEvent::Connected))
    })
    .await
    .expect("backoff reconnect");
    assert!(session.queue().is_online());
    assert_eq!(ws.connection_count(), 2);
    assert_eq!(http.hits(), 0, "A network blip never touches the auth server");

    session.shutdown().await;
}
