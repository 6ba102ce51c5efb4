//! Dispatcher tests: ack tracking, timeout requeue, retry budget, and flush
//! on reconnect.

use super::harness::{collect_events, wait_for_event, MockGatewayServer, ServerBehavior};
use crate::{
    DispatchEvent, DispatcherConfig, GatewayClient, GatewayConfig, GatewayEvent, MessageDispatcher,
};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn gateway_config(url: String) -> GatewayConfig {
    GatewayConfig {
        url,
        heartbeat_interval_ms: 10_000,
        reconnect_base_delay_ms: 20,
        reconnect_max_delay_ms: 100,
        max_reconnect_attempts: 10,
    }
}

async fn connected_setup(
    server: &MockGatewayServer,
    dispatcher_config: DispatcherConfig,
) -> (Arc<GatewayClient>, MessageDispatcher) {
    let gateway = Arc::new(GatewayClient::new(gateway_config(server.url())));
    let dispatcher = MessageDispatcher::new(gateway.clone(), dispatcher_config);
    dispatcher.start().await;

    let mut events = gateway.subscribe();
    gateway.connect("token").await.unwrap();
    wait_for_event(&mut events, 1_000, |e| matches!(e, GatewayEvent::Connected))
        .await
        .expect("should connect");

    (gateway, dispatcher)
}

#[tokio::test]
async fn ack_emits_acknowledged_and_clears_pending() {
    let server = MockGatewayServer::start().await;
    let (gateway, dispatcher) = connected_setup(&server, DispatcherConfig::default()).await;
    let mut events = dispatcher.subscribe();

    let id = dispatcher
        .send("chat", "message", Some(serde_json::json!({"text": "hi"})))
        .await;

    let acked = wait_for_event(&mut events, 1_000, |e| {
        matches!(e, DispatchEvent::Acknowledged { id: acked } if *acked == id)
    })
    .await;
    assert!(acked.is_some(), "Echo from the server is the ack");

    assert_eq!(dispatcher.pending_len().await, 0);
    assert_eq!(dispatcher.queue_len().await, 0);

    gateway.disconnect().await;
}

#[tokio::test]
async fn send_while_disconnected_is_flushed_on_connect() {
    let server = MockGatewayServer::start().await;
    let gateway = Arc::new(GatewayClient::new(gateway_config(server.url())));
    let dispatcher = MessageDispatcher::new(gateway.clone(), DispatcherConfig::default());
    dispatcher.start().await;
    let mut events = dispatcher.subscribe();

    let id = dispatcher.send("chat", "message", None).await;
    assert_eq!(dispatcher.queue_len().await, 1);

    gateway.connect("token").await.unwrap();

    let acked = wait_for_event(&mut events, 2_000, |e| {
        matches!(e, DispatchEvent::Acknowledged { id: acked } if *acked == id)
    })
    .await;
    assert!(acked.is_some(), "Queued message delivered after connect");
    assert_eq!(dispatcher.queue_len().await, 0);

    let delivered = server.received_messages();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].id, id);

    gateway.disconnect().await;
}

#[tokio::test]
async fn queued_messages_flush_in_fifo_order() {
    let server = MockGatewayServer::start().await;
    let gateway = Arc::new(GatewayClient::new(gateway_config(server.url())));
    let dispatcher = MessageDispatcher::new(gateway.clone(), DispatcherConfig::default());
    dispatcher.start().await;
    let mut events = dispatcher.subscribe();

    let first = dispatcher.send("chat", "message", None).await;
    let second = dispatcher.send("chat", "message", None).await;
    let third = dispatcher.send("chat", "message", None).await;

    gateway.connect("token").await.unwrap();

    for _ in 0..3 {
        wait_for_event(&mut events, 2_000, |e| {
            matches!(e, DispatchEvent::Acknowledged { .. })
        })
        .await
        .expect("all three should be acknowledged");
    }

    let ids: Vec<String> = server
        .received_messages()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec![first, second, third]);

    gateway.disconnect().await;
}

#[tokio::test]
async fn ack_timeout_retries_then_fails_exactly_once() {
    let server = MockGatewayServer::start().await;
    server.set_default_behavior(ServerBehavior::NeverAck);
    let config = DispatcherConfig {
        ack_timeout_ms: 40,
        max_retries: 3,
    };
    let (gateway, dispatcher) = connected_setup(&server, config).await;
    let mut events = dispatcher.subscribe();

    let id = dispatcher.send("chat", "message", None).await;

    // Original transmission + 3 retry-cycle resends all time out, then the
    // budget check drops the message.
    let collected = collect_events(&mut events, 600).await;

    let timeouts = collected
        .iter()
        .filter(|e| matches!(e, DispatchEvent::TimedOut { id: t } if *t == id))
        .count();
    assert_eq!(
        timeouts, 4,
        "Original attempt is free; 3 budgeted cycles follow"
    );

    let failures: Vec<_> = collected
        .iter()
        .filter(|e| matches!(e, DispatchEvent::Failed { envelope } if envelope.id == id))
        .collect();
    assert_eq!(failures.len(), 1, "Failed must fire exactly once");

    assert_eq!(dispatcher.queue_len().await, 0, "Dropped, not retained");
    assert_eq!(dispatcher.pending_len().await, 0);

    gateway.disconnect().await;
}

#[tokio::test]
async fn offline_send_resends_on_connect_then_fails_once_after_budget() {
    let server = MockGatewayServer::start().await;
    server.set_default_behavior(ServerBehavior::NeverAck);
    let config = DispatcherConfig {
        ack_timeout_ms: 40,
        max_retries: 3,
    };
    let gateway = Arc::new(GatewayClient::new(gateway_config(server.url())));
    let dispatcher = MessageDispatcher::new(gateway.clone(), config);
    dispatcher.start().await;
    let mut events = dispatcher.subscribe();

    let id = dispatcher.send("chat", "message", None).await;
    assert_eq!(dispatcher.queue_len().await, 1);

    gateway.connect("token").await.unwrap();

    let collected = collect_events(&mut events, 600).await;

    let failures = collected
        .iter()
        .filter(|e| matches!(e, DispatchEvent::Failed { envelope } if envelope.id == id))
        .count();
    assert_eq!(failures, 1, "Failed must fire exactly once");
    assert_eq!(dispatcher.queue_len().await, 0, "Dropped, not retained");
    assert_eq!(dispatcher.pending_len().await, 0);

    // The offline enqueue holds retries at 0, so the flush gets to send
    // attempts 1 through 3 before the budget check drops the message.
    assert_eq!(server.received_messages().len(), 3);

    gateway.disconnect().await;
}

#[tokio::test]
async fn transmit_failure_mid_flush_preserves_retry_budget() {
    let server = MockGatewayServer::start().await;
    server.set_default_behavior(ServerBehavior::NeverAck);
    let config = DispatcherConfig {
        ack_timeout_ms: 40,
        max_retries: 3,
    };
    let (gateway, dispatcher) = connected_setup(&server, config).await;
    let mut events = dispatcher.subscribe();

    let id = dispatcher.send("chat", "message", None).await;
    assert_eq!(dispatcher.pending_len().await, 1);

    // The write half dies while the state still reads connected; the ack
    // timeout then requeues the message and the flush hits the dead channel.
    gateway.sever_writer().await;
    sleep(Duration::from_millis(10)).await;

    wait_for_event(&mut events, 1_000, |e| {
        matches!(e, DispatchEvent::TimedOut { id: t } if *t == id)
    })
    .await
    .expect("ack timeout fires");

    // The failed resend must not burn through the budget: the message stays
    // queued for the next connection instead of being dropped.
    let collected = collect_events(&mut events, 300).await;
    assert!(
        !collected
            .iter()
            .any(|e| matches!(e, DispatchEvent::Failed { .. })),
        "A message that never reached the wire must not be dropped"
    );
    assert_eq!(dispatcher.queue_len().await, 1);

    gateway.disconnect().await;
}

#[tokio::test]
async fn disconnect_requeues_unacked_messages_for_resend() {
    let server = MockGatewayServer::start().await;
    server.queue_behavior(ServerBehavior::NeverAckDropAfter(80));
    let config = DispatcherConfig {
        ack_timeout_ms: 5_000,
        max_retries: 3,
    };
    let (gateway, dispatcher) = connected_setup(&server, config).await;
    let mut events = dispatcher.subscribe();

    let id = dispatcher.send("chat", "message", None).await;
    assert_eq!(dispatcher.pending_len().await, 1);

    // The first connection drops without ever acking; the message must
    // survive the disconnect and be delivered on the reconnect.
    let acked = wait_for_event(&mut events, 3_000, |e| {
        matches!(e, DispatchEvent::Acknowledged { id: acked } if *acked == id)
    })
    .await;
    assert!(acked.is_some(), "Message delivered after reconnect");

    let ids: Vec<String> = server
        .received_messages()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec![id.clone(), id], "Sent once per connection");

    // No ack timeout fired; this was the disconnect-requeue path.
    assert_eq!(dispatcher.pending_len().await, 0);
    assert_eq!(dispatcher.queue_len().await, 0);

    gateway.disconnect().await;
}
