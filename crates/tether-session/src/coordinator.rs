//! Session composition root.
//!
//! Owns one of each component, wires their event channels together, and
//! exposes a single event surface. The wiring rules live here and nowhere
//! else: connectivity drives the offline queue, credential rejection drives
//! renewal, renewal success drives reconnection, and terminal renewal
//! failure tears the session down.

use crate::{SessionError, SessionResult};
use std::sync::Arc;
use tether_api::{ApiClient, ApiConfig, CredentialEvent, Credentials, RetryPolicy};
use tether_core::Config;
use tether_gateway::{
    ConnectionState, DispatchEvent, DispatcherConfig, GatewayClient, GatewayConfig, GatewayEvent,
    MessageDispatcher,
};
use tether_queue::{ActionHandler, OfflineActionQueue, QueueConfig, QueueEvent};
use tether_storage::KvStorage;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Events surfaced by the session, re-broadcast from every component.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Gateway(GatewayEvent),
    Dispatch(DispatchEvent),
    Queue(QueueEvent),
    Credential(CredentialEvent),
    /// Credential renewal failed terminally and the session was torn down.
    AuthFailure,
}

/// Composition root owning the api client, gateway, dispatcher and queue.
pub struct SessionCoordinator {
    api: ApiClient,
    gateway: Arc<GatewayClient>,
    dispatcher: MessageDispatcher,
    queue: OfflineActionQueue,
    event_tx: broadcast::Sender<SessionEvent>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionCoordinator {
    /// Build every component from one config plus the injected storage
    /// backend and action handler. Must run inside a tokio runtime; the
    /// queue spawns its sync worker immediately.
    pub fn new(
        config: &Config,
        storage: Arc<dyn KvStorage>,
        handler: Arc<dyn ActionHandler>,
    ) -> SessionResult<Self> {
        let api = ApiClient::new(ApiConfig {
            base_url: config.api_url()?,
            refresh_path: config.refresh_path.clone(),
            csrf_path: config.csrf_path.clone(),
            timeout_ms: config.request_timeout_ms,
            retry: RetryPolicy {
                attempts: config.retry_attempts,
                delay_ms: config.retry_delay_ms,
                exponential: true,
            },
            mode: tether_api::CredentialMode::Bearer,
        })?;

        let gateway = Arc::new(GatewayClient::new(GatewayConfig {
            url: config.gateway_url.clone(),
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            reconnect_base_delay_ms: config.reconnect_base_delay_ms,
            reconnect_max_delay_ms: config.reconnect_max_delay_ms,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }));

        let dispatcher = MessageDispatcher::new(
            gateway.clone(),
            DispatcherConfig {
                ack_timeout_ms: config.ack_timeout_ms,
                max_retries: config.message_max_retries,
            },
        );

        let queue = OfflineActionQueue::new(
            storage,
            handler,
            QueueConfig {
                max_retries: config.action_max_retries,
                retry_delay_ms: config.action_retry_delay_ms,
            },
        )?;

        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            api,
            gateway,
            dispatcher,
            queue,
            event_tx,
            forwarders: Mutex::new(Vec::new()),
        })
    }

    /// Start the dispatcher and the event forwarders. Idempotent.
    pub async fn start(&self) {
        self.dispatcher.start().await;

        let mut forwarders = self.forwarders.lock().await;
        if !forwarders.is_empty() {
            return;
        }

        forwarders.push(tokio::spawn(forward_gateway(
            self.gateway.clone(),
            self.api.clone(),
            self.queue.clone(),
            self.event_tx.clone(),
        )));
        forwarders.push(tokio::spawn(forward_dispatch(
            self.dispatcher.subscribe(),
            self.event_tx.clone(),
        )));
        forwarders.push(tokio::spawn(forward_queue(
            self.queue.subscribe(),
            self.event_tx.clone(),
        )));
        forwarders.push(tokio::spawn(forward_credentials(
            self.api.clone(),
            self.gateway.clone(),
            self.queue.clone(),
            self.event_tx.clone(),
        )));

        info!("Session coordinator started");
    }

    /// Subscribe to the unified session event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// The api client.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// The gateway client.
    pub fn gateway(&self) -> &Arc<GatewayClient> {
        &self.gateway
    }

    /// The message dispatcher.
    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    /// The offline action queue.
    pub fn queue(&self) -> &OfflineActionQueue {
        &self.queue
    }

    /// Hand the session a fresh credential set and propagate the access
    /// token to the gateway.
    pub async fn set_credentials(&self, credentials: Credentials) {
        if let Some(token) = credentials.access_token.clone() {
            self.gateway.set_credential(&token).await;
        }
        self.api.set_credentials(credentials);
    }

    /// Connect the gateway using the api client's current access token.
    pub async fn connect(&self) -> SessionResult<()> {
        let token = self.api.access_token().unwrap_or_default();
        self.gateway.connect(&token).await.map_err(SessionError::from)
    }

    /// Send an event-style message through the dispatcher.
    pub async fn send(
        &self,
        namespace: &str,
        event: &str,
        payload: Option<serde_json::Value>,
    ) -> String {
        self.dispatcher.send(namespace, event, payload).await
    }

    /// Queue a mutating action for eventual delivery.
    pub async fn queue_action(
        &self,
        action_type: &str,
        payload: serde_json::Value,
    ) -> SessionResult<String> {
        self.queue
            .queue_action(action_type, payload)
            .await
            .map_err(SessionError::from)
    }

    /// Tear everything down deterministically.
    pub async fn shutdown(&self) {
        self.gateway.disconnect().await;
        self.dispatcher.shutdown().await;
        self.queue.shutdown();

        let mut forwarders = self.forwarders.lock().await;
        for handle in forwarders.drain(..) {
            handle.abort();
        }
        info!("Session coordinator shut down");
    }
}

/// Gateway events drive queue connectivity and credential renewal.
async fn forward_gateway(
    gateway: Arc<GatewayClient>,
    api: ApiClient,
    queue: OfflineActionQueue,
    event_tx: broadcast::Sender<SessionEvent>,
) {
    let mut rx = gateway.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                match &event {
                    GatewayEvent::Connected => queue.set_online(true),
                    GatewayEvent::Disconnected(_) | GatewayEvent::Failed => {
                        queue.set_online(false);
                    }
                    GatewayEvent::CredentialRejected(code) => {
                        queue.set_online(false);
                        warn!(code = *code, "Gateway rejected credential; renewing");
                        // Single-flight: overlapping rejections share one
                        // renewal. Reconnection happens on Refreshed.
                        if let Err(e) = api.refresh_credential().await {
                            warn!(error = %e, "Credential renewal failed");
                        }
                    }
                    _ => {}
                }
                let _ = event_tx.send(SessionEvent::Gateway(event));
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Gateway event forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn forward_dispatch(
    mut rx: broadcast::Receiver<DispatchEvent>,
    event_tx: broadcast::Sender<SessionEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let _ = event_tx.send(SessionEvent::Dispatch(event));
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Dispatch event forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn forward_queue(
    mut rx: broadcast::Receiver<QueueEvent>,
    event_tx: broadcast::Sender<SessionEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let _ = event_tx.send(SessionEvent::Queue(event));
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Queue event forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Credential events drive the gateway: a renewed token reconnects a
/// disconnected session; a terminal failure tears it down.
async fn forward_credentials(
    api: ApiClient,
    gateway: Arc<GatewayClient>,
    queue: OfflineActionQueue,
    event_tx: broadcast::Sender<SessionEvent>,
) {
    let mut rx = api.subscribe();
    loop {
        match rx.recv().await {
            Ok(CredentialEvent::Refreshed) => {
                if let Some(token) = api.access_token() {
                    gateway.set_credential(&token).await;
                    if gateway.state().await == ConnectionState::Disconnected {
                        info!("Reconnecting with renewed credential");
                        if let Err(e) = gateway.connect(&token).await {
                            warn!(error = %e, "Reconnect after renewal failed");
                        }
                    }
                }
                let _ = event_tx.send(SessionEvent::Credential(CredentialEvent::Refreshed));
            }
            Ok(CredentialEvent::Cleared) => {
                warn!("Credential renewal failed terminally; tearing down session");
                gateway.disconnect().await;
                queue.set_online(false);
                let _ = event_tx.send(SessionEvent::Credential(CredentialEvent::Cleared));
                let _ = event_tx.send(SessionEvent::AuthFailure);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Credential event forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
