//! WebSocket gateway client.
//!
//! Owns one live connection and its lifecycle: the state machine, the
//! heartbeat timer, and exponential-backoff reconnection. Close codes in the
//! reserved 4001-4003 range mean the server rejected the credential; those
//! bypass the generic backoff path so the coordinator can refresh the token
//! instead of retrying a credential that will never be accepted.

use crate::{Envelope, GatewayError, GatewayResult};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Base reconnect delay in milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Maximum reconnect delay in milliseconds.
    pub reconnect_max_delay_ms: u64,
    /// Maximum reconnect attempts.
    pub max_reconnect_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "wss://gateway.tether.sh/ws".to_string(),
            heartbeat_interval_ms: 30_000,
            reconnect_base_delay_ms: 3_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the gateway client.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Connected to the gateway.
    Connected,
    /// Disconnected from the gateway.
    Disconnected(Option<String>),
    /// The server closed the connection with an auth-range code.
    CredentialRejected(u16),
    /// Reconnect attempts exhausted; the client gave up.
    Failed,
    /// Received a message.
    Message(Envelope),
    /// Transport-level error occurred.
    Error(String),
}

/// Returns true for close codes in the reserved credential-rejected range.
pub fn is_auth_close_code(code: u16) -> bool {
    (4001..=4003).contains(&code)
}

/// Reconnect delay for the given attempt (1-based): `base * 2^(attempt-1)`,
/// capped.
pub fn reconnect_delay_ms(base_ms: u64, cap_ms: u64, attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << exp).min(cap_ms)
}

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Default)]
struct TaskHandles {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl TaskHandles {
    /// Abort tasks tied to one connection instance.
    fn abort_connection(&mut self) {
        for handle in [
            self.writer.take(),
            self.heartbeat.take(),
            self.reader.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

/// WebSocket gateway client with automatic reconnection.
#[derive(Clone)]
pub struct GatewayClient {
    config: GatewayConfig,
    state: Arc<RwLock<ConnectionState>>,
    credential: Arc<RwLock<Option<String>>>,
    sender: Arc<Mutex<Option<mpsc::Sender<Message>>>>,
    event_tx: broadcast::Sender<GatewayEvent>,
    reconnect_attempts: Arc<RwLock<u32>>,
    tasks: Arc<Mutex<TaskHandles>>,
    reconnect_tx: mpsc::Sender<u64>,
    supervisor: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl GatewayClient {
    /// Create a new gateway client with the given configuration.
    ///
    /// Reconnect timers run on a dedicated supervisor task spawned here; the
    /// backoff path only hands it a delay over a capacity-1 channel, so at
    /// most one timer is ever outstanding.
    pub fn new(config: GatewayConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (reconnect_tx, mut reconnect_rx) = mpsc::channel::<u64>(1);

        let client = Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            credential: Arc::new(RwLock::new(None)),
            sender: Arc::new(Mutex::new(None)),
            event_tx,
            reconnect_attempts: Arc::new(RwLock::new(0)),
            tasks: Arc::new(Mutex::new(TaskHandles::default())),
            reconnect_tx,
            supervisor: Arc::new(std::sync::Mutex::new(None)),
        };

        let supervisor_client = client.clone();
        let handle = tokio::spawn(async move {
            while let Some(delay_ms) = reconnect_rx.recv().await {
                sleep(Duration::from_millis(delay_ms)).await;
                // disconnect() or a manual connect() may have raced the timer.
                if *supervisor_client.state.read().await != ConnectionState::Reconnecting {
                    continue;
                }
                if supervisor_client.credential.read().await.is_none() {
                    continue;
                }
                if let Err(e) = supervisor_client.do_connect().await {
                    error!(error = %e, "Reconnect attempt failed");
                }
            }
        });
        if let Ok(mut slot) = client.supervisor.lock() {
            *slot = Some(handle);
        }

        client
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(GatewayConfig::default())
    }

    /// Subscribe to gateway events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.event_tx.subscribe()
    }

    /// Get the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Check if connected.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Current value of the generic reconnect-attempt counter.
    pub async fn reconnect_attempts(&self) -> u32 {
        *self.reconnect_attempts.read().await
    }

    /// Replace the credential used by future (re)connects.
    ///
    /// This is how renewed tokens reach the transport.
    pub async fn set_credential(&self, credential: &str) {
        *self.credential.write().await = Some(credential.to_string());
    }

    /// Connect to the gateway with the given credential.
    ///
    /// No-op when already connected or connecting. An empty credential is
    /// logged and ignored without a state transition.
    pub async fn connect(&self, credential: &str) -> GatewayResult<()> {
        let current = *self.state.read().await;
        if current == ConnectionState::Connected || current == ConnectionState::Connecting {
            debug!("Already connecting or connected");
            return Ok(());
        }

        if credential.trim().is_empty() {
            warn!("No credential provided; not connecting");
            return Ok(());
        }

        *self.credential.write().await = Some(credential.to_string());

        self.do_connect().await
    }

    /// Internal connect implementation, shared with the reconnect path.
    async fn do_connect(&self) -> GatewayResult<()> {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Connected || *state == ConnectionState::Connecting {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let credential = self
            .credential
            .read()
            .await
            .clone()
            .ok_or(GatewayError::MissingCredential)?;

        let endpoint = endpoint_url(&self.config.url, &credential)?;
        info!(url = %self.config.url, "Connecting to gateway");

        let ws_stream = match connect_async(endpoint.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!(error = %e, "Gateway connection failed");
                *self.state.write().await = ConnectionState::Disconnected;
                let _ = self.event_tx.send(GatewayEvent::Error(e.to_string()));
                self.schedule_reconnect().await;
                return Err(e.into());
            }
        };

        let (mut write, read) = ws_stream.split();
        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(100);
        *self.sender.lock().await = Some(msg_tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let heartbeat_tx = msg_tx;
        let heartbeat_interval = self.config.heartbeat_interval_ms;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(heartbeat_interval));
            // First tick fires immediately; the connection is fresh then.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let hb = match Envelope::heartbeat().to_json() {
                    Ok(json) => json,
                    Err(_) => break,
                };
                if heartbeat_tx.send(Message::Text(hb.into())).await.is_err() {
                    break;
                }
            }
        });

        let client = self.clone();
        let reader = tokio::spawn(async move {
            client.read_loop(read).await;
        });

        {
            let mut tasks = self.tasks.lock().await;
            // Stale handles from a previous connection are finished by now;
            // abort is a no-op on those.
            if let Some(old) = tasks.writer.replace(writer) {
                old.abort();
            }
            if let Some(old) = tasks.heartbeat.replace(heartbeat) {
                old.abort();
            }
            tasks.reader = Some(reader);
        }

        *self.state.write().await = ConnectionState::Connected;
        *self.reconnect_attempts.write().await = 0;
        info!("Connected to gateway");
        let _ = self.event_tx.send(GatewayEvent::Connected);

        Ok(())
    }

    /// Read loop for one connection instance; runs until the stream ends.
    async fn read_loop(&self, mut read: WsReader) {
        let mut close_code: Option<u16> = None;
        let mut close_reason: Option<String> = None;

        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match Envelope::from_json(&text) {
                    Ok(envelope) => {
                        let _ = self.event_tx.send(GatewayEvent::Message(envelope));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to parse gateway message");
                    }
                },
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        close_code = Some(u16::from(frame.code));
                        if !frame.reason.is_empty() {
                            close_reason = Some(frame.reason.to_string());
                        }
                    }
                    info!(code = ?close_code, "Gateway connection closed");
                    break;
                }
                Ok(Message::Ping(data)) => {
                    if let Some(sender) = self.sender.lock().await.as_ref() {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "WebSocket error");
                    let _ = self.event_tx.send(GatewayEvent::Error(e.to_string()));
                    break;
                }
            }
        }

        self.handle_stream_end(close_code, close_reason).await;
    }

    /// Route a finished stream to the right follow-up path.
    async fn handle_stream_end(&self, close_code: Option<u16>, close_reason: Option<String>) {
        // An explicit disconnect() already cleaned up and must not reconnect.
        if *self.state.read().await == ConnectionState::Disconnected {
            return;
        }

        {
            let mut tasks = self.tasks.lock().await;
            for handle in [tasks.writer.take(), tasks.heartbeat.take()]
                .into_iter()
                .flatten()
            {
                handle.abort();
            }
            // Running inside the reader task itself; just drop the handle.
            tasks.reader = None;
        }
        *self.sender.lock().await = None;
        *self.state.write().await = ConnectionState::Disconnected;

        match close_code {
            Some(1000) => {
                let _ = self.event_tx.send(GatewayEvent::Disconnected(close_reason));
            }
            Some(code) if is_auth_close_code(code) => {
                warn!(code, "Gateway rejected credential");
                let _ = self.event_tx.send(GatewayEvent::CredentialRejected(code));
            }
            _ => {
                let _ = self.event_tx.send(GatewayEvent::Disconnected(close_reason));
                self.schedule_reconnect().await;
            }
        }
    }

    /// Bump the attempt counter and schedule a backoff reconnect, or give up.
    async fn schedule_reconnect(&self) {
        let attempt = {
            let mut attempts = self.reconnect_attempts.write().await;
            *attempts += 1;
            *attempts
        };

        if attempt > self.config.max_reconnect_attempts {
            warn!(
                max_attempts = self.config.max_reconnect_attempts,
                "Max reconnect attempts reached; giving up"
            );
            *self.state.write().await = ConnectionState::Disconnected;
            let _ = self.event_tx.send(GatewayEvent::Failed);
            return;
        }

        *self.state.write().await = ConnectionState::Reconnecting;

        let delay = reconnect_delay_ms(
            self.config.reconnect_base_delay_ms,
            self.config.reconnect_max_delay_ms,
            attempt,
        );
        info!(attempt, delay_ms = delay, "Scheduling reconnect");
        let _ = self.reconnect_tx.try_send(delay);
    }

    /// Disconnect from the gateway. Idempotent.
    pub async fn disconnect(&self) {
        // State first: a reader observing the closed stream afterwards will
        // see Disconnected and skip the reconnect path, and a reconnect
        // timer firing later bails on the state check.
        *self.state.write().await = ConnectionState::Disconnected;
        self.tasks.lock().await.abort_connection();
        *self.sender.lock().await = None;
        *self.reconnect_attempts.write().await = 0;

        info!("Disconnected from gateway");
        let _ = self
            .event_tx
            .send(GatewayEvent::Disconnected(Some("client disconnect".to_string())));
    }

    /// Abort the writer task without touching the state, reproducing the
    /// window where the write half is gone but the reader has not yet
    /// observed the closed stream.
    #[cfg(test)]
    pub(crate) async fn sever_writer(&self) {
        if let Some(handle) = self.tasks.lock().await.writer.take() {
            handle.abort();
        }
    }

    /// Send an envelope over the live connection.
    pub async fn send(&self, envelope: &Envelope) -> GatewayResult<()> {
        let sender = self.sender.lock().await;
        let sender = sender.as_ref().ok_or(GatewayError::NotConnected)?;

        let json = envelope.to_json()?;
        sender
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| GatewayError::Send(e.to_string()))
    }
}

/// Build the connection endpoint with the credential as a query parameter,
/// so it travels on transports without custom-header support.
fn endpoint_url(base: &str, credential: &str) -> GatewayResult<Url> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut().append_pair("token", credential);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_config_default() {
        let config = GatewayConfig::default();
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.reconnect_base_delay_ms, 3_000);
        assert_eq!(config.reconnect_max_delay_ms, 30_000);
        assert_eq!(config.max_reconnect_attempts, 10);
    }

    #[test]
    fn test_backoff_sequence() {
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| reconnect_delay_ms(3_000, 30_000, attempt))
            .collect();
        assert_eq!(delays, vec![3_000, 6_000, 12_000, 24_000, 30_000, 30_000]);
    }

    #[test]
    fn test_backoff_never_overflows() {
        assert_eq!(reconnect_delay_ms(3_000, 30_000, u32::MAX), 30_000);
        assert_eq!(reconnect_delay_ms(u64::MAX, 30_000, 10), 30_000);
        assert_eq!(reconnect_delay_ms(3_000, 30_000, 0), 3_000);
    }

    #[test]
    fn test_auth_close_code_range() {
        assert!(is_auth_close_code(4001));
        assert!(is_auth_close_code(4002));
        assert!(is_auth_close_code(4003));
        assert!(!is_auth_close_code(4000));
        assert!(!is_auth_close_code(4004));
        assert!(!is_auth_close_code(1006));
        assert!(!is_auth_close_code(1000));
    }

    #[test]
    fn test_endpoint_url_attaches_token() {
        let url = endpoint_url("wss://gateway.example.com/ws", "secret-token").unwrap();
        assert_eq!(url.as_str(), "wss://gateway.example.com/ws?token=secret-token");
    }

    #[test]
    fn test_endpoint_url_encodes_token() {
        let url = endpoint_url("wss://gateway.example.com/ws", "a b&c").unwrap();
        assert!(url.query().unwrap().contains("token=a+b%26c"));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = GatewayClient::with_defaults();
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert!(!client.is_connected().await);
        assert_eq!(client.reconnect_attempts().await, 0);
    }

    #[tokio::test]
    async fn test_connect_with_empty_credential_is_noop() {
        let client = GatewayClient::with_defaults();

        client.connect("").await.unwrap();
        assert_eq!(client.state().await, ConnectionState::Disconnected);

        client.connect("   ").await.unwrap();
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_when_disconnected_fails() {
        let client = GatewayClient::with_defaults();
        let envelope = Envelope::new("chat", "message", None);

        let result = client.send(&envelope).await;
        assert!(matches!(result, Err(GatewayError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = GatewayClient::with_defaults();
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }
}
