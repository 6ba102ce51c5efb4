//! Acknowledgment-tracked message dispatcher.
//!
//! Sits on top of [`GatewayClient`] and provides reliable-ish delivery of
//! discrete outbound messages: every transmitted envelope waits for an ack
//! (an inbound envelope with the same id) under a timeout, and messages that
//! cannot be sent or are never acknowledged re-enter a FIFO retry queue that
//! is flushed on every reconnect.
//!
//! A message's original direct transmission is free: an ack timeout there
//! re-enqueues it with `retries = 0` and a fresh cycle begins. Once in a
//! retry cycle, timeout-requeues and disconnect-requeues share one counter,
//! which the flush increments on each resend.

use crate::{ConnectionState, Envelope, GatewayClient, GatewayEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long to wait for an acknowledgment, in milliseconds.
    pub ack_timeout_ms: u64,
    /// Retry budget per message once it enters the retry queue.
    pub max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            max_retries: 3,
        }
    }
}

/// Events emitted by the dispatcher.
///
/// There is no success/failure return path on `send`; these events are the
/// only delivery signals.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// The server acknowledged a message.
    Acknowledged { id: String },
    /// No ack arrived in time; the message was requeued.
    TimedOut { id: String },
    /// Retry budget exhausted; the message was dropped.
    Failed { envelope: Envelope },
}

/// A message waiting in the retry queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub envelope: Envelope,
    pub retries: u32,
}

struct PendingAck {
    envelope: Envelope,
    /// None for the original direct transmission, Some(n) once in a retry
    /// cycle.
    cycle: Option<u32>,
    timer: JoinHandle<()>,
}

/// Ack-tracked dispatcher over a shared gateway client.
#[derive(Clone)]
pub struct MessageDispatcher {
    config: DispatcherConfig,
    gateway: Arc<GatewayClient>,
    pending: Arc<Mutex<HashMap<String, PendingAck>>>,
    queue: Arc<Mutex<VecDeque<QueuedMessage>>>,
    /// Serializes flush passes; timeouts and reconnects may both trigger one.
    flush_lock: Arc<Mutex<()>>,
    flush_tx: mpsc::Sender<()>,
    event_tx: broadcast::Sender<DispatchEvent>,
    listener: Arc<Mutex<Option<JoinHandle<()>>>>,
    flusher: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl MessageDispatcher {
    /// Create a new dispatcher on top of the given gateway client.
    ///
    /// Timeout-triggered retries run on a dedicated flush task spawned here;
    /// the ack timers only nudge a capacity-1 channel, so bursts of timeouts
    /// coalesce into one pass.
    pub fn new(gateway: Arc<GatewayClient>, config: DispatcherConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (flush_tx, mut flush_rx) = mpsc::channel::<()>(1);

        let dispatcher = Self {
            config,
            gateway,
            pending: Arc::new(Mutex::new(HashMap::new())),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            flush_lock: Arc::new(Mutex::new(())),
            flush_tx,
            event_tx,
            listener: Arc::new(Mutex::new(None)),
            flusher: Arc::new(std::sync::Mutex::new(None)),
        };

        let flush_dispatcher = dispatcher.clone();
        let handle = tokio::spawn(async move {
            while flush_rx.recv().await.is_some() {
                flush_dispatcher.flush().await;
            }
        });
        if let Ok(mut slot) = dispatcher.flusher.lock() {
            *slot = Some(handle);
        }

        dispatcher
    }

    /// Start reacting to gateway events (queue flush on connect, requeue on
    /// disconnect, ack matching on inbound traffic).
    pub async fn start(&self) {
        let dispatcher = self.clone();
        let mut events = self.gateway.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(GatewayEvent::Connected) => dispatcher.flush().await,
                    Ok(GatewayEvent::Disconnected(_))
                    | Ok(GatewayEvent::CredentialRejected(_))
                    | Ok(GatewayEvent::Failed) => dispatcher.requeue_pending().await,
                    Ok(GatewayEvent::Message(envelope)) => {
                        dispatcher.handle_inbound(&envelope).await
                    }
                    Ok(GatewayEvent::Error(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Dispatcher lagged behind gateway events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(old) = self.listener.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Subscribe to dispatch events.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.event_tx.subscribe()
    }

    /// Current connection state of the underlying gateway.
    pub async fn connection_state(&self) -> ConnectionState {
        self.gateway.state().await
    }

    /// Check if the underlying gateway is connected.
    pub async fn is_connected(&self) -> bool {
        self.gateway.is_connected().await
    }

    /// Number of messages waiting in the retry queue.
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Number of messages awaiting acknowledgment.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Send a message. Never blocks on delivery.
    ///
    /// When disconnected the message is queued and sent on reconnect.
    /// Returns the message id; delivery confirmation arrives via
    /// [`DispatchEvent`], not the return value.
    pub async fn send(
        &self,
        namespace: &str,
        event: &str,
        payload: Option<serde_json::Value>,
    ) -> String {
        let envelope = Envelope::new(namespace, event, payload);
        let id = envelope.id.clone();

        if self.gateway.is_connected().await {
            if let Err(envelope) = self.transmit(envelope, None).await {
                self.queue
                    .lock()
                    .await
                    .push_back(QueuedMessage { envelope, retries: 0 });
            }
        } else {
            debug!(id = %id, "Not connected; queueing message");
            self.queue
                .lock()
                .await
                .push_back(QueuedMessage { envelope, retries: 0 });
        }

        id
    }

    /// Transmit an envelope and arm its ack-timeout timer.
    ///
    /// On a send failure the envelope is handed back so the caller can
    /// requeue it with the right retry count.
    async fn transmit(&self, envelope: Envelope, cycle: Option<u32>) -> Result<(), Envelope> {
        if let Err(e) = self.gateway.send(&envelope).await {
            warn!(id = %envelope.id, error = %e, "Transmit failed");
            return Err(envelope);
        }

        let id = envelope.id.clone();
        let dispatcher = self.clone();
        let timeout_id = id.clone();
        let timeout_ms = self.config.ack_timeout_ms;

        let timer = tokio::spawn(async move {
            sleep(Duration::from_millis(timeout_ms)).await;
            dispatcher.handle_ack_timeout(&timeout_id).await;
        });

        self.pending.lock().await.insert(
            id,
            PendingAck {
                envelope,
                cycle,
                timer,
            },
        );

        Ok(())
    }

    /// Match an inbound envelope against the pending-ack map.
    async fn handle_inbound(&self, envelope: &Envelope) {
        let entry = self.pending.lock().await.remove(&envelope.id);
        if let Some(entry) = entry {
            entry.timer.abort();
            debug!(id = %envelope.id, "Message acknowledged");
            let _ = self.event_tx.send(DispatchEvent::Acknowledged {
                id: envelope.id.clone(),
            });
        }
    }

    /// Ack-timeout fired for a pending message: requeue it.
    async fn handle_ack_timeout(&self, id: &str) {
        let entry = self.pending.lock().await.remove(id);
        let Some(entry) = entry else {
            // Acknowledged or requeued in the meantime.
            return;
        };

        let retries = entry.cycle.unwrap_or(0);
        warn!(id, retries, "Ack timeout; requeueing message");
        let _ = self.event_tx.send(DispatchEvent::TimedOut {
            id: id.to_string(),
        });

        self.queue.lock().await.push_back(QueuedMessage {
            envelope: entry.envelope,
            retries,
        });

        // Still connected: retry now instead of waiting for a reconnect.
        if self.gateway.is_connected().await {
            let _ = self.flush_tx.try_send(());
        }
    }

    /// Drain the retry queue in FIFO order while connected.
    async fn flush(&self) {
        let _guard = self.flush_lock.lock().await;

        loop {
            let next = self.queue.lock().await.pop_front();
            let Some(message) = next else { break };

            if !self.gateway.is_connected().await {
                self.queue.lock().await.push_front(message);
                break;
            }

            if message.retries >= self.config.max_retries {
                warn!(
                    id = %message.envelope.id,
                    max_retries = self.config.max_retries,
                    "Message exceeded retry budget; dropping"
                );
                let _ = self.event_tx.send(DispatchEvent::Failed {
                    envelope: message.envelope,
                });
                continue;
            }

            let attempt = message.retries + 1;
            debug!(id = %message.envelope.id, attempt, "Resending queued message");
            if let Err(envelope) = self.transmit(message.envelope, Some(attempt)).await {
                // The writer can die before the reader observes the closed
                // stream; keep the prior count and let the disconnect
                // requeue path resume this message on reconnect.
                self.queue.lock().await.push_front(QueuedMessage {
                    envelope,
                    retries: message.retries,
                });
                break;
            }
        }
    }

    /// Connection lost with messages awaiting ack: cancel their timers and
    /// return them to the queue, preserving their cycle counts.
    async fn requeue_pending(&self) {
        let entries: Vec<PendingAck> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        if entries.is_empty() {
            return;
        }

        let mut entries = entries;
        entries.sort_by_key(|entry| entry.envelope.timestamp);

        let count = entries.len();
        let mut queue = self.queue.lock().await;
        for entry in entries {
            entry.timer.abort();
            queue.push_back(QueuedMessage {
                retries: entry.cycle.unwrap_or(0),
                envelope: entry.envelope,
            });
        }
        info!(count, "Requeued in-flight messages after disconnect");
    }

    /// Stop the event listener, the flush task, and all pending-ack timers.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        if let Ok(mut slot) = self.flusher.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            entry.timer.abort();
        }
    }
}
