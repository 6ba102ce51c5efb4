//! Durable offline action queue.
//!
//! Never loses a user-initiated mutation to a temporary disconnection: every
//! queued action is persisted before anything else happens, replayed serially
//! in enqueue order once connectivity returns, and retained in a terminal
//! `failed` state when its retry budget runs out. Completed actions are
//! deleted, never retained.

use crate::{ActionStatus, PendingAction, QueueResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_storage::{KvStorage, StorageKeys};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Executes one action's network operation.
///
/// This is the boundary to application business logic; the queue never
/// interprets payloads itself.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, action: &PendingAction) -> anyhow::Result<()>;
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retry budget per action.
    pub max_retries: u32,
    /// Delay before a follow-up pass when transiently failed actions remain.
    pub retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

/// Events emitted by the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// The number of queued actions changed.
    SizeChanged(usize),
    /// An action executed successfully and was removed.
    ActionCompleted { id: String },
    /// An action exhausted its retry budget and turned terminal.
    ActionFailed { id: String, error: String },
}

/// Durable offline action queue with a serial sync worker.
///
/// Sync passes run on a dedicated worker task fed by a capacity-1 trigger
/// channel: passes never run concurrently, and triggers arriving mid-pass
/// coalesce instead of getting lost.
#[derive(Clone)]
pub struct OfflineActionQueue {
    config: QueueConfig,
    storage: Arc<dyn KvStorage>,
    handler: Arc<dyn ActionHandler>,
    actions: Arc<Mutex<Vec<PendingAction>>>,
    online: Arc<AtomicBool>,
    syncing: Arc<AtomicBool>,
    trigger_tx: mpsc::Sender<()>,
    worker: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl OfflineActionQueue {
    /// Create a queue, loading any persisted actions from storage.
    ///
    /// Actions stuck in `syncing` from a crash mid-pass are reset to
    /// `pending` before the first pass.
    pub fn new(
        storage: Arc<dyn KvStorage>,
        handler: Arc<dyn ActionHandler>,
        config: QueueConfig,
    ) -> QueueResult<Self> {
        let mut actions: Vec<PendingAction> = match storage.get(StorageKeys::OFFLINE_ACTIONS)? {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };

        let mut recovered = 0;
        for action in actions
            .iter_mut()
            .filter(|a| a.status == ActionStatus::Syncing)
        {
            action.status = ActionStatus::Pending;
            recovered += 1;
        }
        if recovered > 0 {
            info!(count = recovered, "Recovered in-flight actions to pending");
            storage.set(
                StorageKeys::OFFLINE_ACTIONS,
                &serde_json::to_string(&actions)?,
            )?;
        }
        if !actions.is_empty() {
            debug!(count = actions.len(), "Loaded persisted actions");
        }

        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
        let (event_tx, _) = broadcast::channel(256);

        let queue = Self {
            config,
            storage,
            handler,
            actions: Arc::new(Mutex::new(actions)),
            online: Arc::new(AtomicBool::new(false)),
            syncing: Arc::new(AtomicBool::new(false)),
            trigger_tx,
            worker: Arc::new(std::sync::Mutex::new(None)),
            event_tx,
        };

        let worker_queue = queue.clone();
        let handle = tokio::spawn(async move {
            while trigger_rx.recv().await.is_some() {
                worker_queue.run_sync_pass().await;
            }
        });
        if let Ok(mut slot) = queue.worker.lock() {
            *slot = Some(handle);
        }

        Ok(queue)
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    /// Update the connectivity flag. Going online triggers a sync pass.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if online {
            self.trigger();
        }
    }

    /// Current connectivity flag.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// True while a sync pass is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Request a sync pass now (no-op while offline).
    pub fn sync_now(&self) {
        if self.is_online() {
            self.trigger();
        }
    }

    /// Number of actions currently in the queue (any status).
    pub async fn len(&self) -> usize {
        self.actions.lock().await.len()
    }

    /// True when no actions are queued.
    pub async fn is_empty(&self) -> bool {
        self.actions.lock().await.is_empty()
    }

    /// Snapshot of all queued actions in queue order.
    pub async fn actions(&self) -> Vec<PendingAction> {
        self.actions.lock().await.clone()
    }

    /// Snapshot of terminally failed actions.
    pub async fn failed_actions(&self) -> Vec<PendingAction> {
        self.actions
            .lock()
            .await
            .iter()
            .filter(|a| a.status == ActionStatus::Failed)
            .cloned()
            .collect()
    }

    /// Queue a mutating action for eventual delivery.
    ///
    /// The action is persisted before this returns; when online, a sync
    /// pass is triggered immediately.
    pub async fn queue_action(
        &self,
        action_type: &str,
        payload: serde_json::Value,
    ) -> QueueResult<String> {
        let action = PendingAction::new(action_type, payload, self.config.max_retries);
        let id = action.id.clone();

        let size = {
            let mut actions = self.actions.lock().await;
            actions.push(action);
            actions.len()
        };
        self.persist().await?;

        debug!(id = %id, action_type, size, "Queued action");
        let _ = self.event_tx.send(QueueEvent::SizeChanged(size));

        if self.is_online() {
            self.trigger();
        }

        Ok(id)
    }

    /// Reset all failed actions to pending with a fresh retry budget and
    /// trigger a sync pass when online.
    pub async fn retry_failed_actions(&self) -> QueueResult<()> {
        let reset = {
            let mut actions = self.actions.lock().await;
            let mut reset = 0;
            for action in actions
                .iter_mut()
                .filter(|a| a.status == ActionStatus::Failed)
            {
                action.status = ActionStatus::Pending;
                action.retries = 0;
                action.error = None;
                reset += 1;
            }
            reset
        };

        if reset > 0 {
            self.persist().await?;
            info!(count = reset, "Reset failed actions for retry");
            if self.is_online() {
                self.trigger();
            }
        }

        Ok(())
    }

    /// Drop all failed actions. Irreversible.
    pub async fn clear_failed_actions(&self) -> QueueResult<()> {
        let size = {
            let mut actions = self.actions.lock().await;
            actions.retain(|a| a.status != ActionStatus::Failed);
            actions.len()
        };
        self.persist().await?;
        let _ = self.event_tx.send(QueueEvent::SizeChanged(size));
        Ok(())
    }

    /// Drop every queued action. Irreversible.
    pub async fn clear_all_actions(&self) -> QueueResult<()> {
        self.actions.lock().await.clear();
        self.persist().await?;
        let _ = self.event_tx.send(QueueEvent::SizeChanged(0));
        Ok(())
    }

    /// Stop the sync worker.
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.worker.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    fn trigger(&self) {
        // Capacity-1 channel: a pending trigger already covers this request.
        let _ = self.trigger_tx.try_send(());
    }

    /// One serial sync pass. Each action is attempted at most once per pass;
    /// actions enqueued mid-pass are picked up before the pass ends.
    async fn run_sync_pass(&self) {
        self.syncing.store(true, Ordering::SeqCst);
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            if !self.is_online() {
                debug!("Connectivity lost; stopping sync pass");
                break;
            }

            let next = {
                let actions = self.actions.lock().await;
                actions
                    .iter()
                    .find(|a| a.status == ActionStatus::Pending && !attempted.contains(&a.id))
                    .map(|a| a.id.clone())
            };
            let Some(id) = next else { break };
            attempted.insert(id.clone());

            let action = {
                let mut actions = self.actions.lock().await;
                let Some(action) = actions.iter_mut().find(|a| a.id == id) else {
                    continue;
                };
                action.status = ActionStatus::Syncing;
                action.clone()
            };
            if let Err(e) = self.persist().await {
                warn!(error = %e, "Failed to persist queue state");
            }

            match self.handler.execute(&action).await {
                Ok(()) => {
                    let size = {
                        let mut actions = self.actions.lock().await;
                        actions.retain(|a| a.id != id);
                        actions.len()
                    };
                    info!(id = %id, action_type = %action.action_type, "Action completed");
                    let _ = self.event_tx.send(QueueEvent::ActionCompleted { id });
                    let _ = self.event_tx.send(QueueEvent::SizeChanged(size));
                }
                Err(e) => {
                    let failed = {
                        let mut actions = self.actions.lock().await;
                        let Some(action) = actions.iter_mut().find(|a| a.id == id) else {
                            continue;
                        };
                        action.retries += 1;
                        if action.retries >= action.max_retries {
                            action.status = ActionStatus::Failed;
                            action.error = Some(e.to_string());
                            true
                        } else {
                            action.status = ActionStatus::Pending;
                            false
                        }
                    };

                    if failed {
                        warn!(id = %id, error = %e, "Action failed terminally");
                        let _ = self.event_tx.send(QueueEvent::ActionFailed {
                            id,
                            error: e.to_string(),
                        });
                    } else {
                        debug!(id = %id, error = %e, "Action failed; will retry next pass");
                    }
                }
            }

            if let Err(e) = self.persist().await {
                warn!(error = %e, "Failed to persist queue state");
            }
        }

        self.syncing.store(false, Ordering::SeqCst);

        // Transiently failed actions went back to pending; reschedule so
        // their replay does not wait for the next external nudge.
        let has_pending = self
            .actions
            .lock()
            .await
            .iter()
            .any(|a| a.status == ActionStatus::Pending);
        if has_pending && self.is_online() {
            let queue = self.clone();
            let delay = self.config.retry_delay_ms;
            tokio::spawn(async move {
                sleep(Duration::from_millis(delay)).await;
                if queue.is_online() {
                    queue.trigger();
                }
            });
        }
    }

    /// Persist the full action list under the fixed storage key.
    async fn persist(&self) -> QueueResult<()> {
        let json = {
            let actions = self.actions.lock().await;
            serde_json::to_string(&*actions)?
        };
        self.storage.set(StorageKeys::OFFLINE_ACTIONS, &json)?;
        Ok(())
    }
}
