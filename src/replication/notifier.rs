//! Sync-Set Change Notification
//!
//! Fan-out of in-sync-set proposals to registered listeners (the external
//! supervisor's hooks). Notifications go through one bounded channel drained
//! by a single worker task, so listeners observe proposals in the order they
//! were made and a slow listener never blocks a channel I/O path.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Listener invoked with each proposed in-sync set.
pub type SyncSetListener = Box<dyn Fn(&HashSet<String>) + Send + Sync>;

/// Queue depth before notifiers back-pressure.
const NOTIFY_QUEUE_DEPTH: usize = 64;

/// Serialized listener fan-out worker.
pub struct SyncSetNotifier {
    tx: mpsc::Sender<HashSet<String>>,
    shutdown: watch::Sender<bool>,
    listeners: Arc<RwLock<Vec<SyncSetListener>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncSetNotifier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listeners: Arc<RwLock<Vec<SyncSetListener>>> = Arc::new(RwLock::new(Vec::new()));

        let worker = tokio::spawn(Self::worker_task(rx, shutdown_rx, Arc::clone(&listeners)));

        Self {
            tx,
            shutdown: shutdown_tx,
            listeners,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register a listener. Listeners registered after a notification was
    /// queued may still observe it; ordering between notifications is
    /// always preserved.
    pub async fn register(&self, listener: SyncSetListener) {
        self.listeners.write().await.push(listener);
    }

    /// Queue a changed set for delivery.
    pub async fn notify(&self, new_set: HashSet<String>) {
        if self.tx.send(new_set).await.is_err() {
            tracing::warn!("Sync-set notifier is shut down, dropping notification");
        }
    }

    /// Signal shutdown, drain queued notifications, and join the worker.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }

    async fn worker_task(
        mut rx: mpsc::Receiver<HashSet<String>>,
        mut shutdown_rx: watch::Receiver<bool>,
        listeners: Arc<RwLock<Vec<SyncSetListener>>>,
    ) {
        loop {
            tokio::select! {
                maybe_set = rx.recv() => {
                    match maybe_set {
                        Some(set) => Self::deliver(&listeners, &set).await,
                        None => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        // Drain whatever is already queued, then exit
                        while let Ok(set) = rx.try_recv() {
                            Self::deliver(&listeners, &set).await;
                        }
                        break;
                    }
                }
            }
        }
        tracing::debug!("Sync-set notifier stopped");
    }

    async fn deliver(listeners: &RwLock<Vec<SyncSetListener>>, set: &HashSet<String>) {
        let listeners = listeners.read().await;
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(set))).is_err() {
                tracing::error!("Sync-set listener panicked, continuing with next listener");
            }
        }
    }
}

impl Default for SyncSetNotifier {
    fn default() -> Self {
        Self::new()
    }
}
