use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use courier_api::{BoxFuture, Message, StorageBackend, StorageError};

use crate::store::{BatchStore, PendingOp};

/// Flush discipline for a [`BatchedStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Pending operations that wake the flusher early.
    pub batch_size: usize,
    /// Upper bound on how long an acknowledged write stays queued.
    pub flush_interval: Duration,
    /// Hard cap on queued operations. New writes are refused beyond it and a
    /// failed batch that would not fit back is dropped.
    pub max_pending: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            max_pending: 100_000,
        }
    }
}

#[derive(Default)]
struct Pending {
    queued: Vec<PendingOp>,
    /// Batch currently being executed; still visible to reads.
    inflight: Option<Arc<Vec<PendingOp>>>,
}

impl Pending {
    fn ops(&self) -> impl Iterator<Item = &PendingOp> {
        self.inflight
            .iter()
            .flat_map(|batch| batch.iter())
            .chain(self.queued.iter())
    }
}

struct Shared<S> {
    store: S,
    config: BatchConfig,
    pending: Mutex<Pending>,
    /// Serializes flushes so batches reach the store in queue order.
    flush_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl<S: BatchStore> Shared<S> {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(store = self.store.name(), "pending batch lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn enqueue(&self, op: PendingOp) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::closed(format!("{} storage is closed", self.store.name())));
        }
        let queued = {
            let mut pending = self.lock_pending();
            if pending.queued.len() >= self.config.max_pending {
                return Err(StorageError::io(format!(
                    "{} pending batch is full ({} operations)",
                    self.store.name(),
                    pending.queued.len()
                )));
            }
            pending.queued.push(op);
            pending.queued.len()
        };
        if queued >= self.config.batch_size {
            self.wake.notify_one();
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let _flushing = self.flush_lock.lock().await;

        let batch = {
            let mut pending = self.lock_pending();
            if pending.queued.is_empty() {
                return Ok(());
            }
            let batch = Arc::new(std::mem::take(&mut pending.queued));
            pending.inflight = Some(Arc::clone(&batch));
            batch
        };

        let result = self.store.execute(&batch).await;

        let mut pending = self.lock_pending();
        pending.inflight = None;
        match result {
            Ok(()) => {
                tracing::debug!(store = self.store.name(), ops = batch.len(), "flushed batch");
                Ok(())
            }
            Err(e) => {
                let ops = batch.len();
                if ops + pending.queued.len() <= self.config.max_pending {
                    let mut requeued = Arc::try_unwrap(batch).unwrap_or_else(|b| (*b).clone());
                    requeued.append(&mut pending.queued);
                    pending.queued = requeued;
                    tracing::warn!(store = self.store.name(), ops, error = %e, "batch flush failed, will retry");
                } else {
                    tracing::error!(store = self.store.name(), ops, error = %e, "batch flush failed, dropping batch");
                }
                Err(e.with_context(format!("{} flush", self.store.name())))
            }
        }
    }

    /// Snapshot of queued and in-flight operations touching `subject`.
    fn pending_for(&self, subject: &str) -> Vec<PendingOp> {
        self.lock_pending()
            .ops()
            .filter(|op| op.subject() == subject)
            .cloned()
            .collect()
    }
}

async fn run_flusher<S: BatchStore>(shared: Arc<Shared<S>>) {
    let mut ticker = tokio::time::interval(shared.config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            _ = shared.wake.notified() => {}
        }
        // Failures are logged and requeued inside flush.
        let _ = shared.flush().await;
    }
    tracing::debug!(store = shared.store.name(), "batch flusher stopped");
}

// ═══════════════════════════════════════════════════════════════
//  BatchedStorage
// ═══════════════════════════════════════════════════════════════

/// [`StorageBackend`] that queues writes for a [`BatchStore`] and flushes
/// them from a background task.
pub struct BatchedStorage<S: BatchStore> {
    shared: Arc<Shared<S>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl<S: BatchStore> BatchedStorage<S> {
    /// Wrap `store` and spawn its flush task. Must be called within a tokio
    /// runtime.
    pub fn spawn(store: S, config: BatchConfig) -> Self {
        let shared = Arc::new(Shared {
            store,
            config,
            pending: Mutex::new(Pending::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        let flusher = tokio::spawn(run_flusher(Arc::clone(&shared)));
        Self {
            shared,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    /// Operations acknowledged but not yet durable.
    pub fn pending_len(&self) -> usize {
        let pending = self.shared.lock_pending();
        pending.queued.len() + pending.inflight.as_ref().map_or(0, |b| b.len())
    }

    fn take_flusher(&self) -> Option<JoinHandle<()>> {
        match self.flusher.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl<S: BatchStore> StorageBackend for BatchedStorage<S> {
    fn init(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        self.shared.store.init()
    }

    fn last_id(&self) -> BoxFuture<'_, Result<u64, StorageError>> {
        Box::pin(async move {
            let queued = self
                .shared
                .lock_pending()
                .ops()
                .filter_map(|op| match op {
                    PendingOp::Insert(m) => Some(m.id),
                    PendingOp::Remove { .. } => None,
                })
                .max()
                .unwrap_or(0);
            let stored = self.shared.store.last_id().await?;
            Ok(stored.max(queued))
        })
    }

    fn add_message(&self, message: &Message) -> BoxFuture<'_, Result<u64, StorageError>> {
        let id = message.id;
        let result = self.shared.enqueue(PendingOp::Insert(message.clone()));
        Box::pin(async move { result.map(|()| id) })
    }

    fn fetch_message(&self, id: u64, subject: &str) -> BoxFuture<'_, Result<Message, StorageError>> {
        let subject = subject.to_string();
        Box::pin(async move {
            let mut local: Option<Message> = None;
            let mut removed = false;
            for op in self.shared.pending_for(&subject) {
                match op {
                    PendingOp::Insert(m) if m.id == id => local = Some(m),
                    PendingOp::Remove { id: removed_id, .. } if removed_id == id => removed = true,
                    _ => {}
                }
            }

            let mut message = match local {
                Some(m) => m,
                None => self
                    .shared
                    .store
                    .fetch(&subject, id)
                    .await?
                    .ok_or_else(|| StorageError::not_found(&subject, id))?,
            };
            message.removed |= removed;
            Ok(message)
        })
    }

    fn delete_message(&self, subject: &str, id: u64) -> BoxFuture<'_, Result<(), StorageError>> {
        let result = self.shared.enqueue(PendingOp::Remove {
            subject: subject.to_string(),
            id,
        });
        Box::pin(async move { result })
    }

    fn messages_by_subject(&self, subject: &str) -> BoxFuture<'_, Result<Vec<Message>, StorageError>> {
        let subject = subject.to_string();
        Box::pin(async move {
            // Snapshot first: anything flushed meanwhile shows up in both,
            // and replaying it below is idempotent.
            let local = self.shared.pending_for(&subject);
            let stored = self.shared.store.by_subject(&subject).await?;

            let mut merged: BTreeMap<u64, Message> =
                stored.into_iter().map(|m| (m.id, m)).collect();
            for op in local {
                match op {
                    PendingOp::Insert(m) => {
                        merged.insert(m.id, m);
                    }
                    PendingOp::Remove { id, .. } => {
                        merged.remove(&id);
                    }
                }
            }
            Ok(merged.into_values().collect())
        })
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(self.shared.flush())
    }

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.shared.shutdown.cancel();
            if let Some(flusher) = self.take_flusher() {
                let _ = flusher.await;
            }

            let flushed = self.shared.flush().await;
            if let Err(ref e) = flushed {
                tracing::error!(
                    store = self.shared.store.name(),
                    pending = self.pending_len(),
                    error = %e,
                    "final flush failed, pending operations are lost"
                );
            }
            self.shared.store.close().await?;
            tracing::info!(store = self.shared.store.name(), "storage closed");
            flushed
        })
    }
}

impl<S: BatchStore> Drop for BatchedStorage<S> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
