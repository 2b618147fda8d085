use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use courier_api::StorageBackend;

/// (deadline, id, subject); ordered by deadline first.
type Entry = Reverse<(Instant, u64, String)>;

/// Marks messages removed once their time-to-live has elapsed.
///
/// Deadlines sit in one min-heap; a single sweep task pops whatever is due
/// on every tick. Entries cannot be cancelled: deleting an already removed
/// message is a no-op for every backend.
#[derive(Debug, Default)]
pub struct ExpirationScheduler {
    heap: Mutex<BinaryHeap<Entry>>,
}

impl ExpirationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scheduler and spawn its sweep task. The task ends when
    /// `shutdown` fires.
    pub fn spawn(
        storage: Arc<dyn StorageBackend>,
        sweep_interval: Duration,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let scheduler = Arc::new(Self::new());
        let handle = tokio::spawn(run_sweeper(
            Arc::clone(&scheduler),
            storage,
            sweep_interval,
            shutdown,
        ));
        (scheduler, handle)
    }

    /// Arm expiry for a message. Returns false when the deadline lies
    /// beyond what the clock can represent; such a message never expires.
    pub fn schedule(&self, subject: &str, id: u64, ttl: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(ttl) else {
            tracing::debug!(subject = %subject, id, ?ttl, "ttl out of clock range, not scheduling");
            return false;
        };
        self.lock_heap().push(Reverse((deadline, id, subject.to_string())));
        true
    }

    /// Entries not yet swept.
    pub fn pending(&self) -> usize {
        self.lock_heap().len()
    }

    /// Pop every entry whose deadline is at or before `now`.
    pub fn take_due(&self, now: Instant) -> Vec<(String, u64)> {
        let mut heap = self.lock_heap();
        let mut due = Vec::new();
        while let Some(Reverse((deadline, _, _))) = heap.peek() {
            if *deadline > now {
                break;
            }
            if let Some(Reverse((_, id, subject))) = heap.pop() {
                due.push((subject, id));
            }
        }
        due
    }

    async fn sweep(&self, storage: &dyn StorageBackend) {
        let due = self.take_due(Instant::now());
        if due.is_empty() {
            return;
        }
        tracing::debug!(count = due.len(), "expiring messages");
        for (subject, id) in due {
            if let Err(e) = storage.delete_message(&subject, id).await {
                tracing::warn!(subject = %subject, id, error = %e, "failed to mark message expired");
            }
        }
    }

    fn lock_heap(&self) -> MutexGuard<'_, BinaryHeap<Entry>> {
        match self.heap.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("expiration heap lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

async fn run_sweeper(
    scheduler: Arc<ExpirationScheduler>,
    storage: Arc<dyn StorageBackend>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(sweep_interval.max(Duration::from_millis(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => scheduler.sweep(storage.as_ref()).await,
        }
    }
    tracing::debug!(pending = scheduler.pending(), "expiration sweeper stopped");
}
