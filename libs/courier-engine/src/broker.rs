use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use courier_api::util::is_overdue;
use courier_api::{Message, Publication, StorageBackend, StorageError, now_ms};

use crate::expiration::ExpirationScheduler;
use crate::id::IdGenerator;
use crate::topic::{SubscriberId, Topic, TopicRegistry};

// ═══════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is closed")]
    Unavailable,

    #[error("no message {id} on subject '{subject}'")]
    InvalidId { subject: String, id: u64 },

    #[error("message {id} on subject '{subject}' has expired")]
    ExpiredId { subject: String, id: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

/// Transport-level status class of a [`BrokerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unavailable,
    InvalidArgument,
    Cancelled,
    Internal,
}

impl BrokerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::Unavailable => ErrorCode::Unavailable,
            BrokerError::InvalidId { .. } | BrokerError::ExpiredId { .. } => {
                ErrorCode::InvalidArgument
            }
            BrokerError::Cancelled => ErrorCode::Cancelled,
            BrokerError::Storage(_) => ErrorCode::Internal,
        }
    }
}

/// Removed, or past its TTL but not yet swept.
fn is_expired(message: &Message, now_ms: i64) -> bool {
    message.removed
        || (message.expires() && is_overdue(message.created_at_ms, message.time_to_live_ms(), now_ms))
}

// ═══════════════════════════════════════════════════════════════
//  Options
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Queue capacity per subscriber.
    pub subscriber_buffer: usize,
    /// Seed new subscriptions with the stored backlog of their subject.
    pub replay_backlog: bool,
    pub sweep_interval: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            subscriber_buffer: 200,
            replay_backlog: true,
            sweep_interval: Duration::from_millis(100),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Subscription
// ═══════════════════════════════════════════════════════════════

/// Stream of messages for one subscriber. Dropping it deregisters the
/// subscriber from its topic.
pub struct Subscription {
    topic: Arc<Topic>,
    id: SubscriberId,
    rx: mpsc::Receiver<Message>,
    backlog: VecDeque<Message>,
    /// Backlog ids whose live copies are skipped. Emptied once a live id
    /// passes `replayed_max`.
    replayed: HashSet<u64>,
    replayed_max: u64,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.topic.subject())
            .field("id", &self.id)
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

impl Subscription {
    pub fn subject(&self) -> &str {
        self.topic.subject()
    }

    /// Next message: backlog first, then live. `None` once the caller's
    /// token fires, the broker closes, or the queue is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        if self.cancel.is_cancelled() || self.shutdown.is_cancelled() {
            return None;
        }
        if let Some(message) = self.backlog.pop_front() {
            return Some(message);
        }
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = self.shutdown.cancelled() => return None,
                message = self.rx.recv() => message?,
            };
            if !self.replayed.is_empty() {
                if message.id > self.replayed_max {
                    self.replayed = HashSet::new();
                } else if self.replayed.remove(&message.id) {
                    continue;
                }
            }
            return Some(message);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.topic.remove_subscriber(self.id);
    }
}

// ═══════════════════════════════════════════════════════════════
//  Broker
// ═══════════════════════════════════════════════════════════════

/// The broker engine: publish, subscribe, fetch and close over one storage
/// backend.
pub struct Broker {
    registry: TopicRegistry,
    ids: IdGenerator,
    storage: Arc<dyn StorageBackend>,
    scheduler: Arc<ExpirationScheduler>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    replay_backlog: bool,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("registry", &self.registry)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Broker {
    /// Build a broker around an initialized backend and spawn its expiration
    /// sweep. Must be called within a tokio runtime.
    pub fn new(storage: Arc<dyn StorageBackend>, ids: IdGenerator, options: BrokerOptions) -> Self {
        let shutdown = CancellationToken::new();
        let (scheduler, sweeper) = ExpirationScheduler::spawn(
            Arc::clone(&storage),
            options.sweep_interval,
            shutdown.clone(),
        );
        Self {
            registry: TopicRegistry::new(options.subscriber_buffer),
            ids,
            storage,
            scheduler,
            sweeper: Mutex::new(Some(sweeper)),
            shutdown,
            closed: AtomicBool::new(false),
            replay_backlog: options.replay_backlog,
        }
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn scheduler(&self) -> &ExpirationScheduler {
        &self.scheduler
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_usable(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Unavailable);
        }
        if cancel.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }
        Ok(())
    }

    /// Store and fan out a message. Returns its id.
    ///
    /// Live subscribers receive the message even when storage rejects it;
    /// the storage error is still returned to the caller.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        subject: &str,
        publication: Publication,
    ) -> Result<u64, BrokerError> {
        self.ensure_usable(cancel)?;

        let topic = self.registry.get_or_create(subject);
        let id = self.ids.next_id();
        let message = Message::new(id, subject, publication, now_ms());

        let stored = self.storage.add_message(&message).await;
        let report = topic.deliver(&message);
        tracing::debug!(
            subject = %subject,
            id,
            delivered = report.delivered,
            dropped = report.dropped,
            "published message"
        );

        if let Err(e) = stored {
            tracing::warn!(subject = %subject, id, error = %e, "failed to store message");
            return Err(BrokerError::Storage(e));
        }
        if message.expires() {
            self.scheduler.schedule(subject, id, message.time_to_live);
        }
        Ok(id)
    }

    /// Register a subscriber on `subject`.
    ///
    /// With backlog replay on, stored messages of the subject are yielded
    /// first in id order; live copies of those ids are skipped.
    pub async fn subscribe(
        &self,
        cancel: &CancellationToken,
        subject: &str,
    ) -> Result<Subscription, BrokerError> {
        self.ensure_usable(cancel)?;

        let topic = self.registry.get_or_create(subject);
        // Register before reading the backlog so nothing published in
        // between is missed.
        let (id, rx) = topic.add_subscriber();
        let mut subscription = Subscription {
            topic,
            id,
            rx,
            backlog: VecDeque::new(),
            replayed: HashSet::new(),
            replayed_max: 0,
            cancel: cancel.clone(),
            shutdown: self.shutdown.clone(),
        };

        if self.replay_backlog {
            match self.storage.messages_by_subject(subject).await {
                Ok(backlog) => {
                    let now = now_ms();
                    subscription.backlog = backlog
                        .into_iter()
                        .filter(|m| !is_expired(m, now))
                        .collect();
                    subscription.replayed = subscription.backlog.iter().map(|m| m.id).collect();
                    subscription.replayed_max = subscription.replayed.iter().copied().max().unwrap_or(0);
                }
                Err(e) => {
                    tracing::warn!(subject = %subject, error = %e, "backlog read failed, subscribing live only");
                }
            }
        }

        tracing::debug!(
            subject = %subject,
            subscriber = id,
            backlog = subscription.backlog.len(),
            "subscribed"
        );
        Ok(subscription)
    }

    /// Point lookup of a stored, non-removed message.
    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        subject: &str,
        id: u64,
    ) -> Result<Message, BrokerError> {
        self.ensure_usable(cancel)?;

        self.registry.get_or_create(subject);
        match self.storage.fetch_message(id, subject).await {
            Ok(message) if is_expired(&message, now_ms()) => {
                Err(BrokerError::ExpiredId {
                    subject: subject.to_string(),
                    id,
                })
            }
            Ok(message) => Ok(message),
            Err(e) if e.is_not_found() => Err(BrokerError::InvalidId {
                subject: subject.to_string(),
                id,
            }),
            Err(e) => Err(BrokerError::Storage(e)),
        }
    }

    /// Move to the closed state, end live subscriptions and the expiration
    /// sweep, then close storage. A second call fails with `Unavailable`.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BrokerError::Unavailable);
        }
        self.shutdown.cancel();

        let sweeper = match self.sweeper.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "expiration sweeper ended abnormally");
            }
        }

        self.storage.close().await?;
        tracing::info!(topics = self.registry.len(), "broker closed");
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
