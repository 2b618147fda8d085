use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use courier_api::Message;

pub type SubscriberId = u64;

fn read_guard<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("{what} read lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn write_guard<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("{what} write lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Topic
// ═══════════════════════════════════════════════════════════════

/// Outcome of one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Subscribers whose queue was full. They never see this message live.
    pub dropped: usize,
}

/// One subject and its live subscribers.
pub struct Topic {
    subject: String,
    buffer: usize,
    next_subscriber: AtomicU64,
    subscribers: RwLock<HashMap<SubscriberId, mpsc::Sender<Message>>>,
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("subject", &self.subject)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Topic {
    pub fn new(subject: impl Into<String>, buffer: usize) -> Self {
        Self {
            subject: subject.into(),
            buffer: buffer.max(1),
            next_subscriber: AtomicU64::new(0),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Register a bounded delivery queue.
    pub fn add_subscriber(&self) -> (SubscriberId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed) + 1;
        write_guard(&self.subscribers, "topic").insert(id, tx);
        (id, rx)
    }

    /// Offer `message` to every subscriber without waiting. Full queues
    /// lose the message; closed queues are pruned.
    pub fn deliver(&self, message: &Message) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut closed = Vec::new();
        {
            let subscribers = read_guard(&self.subscribers, "topic");
            for (id, tx) in subscribers.iter() {
                match tx.try_send(message.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        report.dropped += 1;
                        tracing::debug!(
                            subject = %self.subject,
                            id = message.id,
                            subscriber = *id,
                            "subscriber queue full, dropping message"
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut subscribers = write_guard(&self.subscribers, "topic");
            for id in closed {
                subscribers.remove(&id);
            }
        }
        report
    }

    pub fn remove_subscriber(&self, id: SubscriberId) {
        write_guard(&self.subscribers, "topic").remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        read_guard(&self.subscribers, "topic").len()
    }
}

// ═══════════════════════════════════════════════════════════════
//  TopicRegistry
// ═══════════════════════════════════════════════════════════════

/// Subject name to topic. Topics are created on first reference and live
/// as long as the registry.
#[derive(Debug)]
pub struct TopicRegistry {
    buffer: usize,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl TopicRegistry {
    /// `buffer` is the queue capacity given to every subscriber.
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, subject: &str) -> Arc<Topic> {
        if let Some(topic) = read_guard(&self.topics, "topic registry").get(subject) {
            return Arc::clone(topic);
        }
        let mut topics = write_guard(&self.topics, "topic registry");
        // Another caller may have created it between the two locks.
        if let Some(topic) = topics.get(subject) {
            return Arc::clone(topic);
        }
        let topic = Arc::new(Topic::new(subject, self.buffer));
        topics.insert(subject.to_string(), Arc::clone(&topic));
        tracing::info!(subject = %subject, "created topic");
        topic
    }

    pub fn subjects(&self) -> Vec<String> {
        read_guard(&self.topics, "topic registry").keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read_guard(&self.topics, "topic registry").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
