use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use courier_api::{BoxFuture, Message, StorageBackend, StorageError};

// ═══════════════════════════════════════════════════════════════
//  MemoryStorage
// ═══════════════════════════════════════════════════════════════

/// Ephemeral storage: everything lives in process memory and is visible
/// the moment `add_message` returns. Nothing survives a restart.
///
/// Removed messages keep their record so that a later fetch can tell an
/// expired id from one that never existed.
#[derive(Default)]
pub struct MemoryStorage {
    subjects: RwLock<HashMap<String, BTreeMap<u64, Message>>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::closed("memory storage is closed"));
        }
        Ok(())
    }
}

impl StorageBackend for MemoryStorage {
    fn init(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async { Ok(()) })
    }

    fn last_id(&self) -> BoxFuture<'_, Result<u64, StorageError>> {
        Box::pin(async move {
            let subjects = self.subjects.read().await;
            Ok(subjects
                .values()
                .filter_map(|messages| messages.keys().next_back().copied())
                .max()
                .unwrap_or(0))
        })
    }

    fn add_message(&self, message: &Message) -> BoxFuture<'_, Result<u64, StorageError>> {
        let message = message.clone();
        Box::pin(async move {
            self.ensure_open()?;
            let id = message.id;
            let mut subjects = self.subjects.write().await;
            subjects
                .entry(message.subject.clone())
                .or_default()
                .insert(id, message);
            Ok(id)
        })
    }

    fn fetch_message(&self, id: u64, subject: &str) -> BoxFuture<'_, Result<Message, StorageError>> {
        let subject = subject.to_string();
        Box::pin(async move {
            let subjects = self.subjects.read().await;
            subjects
                .get(&subject)
                .and_then(|messages| messages.get(&id))
                .cloned()
                .ok_or_else(|| StorageError::not_found(&subject, id))
        })
    }

    fn delete_message(&self, subject: &str, id: u64) -> BoxFuture<'_, Result<(), StorageError>> {
        let subject = subject.to_string();
        Box::pin(async move {
            let mut subjects = self.subjects.write().await;
            if let Some(message) = subjects.get_mut(&subject).and_then(|m| m.get_mut(&id)) {
                message.removed = true;
            }
            Ok(())
        })
    }

    fn messages_by_subject(&self, subject: &str) -> BoxFuture<'_, Result<Vec<Message>, StorageError>> {
        let subject = subject.to_string();
        Box::pin(async move {
            let subjects = self.subjects.read().await;
            Ok(subjects
                .get(&subject)
                .map(|messages| {
                    messages
                        .values()
                        .filter(|m| !m.removed)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        self.closed.store(true, Ordering::Release);
        Box::pin(async { Ok(()) })
    }
}
