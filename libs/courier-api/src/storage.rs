use std::future::Future;
use std::pin::Pin;

use crate::error::StorageError;
use crate::message::Message;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Storage backend for the broker. One instance serves every subject.
///
/// Implementations: in-memory (immediately visible), batched durable stores
/// (writes queued and flushed periodically). The engine does not know which
/// one it talks to.
pub trait StorageBackend: Send + Sync {
    /// Prepare the backend (tables, indexes). Durable stores also mark
    /// messages whose TTL elapsed while nothing was running as removed.
    fn init(&self) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Highest id ever stored, 0 when empty. Used to seed id generation.
    fn last_id(&self) -> BoxFuture<'_, Result<u64, StorageError>>;

    /// Persist (or queue for persistence) a message. Returns its id.
    fn add_message(&self, message: &Message) -> BoxFuture<'_, Result<u64, StorageError>>;

    /// Point lookup. Must reflect `removed`; absent records are
    /// `ErrorKind::NotFound`.
    fn fetch_message(&self, id: u64, subject: &str) -> BoxFuture<'_, Result<Message, StorageError>>;

    /// Mark a message removed. Idempotent.
    fn delete_message(&self, subject: &str, id: u64) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Every non-removed message of a subject, ascending by id.
    fn messages_by_subject(&self, subject: &str) -> BoxFuture<'_, Result<Vec<Message>, StorageError>>;

    /// Push queued writes to the underlying store.
    fn flush(&self) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Release underlying resources.
    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>>;
}
