use courier_api::{BoxFuture, Message, StorageError};

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    Insert(Message),
    Remove { subject: String, id: u64 },
}

impl PendingOp {
    pub fn subject(&self) -> &str {
        match self {
            PendingOp::Insert(message) => &message.subject,
            PendingOp::Remove { subject, .. } => subject,
        }
    }
}

/// A database the batching layer can flush into.
///
/// `execute` receives every operation of one flush, in queue order, and
/// should apply them as one round trip (transaction, multi-row insert).
pub trait BatchStore: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Create schema and mark overdue messages removed.
    fn init(&self) -> BoxFuture<'_, Result<(), StorageError>>;

    fn last_id(&self) -> BoxFuture<'_, Result<u64, StorageError>>;

    fn execute<'a>(&'a self, ops: &'a [PendingOp]) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Stored record, removed or not. `None` when absent.
    fn fetch(&self, subject: &str, id: u64) -> BoxFuture<'_, Result<Option<Message>, StorageError>>;

    /// Non-removed records of a subject, ascending by id.
    fn by_subject(&self, subject: &str) -> BoxFuture<'_, Result<Vec<Message>, StorageError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), StorageError>>;
}
