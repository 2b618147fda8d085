//! Write batching for durable storage backends.
//!
//! A [`BatchStore`] knows how to talk to one database. [`BatchedStorage`]
//! wraps it into a [`StorageBackend`](courier_api::StorageBackend): writes
//! and removals are queued in memory and flushed as a single batched write
//! either every `flush_interval` or as soon as `batch_size` operations are
//! pending.
//!
//! Acknowledged writes live only in process memory until the next flush.
//! Reads overlay the queue so the process sees its own writes, but a crash
//! before the flush loses them.

mod batched;
mod ident;
mod store;

pub use batched::{BatchConfig, BatchedStorage};
pub use ident::validate_identifier;
pub use store::{BatchStore, PendingOp};
