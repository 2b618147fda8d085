//! Shared types for the courier broker: the message model, the storage
//! backend contract and its error type.
//!
//! This crate carries no runtime; storage plugins and the engine both
//! depend on it.

pub mod error;
pub mod message;
pub mod storage;
pub mod util;

pub use error::{ErrorKind, StorageError};
pub use message::{Message, Publication};
pub use storage::{BoxFuture, StorageBackend};
pub use util::now_ms;
