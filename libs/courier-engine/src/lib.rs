//! Broker engine: subject registry, live fan-out, expiration and the
//! publish/subscribe/fetch surface over a pluggable storage backend.

pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod error;
pub mod expiration;
pub mod id;
pub mod topic;

pub use broker::{Broker, BrokerError, BrokerOptions, ErrorCode, Subscription};
pub use config::CourierConfig;
pub use error::EngineError;
pub use expiration::ExpirationScheduler;
pub use id::IdGenerator;
pub use topic::{DeliveryReport, SubscriberId, Topic, TopicRegistry};

pub use courier_api::{Message, Publication};
pub use tokio_util::sync::CancellationToken;
