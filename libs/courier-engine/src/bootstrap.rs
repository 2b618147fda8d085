use std::sync::Arc;

use courier_api::StorageBackend;
use courier_batch::BatchedStorage;
use courier_storage_clickhouse::ClickHouseStore;
use courier_storage_memory::MemoryStorage;
use courier_storage_postgres::PostgresStore;

use crate::broker::Broker;
use crate::config::{BackendKind, CourierConfig, StorageConfig};
use crate::error::EngineError;
use crate::id::IdGenerator;

/// Construct the configured backend. Durable backends are wrapped in a
/// [`BatchedStorage`], which spawns its flush task.
pub async fn create_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, EngineError> {
    let storage: Arc<dyn StorageBackend> = match config.backend {
        BackendKind::Memory => Arc::new(MemoryStorage::new()),
        BackendKind::Postgres => {
            let store = PostgresStore::connect(&config.postgres)
                .await
                .map_err(|e| EngineError::from(e).with_context("postgres"))?;
            Arc::new(BatchedStorage::spawn(store, config.batch_config()))
        }
        BackendKind::Clickhouse => {
            let store = ClickHouseStore::new(&config.clickhouse)
                .map_err(|e| EngineError::from(e).with_context("clickhouse"))?;
            Arc::new(BatchedStorage::spawn(store, config.batch_config()))
        }
    };
    Ok(storage)
}

impl Broker {
    /// Bootstrap a broker from a parsed configuration.
    ///
    /// Creates and initializes storage, then continues id generation after
    /// the highest stored id.
    pub async fn bootstrap(config: &CourierConfig) -> Result<Self, EngineError> {
        let storage = create_storage(&config.storage).await?;
        storage
            .init()
            .await
            .map_err(|e| EngineError::from(e).with_context("storage init"))?;
        let last_id = storage
            .last_id()
            .await
            .map_err(|e| EngineError::from(e).with_context("storage last id"))?;

        tracing::info!(
            backend = ?config.storage.backend,
            last_id,
            replay_backlog = config.broker.replay_backlog,
            "storage initialized"
        );
        Ok(Broker::new(
            storage,
            IdGenerator::starting_after(last_id),
            config.broker_options(),
        ))
    }
}
