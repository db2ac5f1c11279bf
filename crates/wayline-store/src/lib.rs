pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use wayline_core::config::{AppConfig, StoreBackend};
use wayline_core::error::Result;
use wayline_core::traits::{CheckpointStore, ExecutionStore};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// The two store handles an engine needs, usually backed by one database.
#[derive(Clone)]
pub struct Stores {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub executions: Arc<dyn ExecutionStore>,
}

impl Stores {
    /// Share one backend for both roles.
    pub fn shared<S: CheckpointStore + ExecutionStore>(store: S) -> Self {
        let store = Arc::new(store);
        Self {
            checkpoints: store.clone(),
            executions: store,
        }
    }

    /// Open the backend named in the `[store]` section.
    pub fn open(config: &AppConfig) -> Result<Self> {
        match config.store.backend {
            StoreBackend::Sqlite => Ok(Self::shared(SqliteStore::open(&config.store_path())?)),
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store; executions will not survive a restart");
                Ok(Self::shared(MemoryStore::new()))
            }
        }
    }
}
