use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use crate::config::AppConfig;
use crate::directory::records::{
    ClientRecord, ClientUpdate, NewClient, NewNode, NodeRecord, NodeUpdate, QueuedMessage,
};
use crate::logging::{LogLevel, Logger};

use super::{
    expand_home_path, MemoryStorage, SledMode, SledStorage, StorageBackend, StorageEngine,
    StorageError,
};

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout-bounded front for a `StorageBackend`. Each call runs on its own
/// worker thread; the caller waits at most `operation_timeout` and gets
/// `StorageError::Timeout` otherwise. The worker keeps running to completion,
/// so a timed-out write may still land.
pub struct StorageFacade {
    engine: StorageEngine,
    data_path: Option<PathBuf>,
    operation_timeout: Duration,
    backend: Arc<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let Some(engine) = StorageEngine::parse(&app_config.storage.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: app_config.storage.engine.clone(),
            });
        };
        let operation_timeout = Duration::from_millis(app_config.storage.operation_timeout_ms);

        if engine == StorageEngine::Memory {
            logger.warn(
                Some("storage::init"),
                "Using volatile in-memory storage; directory and queue are lost on exit",
            );
            return Ok(Self::with_backend(
                engine,
                None,
                operation_timeout,
                Arc::new(MemoryStorage::new()),
            ));
        }

        let data_path = expand_home_path(&app_config.storage.path)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing storage facade",
            Some(json!({
                "engine": engine.as_str(),
                "configured_path": app_config.storage.path,
                "resolved_path": data_path.display().to_string(),
                "operation_timeout_ms": app_config.storage.operation_timeout_ms,
                "sled": {
                    "cache_capacity": app_config.storage.sled.cache_capacity,
                    "mode": app_config.storage.sled.mode
                }
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let mode = match app_config.storage.sled.mode.as_deref() {
            Some(raw) => Some(SledMode::parse(raw).ok_or_else(|| StorageError::InvalidSledMode {
                mode: raw.to_owned(),
            })?),
            None => None,
        };
        let backend = SledStorage::open(&data_path, app_config.storage.sled.cache_capacity, mode)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Storage facade initialized",
            Some(json!({
                "engine": engine.as_str(),
                "resolved_path": data_path.display().to_string(),
            })),
        );

        Ok(Self::with_backend(
            engine,
            Some(data_path),
            operation_timeout,
            Arc::new(backend),
        ))
    }

    pub fn with_backend(
        engine: StorageEngine,
        data_path: Option<PathBuf>,
        operation_timeout: Duration,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            engine,
            data_path,
            operation_timeout,
            backend,
        }
    }

    pub fn in_memory() -> Self {
        Self::with_backend(
            StorageEngine::Memory,
            None,
            DEFAULT_OPERATION_TIMEOUT,
            Arc::new(MemoryStorage::new()),
        )
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> Option<&PathBuf> {
        self.data_path.as_ref()
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.bounded("flush", |backend| backend.flush())
    }

    pub fn insert_node(&self, node: NewNode) -> Result<NodeRecord, StorageError> {
        self.bounded("insert_node", move |backend| backend.insert_node(node))
    }

    pub fn node_by_token(&self, token: &str) -> Result<Option<NodeRecord>, StorageError> {
        let token = token.to_owned();
        self.bounded("node_by_token", move |backend| backend.node_by_token(&token))
    }

    pub fn node_by_id(&self, id: u64) -> Result<Option<NodeRecord>, StorageError> {
        self.bounded("node_by_id", move |backend| backend.node_by_id(id))
    }

    pub fn update_node(&self, id: u64, update: NodeUpdate) -> Result<Option<NodeRecord>, StorageError> {
        self.bounded("update_node", move |backend| backend.update_node(id, &update))
    }

    pub fn remove_node(&self, id: u64) -> Result<bool, StorageError> {
        self.bounded("remove_node", move |backend| backend.remove_node(id))
    }

    pub fn insert_client(&self, client: NewClient) -> Result<ClientRecord, StorageError> {
        self.bounded("insert_client", move |backend| backend.insert_client(client))
    }

    pub fn client_by_token(&self, token: &str) -> Result<Option<ClientRecord>, StorageError> {
        let token = token.to_owned();
        self.bounded("client_by_token", move |backend| backend.client_by_token(&token))
    }

    pub fn client_by_id(&self, id: u64) -> Result<Option<ClientRecord>, StorageError> {
        self.bounded("client_by_id", move |backend| backend.client_by_id(id))
    }

    pub fn update_client(
        &self,
        id: u64,
        update: ClientUpdate,
    ) -> Result<Option<ClientRecord>, StorageError> {
        self.bounded("update_client", move |backend| backend.update_client(id, &update))
    }

    pub fn remove_client(&self, id: u64) -> Result<bool, StorageError> {
        self.bounded("remove_client", move |backend| backend.remove_client(id))
    }

    pub fn enqueue_message(&self, message: QueuedMessage) -> Result<(), StorageError> {
        self.bounded("enqueue_message", move |backend| backend.enqueue_message(&message))
    }

    pub fn pending_messages(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError> {
        self.bounded("pending_messages", move |backend| backend.pending_messages(recipient))
    }

    pub fn drain_messages(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError> {
        self.bounded("drain_messages", move |backend| backend.drain_messages(recipient))
    }

    pub fn purge_messages(&self, recipient: u64) -> Result<usize, StorageError> {
        self.bounded("purge_messages", move |backend| backend.purge_messages(recipient))
    }

    fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StorageBackend) -> Result<T, StorageError> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let (tx, rx) = mpsc::sync_channel(1);

        thread::Builder::new()
            .name(format!("storage-{operation}"))
            .spawn(move || {
                let result = call(backend.as_ref());
                // Release the backend before replying so a dropped facade closes the store.
                drop(backend);
                let _ = tx.send(result);
            })
            .map_err(|source| StorageError::WorkerSpawn { operation, source })?;

        match rx.recv_timeout(self.operation_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(StorageError::Timeout {
                operation,
                timeout_ms: self.operation_timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(StorageError::WorkerLost { operation }),
        }
    }
}
