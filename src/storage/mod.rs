mod backend;
mod engine;
mod error;
mod facade;
mod memory_backend;
mod path;
mod sled_backend;

pub use backend::StorageBackend;
pub use engine::{SledMode, StorageEngine};
pub use error::StorageError;
pub use facade::{StorageFacade, DEFAULT_OPERATION_TIMEOUT};
pub use memory_backend::MemoryStorage;
pub use path::expand_home_path;
pub use sled_backend::SledStorage;

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::config::{AppConfig, StorageConfig};
    use crate::directory::records::{
        ClientRecord, ClientUpdate, NewClient, NewNode, NodeRecord, NodeUpdate, QueuedMessage,
    };
    use crate::logging::Logger;

    use super::{
        expand_home_path, MemoryStorage, StorageBackend, StorageEngine, StorageError,
        StorageFacade,
    };

    fn sled_storage(path: &str) -> StorageFacade {
        let app_config = AppConfig {
            storage: StorageConfig {
                engine: "sled".to_owned(),
                path: path.to_owned(),
                ..StorageConfig::default()
            },
            ..AppConfig::default()
        };
        StorageFacade::initialize(&app_config, &Logger::silent()).expect("storage init should work")
    }

    fn unique_temp_path(label: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "nodelink-storage-test-{label}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        path.to_string_lossy().to_string()
    }

    fn new_node(token: &str) -> NewNode {
        NewNode {
            token: token.to_owned(),
            components: "ipfs://QmComponents".to_owned(),
            information: "{\"name\":\"alpha\"}".to_owned(),
            resource: "tcp://127.0.0.1:4000".to_owned(),
        }
    }

    fn queued(recipient: u64, action: &str) -> QueuedMessage {
        QueuedMessage {
            message_id: uuid::Uuid::new_v4(),
            sender: 99,
            recipient,
            action: action.to_owned(),
            message: "{}".to_owned(),
            queued_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn expands_tilde_prefix_to_home() {
        let home = std::env::var("HOME").expect("HOME should be available in tests");
        let expanded = expand_home_path("~/.nodelink/data").expect("expansion should work");
        assert_eq!(expanded, std::path::Path::new(&home).join(".nodelink/data"));
    }

    #[test]
    fn expands_home_env_prefix() {
        let home = std::env::var("HOME").expect("HOME should be available in tests");
        let expanded = expand_home_path("$HOME/.nodelink/data").expect("expansion should work");
        assert_eq!(expanded, std::path::Path::new(&home).join(".nodelink/data"));
    }

    #[test]
    fn keeps_absolute_paths_unchanged() {
        let expanded = expand_home_path("/var/lib/nodelink/data").expect("expansion should work");
        assert_eq!(expanded, std::path::PathBuf::from("/var/lib/nodelink/data"));
    }

    #[test]
    fn rejects_unknown_engine() {
        let app_config = AppConfig {
            storage: StorageConfig {
                engine: "rocks".to_owned(),
                ..StorageConfig::default()
            },
            ..AppConfig::default()
        };
        let error = StorageFacade::initialize(&app_config, &Logger::silent())
            .err()
            .expect("unknown engine should fail");
        assert!(matches!(error, StorageError::UnsupportedEngine { .. }));
    }

    #[test]
    fn sled_node_roundtrip_update_and_remove() {
        let path = unique_temp_path("node-roundtrip");
        let storage = sled_storage(&path);
        assert_eq!(storage.engine(), StorageEngine::Sled);
        assert!(storage
            .data_path()
            .expect("sled storage has a data path")
            .to_string_lossy()
            .contains("nodelink-storage-test"));

        let created = storage.insert_node(new_node("tok-a")).expect("insert should work");
        assert!(created.id >= 1);
        assert!(!created.active);

        let by_token = storage.node_by_token("tok-a").expect("lookup should work");
        assert_eq!(by_token.as_ref(), Some(&created));
        let by_id = storage.node_by_id(created.id).expect("lookup should work");
        assert_eq!(by_id, Some(created.clone()));

        let updated = storage
            .update_node(
                created.id,
                NodeUpdate {
                    components: Some("ipfs://QmNext".to_owned()),
                    information: None,
                },
            )
            .expect("update should work")
            .expect("record should exist");
        assert_eq!(updated.components, "ipfs://QmNext");
        assert_eq!(updated.information, created.information);

        assert!(storage.remove_node(created.id).expect("remove should work"));
        assert!(!storage.remove_node(created.id).expect("second remove should work"));
        assert!(storage.node_by_token("tok-a").expect("lookup should work").is_none());

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn sled_rejects_duplicate_tokens_per_class() {
        let path = unique_temp_path("duplicate-token");
        let storage = sled_storage(&path);

        storage.insert_node(new_node("shared")).expect("first insert should work");
        let error = storage
            .insert_node(new_node("shared"))
            .expect_err("duplicate token should be rejected");
        assert!(matches!(error, StorageError::DuplicateToken));

        let client = storage
            .insert_client(NewClient {
                token: "shared".to_owned(),
                information: "{}".to_owned(),
                resource: "tcp://127.0.0.1:5000".to_owned(),
            })
            .expect("client class has its own token space");
        assert_eq!(
            storage.client_by_token("shared").expect("lookup should work"),
            Some(client.clone())
        );

        let updated: ClientRecord = storage
            .update_client(
                client.id,
                ClientUpdate {
                    information: Some("{\"app\":\"x\"}".to_owned()),
                },
            )
            .expect("update should work")
            .expect("client should exist");
        assert_eq!(updated.information, "{\"app\":\"x\"}");

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn sled_queue_keeps_order_and_drains_once() {
        let path = unique_temp_path("queue-drain");
        let storage = sled_storage(&path);

        for action in ["first", "second", "third"] {
            storage
                .enqueue_message(queued(7, action))
                .expect("enqueue should work");
        }
        storage.enqueue_message(queued(8, "other")).expect("enqueue should work");

        let pending = storage.pending_messages(7).expect("pending should work");
        let actions: Vec<_> = pending.iter().map(|m| m.action.as_str()).collect();
        assert_eq!(actions, vec!["first", "second", "third"]);

        let drained = storage.drain_messages(7).expect("drain should work");
        assert_eq!(drained, pending);
        assert!(storage.drain_messages(7).expect("drain should work").is_empty());
        assert_eq!(storage.pending_messages(8).expect("pending should work").len(), 1);

        assert_eq!(storage.purge_messages(8).expect("purge should work"), 1);
        assert!(storage.pending_messages(8).expect("pending should work").is_empty());

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn sled_records_survive_reopen() {
        let path = unique_temp_path("reopen");
        let node: NodeRecord = {
            let storage = sled_storage(&path);
            let node = storage.insert_node(new_node("persisted")).expect("insert should work");
            storage.enqueue_message(queued(node.id, "held")).expect("enqueue should work");
            storage.flush().expect("flush should work");
            node
        };

        let reopened = sled_storage(&path);
        assert_eq!(
            reopened.node_by_token("persisted").expect("lookup should work"),
            Some(node.clone())
        );
        assert_eq!(reopened.pending_messages(node.id).expect("pending should work").len(), 1);

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn memory_backend_assigns_distinct_ids_across_classes() {
        let storage = StorageFacade::in_memory();
        let node = storage.insert_node(new_node("n")).expect("insert should work");
        let client = storage
            .insert_client(NewClient {
                token: "c".to_owned(),
                information: "{}".to_owned(),
                resource: "tcp://c".to_owned(),
            })
            .expect("insert should work");
        assert_ne!(node.id, client.id);
        assert_eq!(storage.client_by_id(client.id).expect("lookup should work"), Some(client));
        assert!(storage.client_by_id(node.id).expect("lookup should work").is_none());
    }

    /// Wraps `MemoryStorage` and sleeps after one named operation has run.
    /// `stalls` bounds how many calls are delayed.
    pub(crate) struct StalledBackend {
        inner: MemoryStorage,
        operation: &'static str,
        delay: Duration,
        stalls: AtomicUsize,
    }

    impl StalledBackend {
        pub(crate) fn new(operation: &'static str, delay: Duration) -> Self {
            Self::limited(operation, delay, usize::MAX)
        }

        pub(crate) fn once(operation: &'static str, delay: Duration) -> Self {
            Self::limited(operation, delay, 1)
        }

        fn limited(operation: &'static str, delay: Duration, stalls: usize) -> Self {
            Self {
                inner: MemoryStorage::new(),
                operation,
                delay,
                stalls: AtomicUsize::new(stalls),
            }
        }

        fn after<R>(&self, operation: &str, result: R) -> R {
            let armed = operation == self.operation
                && self
                    .stalls
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok();
            if armed {
                thread::sleep(self.delay);
            }
            result
        }
    }

    impl StorageBackend for StalledBackend {
        fn flush(&self) -> Result<(), StorageError> {
            self.after("flush", self.inner.flush())
        }
        fn insert_node(&self, node: NewNode) -> Result<NodeRecord, StorageError> {
            self.after("insert_node", self.inner.insert_node(node))
        }
        fn node_by_token(&self, token: &str) -> Result<Option<NodeRecord>, StorageError> {
            self.after("node_by_token", self.inner.node_by_token(token))
        }
        fn node_by_id(&self, id: u64) -> Result<Option<NodeRecord>, StorageError> {
            self.after("node_by_id", self.inner.node_by_id(id))
        }
        fn update_node(&self, id: u64, update: &NodeUpdate) -> Result<Option<NodeRecord>, StorageError> {
            self.after("update_node", self.inner.update_node(id, update))
        }
        fn remove_node(&self, id: u64) -> Result<bool, StorageError> {
            self.after("remove_node", self.inner.remove_node(id))
        }
        fn insert_client(&self, client: NewClient) -> Result<ClientRecord, StorageError> {
            self.after("insert_client", self.inner.insert_client(client))
        }
        fn client_by_token(&self, token: &str) -> Result<Option<ClientRecord>, StorageError> {
            self.after("client_by_token", self.inner.client_by_token(token))
        }
        fn client_by_id(&self, id: u64) -> Result<Option<ClientRecord>, StorageError> {
            self.after("client_by_id", self.inner.client_by_id(id))
        }
        fn update_client(
            &self,
            id: u64,
            update: &ClientUpdate,
        ) -> Result<Option<ClientRecord>, StorageError> {
            self.after("update_client", self.inner.update_client(id, update))
        }
        fn remove_client(&self, id: u64) -> Result<bool, StorageError> {
            self.after("remove_client", self.inner.remove_client(id))
        }
        fn enqueue_message(&self, message: &QueuedMessage) -> Result<(), StorageError> {
            self.after("enqueue_message", self.inner.enqueue_message(message))
        }
        fn pending_messages(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError> {
            self.after("pending_messages", self.inner.pending_messages(recipient))
        }
        fn drain_messages(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError> {
            self.after("drain_messages", self.inner.drain_messages(recipient))
        }
        fn purge_messages(&self, recipient: u64) -> Result<usize, StorageError> {
            self.after("purge_messages", self.inner.purge_messages(recipient))
        }
    }

    #[test]
    fn slow_backend_call_reports_retryable_timeout() {
        let storage = StorageFacade::with_backend(
            StorageEngine::Memory,
            None,
            Duration::from_millis(20),
            Arc::new(StalledBackend::new("insert_node", Duration::from_millis(300))),
        );

        let error = storage
            .insert_node(new_node("slow"))
            .expect_err("stalled insert should time out");
        assert!(matches!(error, StorageError::Timeout { operation: "insert_node", .. }));
        assert!(error.is_retryable());
        assert!(!StorageError::DuplicateToken.is_retryable());
    }
}
