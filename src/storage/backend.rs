use crate::directory::records::{
    ClientRecord, ClientUpdate, NewClient, NewNode, NodeRecord, NodeUpdate, QueuedMessage,
};

use super::StorageError;

/// Keyed store behind the Directory and the Queue. Implementations must keep
/// tokens unique per identity class and reject duplicates with
/// `StorageError::DuplicateToken`.
pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;

    fn insert_node(&self, node: NewNode) -> Result<NodeRecord, StorageError>;
    fn node_by_token(&self, token: &str) -> Result<Option<NodeRecord>, StorageError>;
    fn node_by_id(&self, id: u64) -> Result<Option<NodeRecord>, StorageError>;
    fn update_node(&self, id: u64, update: &NodeUpdate) -> Result<Option<NodeRecord>, StorageError>;
    fn remove_node(&self, id: u64) -> Result<bool, StorageError>;

    fn insert_client(&self, client: NewClient) -> Result<ClientRecord, StorageError>;
    fn client_by_token(&self, token: &str) -> Result<Option<ClientRecord>, StorageError>;
    fn client_by_id(&self, id: u64) -> Result<Option<ClientRecord>, StorageError>;
    fn update_client(
        &self,
        id: u64,
        update: &ClientUpdate,
    ) -> Result<Option<ClientRecord>, StorageError>;
    fn remove_client(&self, id: u64) -> Result<bool, StorageError>;

    fn enqueue_message(&self, message: &QueuedMessage) -> Result<(), StorageError>;
    /// Oldest first.
    fn pending_messages(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError>;
    /// Reads and removes the recipient's messages in one atomic step, oldest first.
    fn drain_messages(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError>;
    fn purge_messages(&self, recipient: u64) -> Result<usize, StorageError>;
}
