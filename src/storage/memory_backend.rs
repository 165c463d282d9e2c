use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::directory::records::{
    ClientRecord, ClientUpdate, NewClient, NewNode, NodeRecord, NodeUpdate, QueuedMessage,
};

use super::{StorageBackend, StorageError};

/// Volatile backend for tests and throwaway instances; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    last_id: u64,
    last_sequence: u64,
    nodes: BTreeMap<u64, NodeRecord>,
    node_tokens: HashMap<String, u64>,
    clients: BTreeMap<u64, ClientRecord>,
    client_tokens: HashMap<String, u64>,
    messages: BTreeMap<(u64, u64), QueuedMessage>,
}

impl MemoryState {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn message_keys(&self, recipient: u64) -> Vec<(u64, u64)> {
        self.messages
            .range((recipient, 0)..=(recipient, u64::MAX))
            .map(|(key, _)| *key)
            .collect()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().expect("memory storage lock poisoned");
        f(&mut state)
    }
}

impl StorageBackend for MemoryStorage {
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn insert_node(&self, node: NewNode) -> Result<NodeRecord, StorageError> {
        self.with_state(|state| {
            if state.node_tokens.contains_key(&node.token) {
                return Err(StorageError::DuplicateToken);
            }
            let record = node.into_record(state.next_id());
            state.node_tokens.insert(record.token.clone(), record.id);
            state.nodes.insert(record.id, record.clone());
            Ok(record)
        })
    }

    fn node_by_token(&self, token: &str) -> Result<Option<NodeRecord>, StorageError> {
        Ok(self.with_state(|state| {
            state
                .node_tokens
                .get(token)
                .and_then(|id| state.nodes.get(id))
                .cloned()
        }))
    }

    fn node_by_id(&self, id: u64) -> Result<Option<NodeRecord>, StorageError> {
        Ok(self.with_state(|state| state.nodes.get(&id).cloned()))
    }

    fn update_node(&self, id: u64, update: &NodeUpdate) -> Result<Option<NodeRecord>, StorageError> {
        Ok(self.with_state(|state| {
            state.nodes.get_mut(&id).map(|record| {
                update.apply(record);
                record.clone()
            })
        }))
    }

    fn remove_node(&self, id: u64) -> Result<bool, StorageError> {
        Ok(self.with_state(|state| match state.nodes.remove(&id) {
            Some(record) => {
                state.node_tokens.remove(&record.token);
                true
            }
            None => false,
        }))
    }

    fn insert_client(&self, client: NewClient) -> Result<ClientRecord, StorageError> {
        self.with_state(|state| {
            if state.client_tokens.contains_key(&client.token) {
                return Err(StorageError::DuplicateToken);
            }
            let record = client.into_record(state.next_id());
            state.client_tokens.insert(record.token.clone(), record.id);
            state.clients.insert(record.id, record.clone());
            Ok(record)
        })
    }

    fn client_by_token(&self, token: &str) -> Result<Option<ClientRecord>, StorageError> {
        Ok(self.with_state(|state| {
            state
                .client_tokens
                .get(token)
                .and_then(|id| state.clients.get(id))
                .cloned()
        }))
    }

    fn client_by_id(&self, id: u64) -> Result<Option<ClientRecord>, StorageError> {
        Ok(self.with_state(|state| state.clients.get(&id).cloned()))
    }

    fn update_client(
        &self,
        id: u64,
        update: &ClientUpdate,
    ) -> Result<Option<ClientRecord>, StorageError> {
        Ok(self.with_state(|state| {
            state.clients.get_mut(&id).map(|record| {
                update.apply(record);
                record.clone()
            })
        }))
    }

    fn remove_client(&self, id: u64) -> Result<bool, StorageError> {
        Ok(self.with_state(|state| match state.clients.remove(&id) {
            Some(record) => {
                state.client_tokens.remove(&record.token);
                true
            }
            None => false,
        }))
    }

    fn enqueue_message(&self, message: &QueuedMessage) -> Result<(), StorageError> {
        self.with_state(|state| {
            state.last_sequence += 1;
            let key = (message.recipient, state.last_sequence);
            state.messages.insert(key, message.clone());
        });
        Ok(())
    }

    fn pending_messages(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError> {
        Ok(self.with_state(|state| {
            state
                .messages
                .range((recipient, 0)..=(recipient, u64::MAX))
                .map(|(_, message)| message.clone())
                .collect()
        }))
    }

    fn drain_messages(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError> {
        Ok(self.with_state(|state| {
            state
                .message_keys(recipient)
                .into_iter()
                .filter_map(|key| state.messages.remove(&key))
                .collect()
        }))
    }

    fn purge_messages(&self, recipient: u64) -> Result<usize, StorageError> {
        Ok(self.with_state(|state| {
            let keys = state.message_keys(recipient);
            for key in &keys {
                state.messages.remove(key);
            }
            keys.len()
        }))
    }
}
