pub mod records;
mod token;

use std::sync::Arc;

use crate::storage::{StorageError, StorageFacade};

use self::records::{
    ClientRecord, ClientUpdate, IdentityKind, NewClient, NewNode, NodeRecord, NodeUpdate,
};
pub use self::token::generate_token;

const TOKEN_ATTEMPTS: usize = 4;

/// Persisted node and client records addressed by token or id.
#[derive(Clone)]
pub struct Directory {
    storage: Arc<StorageFacade>,
}

impl Directory {
    pub fn new(storage: Arc<StorageFacade>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<StorageFacade> {
        &self.storage
    }

    pub fn create_node(
        &self,
        components: &str,
        information: &str,
        resource: &str,
    ) -> Result<NodeRecord, StorageError> {
        self.with_fresh_token(|token| {
            self.storage.insert_node(NewNode {
                token,
                components: components.to_owned(),
                information: information.to_owned(),
                resource: resource.to_owned(),
            })
        })
    }

    pub fn create_client(&self, information: &str, resource: &str) -> Result<ClientRecord, StorageError> {
        self.with_fresh_token(|token| {
            self.storage.insert_client(NewClient {
                token,
                information: information.to_owned(),
                resource: resource.to_owned(),
            })
        })
    }

    pub fn node_by_token(&self, token: &str) -> Result<Option<NodeRecord>, StorageError> {
        self.storage.node_by_token(token)
    }

    pub fn node_by_id(&self, id: u64) -> Result<Option<NodeRecord>, StorageError> {
        self.storage.node_by_id(id)
    }

    pub fn client_by_token(&self, token: &str) -> Result<Option<ClientRecord>, StorageError> {
        self.storage.client_by_token(token)
    }

    pub fn client_by_id(&self, id: u64) -> Result<Option<ClientRecord>, StorageError> {
        self.storage.client_by_id(id)
    }

    pub fn update_node(&self, id: u64, update: NodeUpdate) -> Result<Option<NodeRecord>, StorageError> {
        self.storage.update_node(id, update)
    }

    pub fn update_client(
        &self,
        id: u64,
        update: ClientUpdate,
    ) -> Result<Option<ClientRecord>, StorageError> {
        self.storage.update_client(id, update)
    }

    pub fn delete(&self, kind: IdentityKind, id: u64) -> Result<bool, StorageError> {
        match kind {
            IdentityKind::Node => self.storage.remove_node(id),
            IdentityKind::Client => self.storage.remove_client(id),
        }
    }

    fn with_fresh_token<R>(
        &self,
        mut insert: impl FnMut(String) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut attempt = 1;
        loop {
            match insert(generate_token()) {
                Err(StorageError::DuplicateToken) if attempt < TOKEN_ATTEMPTS => attempt += 1,
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use crate::storage::StorageFacade;

    use super::records::{IdentityKind, NodeUpdate};
    use super::Directory;

    fn directory() -> Directory {
        Directory::new(Arc::new(StorageFacade::in_memory()))
    }

    #[test]
    fn repeated_registration_yields_distinct_tokens() {
        let directory = directory();
        let tokens: HashSet<_> = (0..32)
            .map(|_| {
                directory
                    .create_client("{}", "tcp://127.0.0.1:1")
                    .expect("client create should work")
                    .token
            })
            .collect();
        assert_eq!(tokens.len(), 32);
    }

    #[test]
    fn node_lifecycle_through_directory() {
        let directory = directory();
        let node = directory
            .create_node("ipfs://QmA", "{\"v\":1}", "tcp://10.0.0.2:7000")
            .expect("node create should work");
        assert_eq!(
            directory.node_by_token(&node.token).expect("lookup should work"),
            Some(node.clone())
        );

        let updated = directory
            .update_node(
                node.id,
                NodeUpdate {
                    components: None,
                    information: Some("{\"v\":2}".to_owned()),
                },
            )
            .expect("update should work")
            .expect("node should exist");
        assert_eq!(updated.information, "{\"v\":2}");
        assert_eq!(updated.components, "ipfs://QmA");

        assert!(directory.delete(IdentityKind::Node, node.id).expect("delete should work"));
        assert!(directory.node_by_id(node.id).expect("lookup should work").is_none());
    }
}
