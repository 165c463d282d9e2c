use crate::directory::records::{ClientRecord, IdentityKind, NodeRecord};
use crate::directory::Directory;
use crate::storage::StorageError;

/// A Directory record resolved from a bearer token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Node(NodeRecord),
    Client(ClientRecord),
}

impl Identity {
    pub fn id(&self) -> u64 {
        match self {
            Self::Node(record) => record.id,
            Self::Client(record) => record.id,
        }
    }

    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::Node(_) => IdentityKind::Node,
            Self::Client(_) => IdentityKind::Client,
        }
    }
}

/// Token lookups never fail for an unknown token; only storage faults are errors.
#[derive(Clone)]
pub struct SessionValidator {
    directory: Directory,
}

impl SessionValidator {
    pub fn new(directory: Directory) -> Self {
        Self { directory }
    }

    pub fn validate(&self, kind: IdentityKind, token: &str) -> Result<Option<Identity>, StorageError> {
        Ok(match kind {
            IdentityKind::Node => self.validate_node(token)?.map(Identity::Node),
            IdentityKind::Client => self.validate_client(token)?.map(Identity::Client),
        })
    }

    pub fn validate_node(&self, token: &str) -> Result<Option<NodeRecord>, StorageError> {
        if token.is_empty() {
            return Ok(None);
        }
        self.directory.node_by_token(token)
    }

    pub fn validate_client(&self, token: &str) -> Result<Option<ClientRecord>, StorageError> {
        if token.is_empty() {
            return Ok(None);
        }
        self.directory.client_by_token(token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::directory::records::IdentityKind;
    use crate::directory::Directory;
    use crate::storage::StorageFacade;

    use super::SessionValidator;

    #[test]
    fn resolves_only_matching_class() {
        let directory = Directory::new(Arc::new(StorageFacade::in_memory()));
        let node = directory
            .create_node("ipfs://Qm", "{}", "tcp://a")
            .expect("node create should work");
        let validator = SessionValidator::new(directory);

        let identity = validator
            .validate(IdentityKind::Node, &node.token)
            .expect("validate should work")
            .expect("node token should resolve");
        assert_eq!(identity.id(), node.id);
        assert_eq!(identity.kind(), IdentityKind::Node);

        assert!(validator
            .validate(IdentityKind::Client, &node.token)
            .expect("validate should work")
            .is_none());
        assert!(validator
            .validate_node("unknown")
            .expect("validate should work")
            .is_none());
        assert!(validator.validate_node("").expect("validate should work").is_none());
    }
}
