use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::directory::records::QueuedMessage;
use crate::storage::{StorageError, StorageFacade};

/// Field name that carries bearer credentials anywhere in a payload.
pub const CREDENTIAL_FIELD: &str = "token";

/// Held messages for offline nodes, oldest first per recipient.
#[derive(Clone)]
pub struct MessageQueue {
    storage: Arc<StorageFacade>,
}

/// Shape of a held message as surfaced in a node login reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueuedView {
    pub sender: u64,
    pub recipient: u64,
    pub action: String,
    pub message: String,
    pub queued_at: String,
}

impl From<QueuedMessage> for QueuedView {
    fn from(message: QueuedMessage) -> Self {
        Self {
            sender: message.sender,
            recipient: message.recipient,
            action: message.action,
            message: message.message,
            queued_at: message.queued_at.to_rfc3339(),
        }
    }
}

impl MessageQueue {
    pub fn new(storage: Arc<StorageFacade>) -> Self {
        Self { storage }
    }

    /// Strips credentials from `parameters` and persists the result.
    pub fn enqueue(
        &self,
        sender: u64,
        recipient: u64,
        action: &str,
        parameters: &Value,
    ) -> Result<QueuedMessage, StorageError> {
        let mut payload = parameters.clone();
        strip_credentials(&mut payload);

        let message = QueuedMessage {
            message_id: Uuid::new_v4(),
            sender,
            recipient,
            action: action.to_owned(),
            message: payload.to_string(),
            queued_at: Utc::now(),
        };
        self.storage.enqueue_message(message.clone())?;
        Ok(message)
    }

    pub fn pending_for(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError> {
        self.storage.pending_messages(recipient)
    }

    /// Removes and returns everything held for `recipient`. Delivery is at-most-once.
    pub fn drain_for(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError> {
        self.storage.drain_messages(recipient)
    }

    pub fn purge_for(&self, recipient: u64) -> Result<usize, StorageError> {
        self.storage.purge_messages(recipient)
    }
}

pub fn strip_credentials(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove(CREDENTIAL_FIELD);
            for nested in map.values_mut() {
                strip_credentials(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_credentials(item);
            }
        }
        _ => {}
    }
}
