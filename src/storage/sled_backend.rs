use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::directory::records::{
    ClientRecord, ClientUpdate, NewClient, NewNode, NodeRecord, NodeUpdate, QueuedMessage,
};

use super::{SledMode, StorageBackend, StorageError};

const NODE_PREFIX: &[u8] = b"v1:n:";
const NODE_TOKEN_PREFIX: &[u8] = b"v1:nt:";
const CLIENT_PREFIX: &[u8] = b"v1:c:";
const CLIENT_TOKEN_PREFIX: &[u8] = b"v1:ct:";
const MESSAGE_PREFIX: &[u8] = b"v1:m:";

pub struct SledStorage {
    db: sled::Db,
}

/// Key layout of one identity class: records by id plus a unique token index.
struct RecordSpace {
    records: &'static [u8],
    tokens: &'static [u8],
}

const NODES: RecordSpace = RecordSpace {
    records: NODE_PREFIX,
    tokens: NODE_TOKEN_PREFIX,
};

const CLIENTS: RecordSpace = RecordSpace {
    records: CLIENT_PREFIX,
    tokens: CLIENT_TOKEN_PREFIX,
};

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(match mode {
                SledMode::LowSpace => sled::Mode::LowSpace,
                SledMode::HighThroughput => sled::Mode::HighThroughput,
            });
        }

        let db = config.open().map_err(StorageError::Sled)?;
        Ok(Self { db })
    }

    fn next_id(&self) -> Result<u64, StorageError> {
        // sled ids start at zero; identities start at one.
        self.db
            .generate_id()
            .map(|id| id + 1)
            .map_err(StorageError::Sled)
    }

    fn insert_record<R: Serialize>(
        &self,
        space: &RecordSpace,
        id: u64,
        token: &str,
        record: &R,
    ) -> Result<(), StorageError> {
        let record_key = prefixed(space.records, &id.to_be_bytes());
        let token_key = prefixed(space.tokens, token.as_bytes());
        let value = serde_json::to_vec(record).map_err(StorageError::SerializeRecord)?;

        self.db
            .transaction(|tx| {
                if tx.get(token_key.as_slice())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        StorageError::DuplicateToken,
                    ));
                }
                tx.insert(token_key.as_slice(), &id.to_be_bytes()[..])?;
                tx.insert(record_key.as_slice(), value.as_slice())?;
                Ok(())
            })
            .map_err(flatten_transaction_error)
    }

    fn record_by_id<R: DeserializeOwned>(
        &self,
        space: &RecordSpace,
        id: u64,
    ) -> Result<Option<R>, StorageError> {
        let key = prefixed(space.records, &id.to_be_bytes());
        self.db
            .get(key)
            .map_err(StorageError::Sled)?
            .map(|raw| serde_json::from_slice(raw.as_ref()).map_err(StorageError::DeserializeRecord))
            .transpose()
    }

    fn record_by_token<R: DeserializeOwned>(
        &self,
        space: &RecordSpace,
        token: &str,
    ) -> Result<Option<R>, StorageError> {
        let token_key = prefixed(space.tokens, token.as_bytes());
        let Some(raw_id) = self.db.get(token_key).map_err(StorageError::Sled)? else {
            return Ok(None);
        };
        let Some(id) = decode_id(raw_id.as_ref()) else {
            return Ok(None);
        };
        self.record_by_id(space, id)
    }

    fn update_record<R, F>(
        &self,
        space: &RecordSpace,
        id: u64,
        mutate: F,
    ) -> Result<Option<R>, StorageError>
    where
        R: Serialize + DeserializeOwned,
        F: Fn(&mut R),
    {
        let key = prefixed(space.records, &id.to_be_bytes());
        self.db
            .transaction(|tx| {
                let Some(raw) = tx.get(key.as_slice())? else {
                    return Ok(None);
                };
                let mut record: R = serde_json::from_slice(raw.as_ref()).map_err(|source| {
                    ConflictableTransactionError::Abort(StorageError::DeserializeRecord(source))
                })?;
                mutate(&mut record);
                let value = serde_json::to_vec(&record).map_err(|source| {
                    ConflictableTransactionError::Abort(StorageError::SerializeRecord(source))
                })?;
                tx.insert(key.as_slice(), value)?;
                Ok(Some(record))
            })
            .map_err(flatten_transaction_error)
    }

    fn remove_record<R, F>(&self, space: &RecordSpace, id: u64, token_of: F) -> Result<bool, StorageError>
    where
        R: DeserializeOwned,
        F: Fn(&R) -> &str,
    {
        let key = prefixed(space.records, &id.to_be_bytes());
        self.db
            .transaction(|tx| {
                let Some(raw) = tx.remove(key.as_slice())? else {
                    return Ok(false);
                };
                let record: R = serde_json::from_slice(raw.as_ref()).map_err(|source| {
                    ConflictableTransactionError::Abort(StorageError::DeserializeRecord(source))
                })?;
                tx.remove(prefixed(space.tokens, token_of(&record).as_bytes()))?;
                Ok(true)
            })
            .map_err(flatten_transaction_error)
    }

    fn scan_messages(&self, recipient: u64) -> Result<Vec<(sled::IVec, QueuedMessage)>, StorageError> {
        let mut messages = Vec::new();
        for entry in self.db.scan_prefix(recipient_prefix(recipient)) {
            let (key, value) = entry.map_err(StorageError::Sled)?;
            let message: QueuedMessage =
                serde_json::from_slice(value.as_ref()).map_err(StorageError::DeserializeRecord)?;
            messages.push((key, message));
        }
        Ok(messages)
    }
}

fn prefixed(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

fn recipient_prefix(recipient: u64) -> Vec<u8> {
    prefixed(MESSAGE_PREFIX, &recipient.to_be_bytes())
}

fn decode_id(raw: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = raw.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn flatten_transaction_error(error: TransactionError<StorageError>) -> StorageError {
    match error {
        TransactionError::Abort(source) => source,
        TransactionError::Storage(source) => StorageError::Sled(source),
    }
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn insert_node(&self, node: NewNode) -> Result<NodeRecord, StorageError> {
        let record = node.into_record(self.next_id()?);
        self.insert_record(&NODES, record.id, &record.token, &record)?;
        Ok(record)
    }

    fn node_by_token(&self, token: &str) -> Result<Option<NodeRecord>, StorageError> {
        self.record_by_token(&NODES, token)
    }

    fn node_by_id(&self, id: u64) -> Result<Option<NodeRecord>, StorageError> {
        self.record_by_id(&NODES, id)
    }

    fn update_node(&self, id: u64, update: &NodeUpdate) -> Result<Option<NodeRecord>, StorageError> {
        self.update_record(&NODES, id, |record: &mut NodeRecord| update.apply(record))
    }

    fn remove_node(&self, id: u64) -> Result<bool, StorageError> {
        self.remove_record(&NODES, id, |record: &NodeRecord| record.token.as_str())
    }

    fn insert_client(&self, client: NewClient) -> Result<ClientRecord, StorageError> {
        let record = client.into_record(self.next_id()?);
        self.insert_record(&CLIENTS, record.id, &record.token, &record)?;
        Ok(record)
    }

    fn client_by_token(&self, token: &str) -> Result<Option<ClientRecord>, StorageError> {
        self.record_by_token(&CLIENTS, token)
    }

    fn client_by_id(&self, id: u64) -> Result<Option<ClientRecord>, StorageError> {
        self.record_by_id(&CLIENTS, id)
    }

    fn update_client(
        &self,
        id: u64,
        update: &ClientUpdate,
    ) -> Result<Option<ClientRecord>, StorageError> {
        self.update_record(&CLIENTS, id, |record: &mut ClientRecord| update.apply(record))
    }

    fn remove_client(&self, id: u64) -> Result<bool, StorageError> {
        self.remove_record(&CLIENTS, id, |record: &ClientRecord| record.token.as_str())
    }

    fn enqueue_message(&self, message: &QueuedMessage) -> Result<(), StorageError> {
        let sequence = self.db.generate_id().map_err(StorageError::Sled)?;
        let key = prefixed(&recipient_prefix(message.recipient), &sequence.to_be_bytes());
        let value = serde_json::to_vec(message).map_err(StorageError::SerializeRecord)?;
        self.db.insert(key, value).map_err(StorageError::Sled)?;
        self.db.flush().map_err(StorageError::Sled)?;
        Ok(())
    }

    fn pending_messages(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError> {
        Ok(self
            .scan_messages(recipient)?
            .into_iter()
            .map(|(_, message)| message)
            .collect())
    }

    fn drain_messages(&self, recipient: u64) -> Result<Vec<QueuedMessage>, StorageError> {
        let mut drained = Vec::new();
        for (key, message) in self.scan_messages(recipient)? {
            // Only the caller whose remove succeeds owns the message.
            if self.db.remove(&key).map_err(StorageError::Sled)?.is_some() {
                drained.push(message);
            }
        }
        self.db.flush().map_err(StorageError::Sled)?;
        Ok(drained)
    }

    fn purge_messages(&self, recipient: u64) -> Result<usize, StorageError> {
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for entry in self.db.scan_prefix(recipient_prefix(recipient)).keys() {
            batch.remove(entry.map_err(StorageError::Sled)?);
            removed += 1;
        }
        self.db.apply_batch(batch).map_err(StorageError::Sled)?;
        Ok(removed)
    }
}
