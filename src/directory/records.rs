use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    Node,
    Client,
}

impl IdentityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: u64,
    pub token: String,
    /// Scheme-prefixed location in a decentralized store, e.g. `ipfs://Qm...`.
    pub components: String,
    pub information: String,
    /// Transport address at registration time, `protocol://address`.
    pub resource: String,
    pub active: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClientRecord {
    pub id: u64,
    pub token: String,
    pub information: String,
    pub resource: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewNode {
    pub token: String,
    pub components: String,
    pub information: String,
    pub resource: String,
}

impl NewNode {
    pub fn into_record(self, id: u64) -> NodeRecord {
        NodeRecord {
            id,
            token: self.token,
            components: self.components,
            information: self.information,
            resource: self.resource,
            active: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewClient {
    pub token: String,
    pub information: String,
    pub resource: String,
}

impl NewClient {
    pub fn into_record(self, id: u64) -> ClientRecord {
        ClientRecord {
            id,
            token: self.token,
            information: self.information,
            resource: self.resource,
        }
    }
}

/// Absent fields keep their stored value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeUpdate {
    pub components: Option<String>,
    pub information: Option<String>,
}

impl NodeUpdate {
    pub fn apply(&self, record: &mut NodeRecord) {
        if let Some(components) = &self.components {
            record.components = components.clone();
        }
        if let Some(information) = &self.information {
            record.information = information.clone();
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientUpdate {
    pub information: Option<String>,
}

impl ClientUpdate {
    pub fn apply(&self, record: &mut ClientRecord) {
        if let Some(information) = &self.information {
            record.information = information.clone();
        }
    }
}

/// A message held for an offline node. `message` is the serialized
/// parameters object with every credential field already removed.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message_id: Uuid,
    pub sender: u64,
    pub recipient: u64,
    pub action: String,
    pub message: String,
    pub queued_at: DateTime<Utc>,
}

/// Splits `scheme://rest` into its parts. Returns `None` when no scheme prefix exists.
pub fn split_scheme(uri: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = uri.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '+');
    valid.then_some((scheme, rest))
}

pub fn resource_for(protocol: &str, address: &str) -> String {
    format!("{protocol}://{address}")
}
