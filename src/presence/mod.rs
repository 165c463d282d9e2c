use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::directory::records::IdentityKind;

/// Connection identity inside one transport: (protocol id, transport address).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub protocol: String,
    pub address: String,
}

impl SessionKey {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            address: address.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSession {
    pub id: u64,
    pub key: SessionKey,
    /// Cached from the Directory at login, refreshed on update.
    pub components: String,
    pub logged_in_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientSession {
    pub id: u64,
    pub key: SessionKey,
    pub logged_in_at: DateTime<Utc>,
}

pub trait SessionEntry: Clone {
    fn identity_id(&self) -> u64;
}

impl SessionEntry for NodeSession {
    fn identity_id(&self) -> u64 {
        self.id
    }
}

impl SessionEntry for ClientSession {
    fn identity_id(&self) -> u64 {
        self.id
    }
}

/// One identity class worth of live sessions.
pub struct SessionTable<T> {
    entries: Mutex<HashMap<SessionKey, T>>,
}

impl<T> Default for SessionTable<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: SessionEntry> SessionTable<T> {
    pub fn upsert(&self, key: SessionKey, entry: T) -> Option<T> {
        self.entries
            .lock()
            .expect("session table lock poisoned")
            .insert(key, entry)
    }

    pub fn remove(&self, key: &SessionKey) -> Option<T> {
        self.entries
            .lock()
            .expect("session table lock poisoned")
            .remove(key)
    }

    /// Removes `key` only if it is still held by `id`.
    pub fn remove_if_owned(&self, key: &SessionKey, id: u64) -> Option<T> {
        let mut entries = self.entries.lock().expect("session table lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.identity_id() == id => entries.remove(key),
            _ => None,
        }
    }

    pub fn remove_identity(&self, id: u64) -> Vec<T> {
        let mut entries = self.entries.lock().expect("session table lock poisoned");
        let keys: Vec<SessionKey> = entries
            .iter()
            .filter(|(_, entry)| entry.identity_id() == id)
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| entries.remove(key)).collect()
    }

    pub fn find_by_id(&self, id: u64) -> Option<T> {
        self.entries
            .lock()
            .expect("session table lock poisoned")
            .values()
            .find(|entry| entry.identity_id() == id)
            .cloned()
    }

    pub fn find_all_by_id(&self, id: u64) -> Vec<T> {
        self.entries
            .lock()
            .expect("session table lock poisoned")
            .values()
            .filter(|entry| entry.identity_id() == id)
            .cloned()
            .collect()
    }

    /// Applies `mutate` to every entry of `id`; returns how many were touched.
    pub fn update_identity(&self, id: u64, mut mutate: impl FnMut(&mut T)) -> usize {
        let mut entries = self.entries.lock().expect("session table lock poisoned");
        let mut touched = 0;
        for entry in entries.values_mut().filter(|entry| entry.identity_id() == id) {
            mutate(entry);
            touched += 1;
        }
        touched
    }

    pub fn count(&self) -> usize {
        self.entries.lock().expect("session table lock poisoned").len()
    }
}

/// A session removed by logout, disconnect or delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Departure {
    Node(NodeSession),
    Client(ClientSession),
}

impl Departure {
    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::Node(_) => IdentityKind::Node,
            Self::Client(_) => IdentityKind::Client,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Self::Node(session) => session.id,
            Self::Client(session) => session.id,
        }
    }

    pub fn key(&self) -> &SessionKey {
        match self {
            Self::Node(session) => &session.key,
            Self::Client(session) => &session.key,
        }
    }

    pub fn event_payload(&self) -> Value {
        json!({
            "id": self.id(),
            "kind": self.kind().as_str(),
            "protocol": self.key().protocol,
            "address": self.key().address,
        })
    }
}

#[derive(Default)]
pub struct PresenceTracker {
    nodes: SessionTable<NodeSession>,
    clients: SessionTable<ClientSession>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn login_node(&self, id: u64, protocol: &str, address: &str, components: &str) -> NodeSession {
        let key = SessionKey::new(protocol, address);
        let session = NodeSession {
            id,
            key: key.clone(),
            components: components.to_owned(),
            logged_in_at: Utc::now(),
        };
        self.nodes.upsert(key, session.clone());
        session
    }

    pub fn login_client(&self, id: u64, protocol: &str, address: &str) -> ClientSession {
        let key = SessionKey::new(protocol, address);
        let session = ClientSession {
            id,
            key: key.clone(),
            logged_in_at: Utc::now(),
        };
        self.clients.upsert(key, session.clone());
        session
    }

    /// Drops both the node and client entry on (protocol, address). Missing entries are ignored.
    pub fn logout(&self, protocol: &str, address: &str) -> Vec<Departure> {
        let key = SessionKey::new(protocol, address);
        let mut departed = Vec::new();
        if let Some(session) = self.nodes.remove(&key) {
            departed.push(Departure::Node(session));
        }
        if let Some(session) = self.clients.remove(&key) {
            departed.push(Departure::Client(session));
        }
        departed
    }

    /// Undoes one login if the entry still belongs to `id`.
    pub fn withdraw(&self, kind: IdentityKind, id: u64, protocol: &str, address: &str) -> Option<Departure> {
        let key = SessionKey::new(protocol, address);
        match kind {
            IdentityKind::Node => self.nodes.remove_if_owned(&key, id).map(Departure::Node),
            IdentityKind::Client => self.clients.remove_if_owned(&key, id).map(Departure::Client),
        }
    }

    pub fn remove_identity(&self, kind: IdentityKind, id: u64) -> Vec<Departure> {
        match kind {
            IdentityKind::Node => self
                .nodes
                .remove_identity(id)
                .into_iter()
                .map(Departure::Node)
                .collect(),
            IdentityKind::Client => self
                .clients
                .remove_identity(id)
                .into_iter()
                .map(Departure::Client)
                .collect(),
        }
    }

    pub fn refresh_node_components(&self, id: u64, components: &str) -> usize {
        self.nodes
            .update_identity(id, |session| session.components = components.to_owned())
    }

    pub fn find_online_node(&self, id: u64) -> Option<NodeSession> {
        self.nodes.find_by_id(id)
    }

    /// Every live session of node `id`, most recent login first.
    pub fn online_node_sessions(&self, id: u64) -> Vec<NodeSession> {
        let mut sessions = self.nodes.find_all_by_id(id);
        sessions.sort_by(|left, right| {
            right
                .logged_in_at
                .cmp(&left.logged_in_at)
                .then_with(|| left.key.protocol.cmp(&right.key.protocol))
                .then_with(|| left.key.address.cmp(&right.key.address))
        });
        sessions
    }

    pub fn find_online_client(&self, id: u64) -> Option<ClientSession> {
        self.clients.find_by_id(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.count()
    }

    pub fn client_count(&self) -> usize {
        self.clients.count()
    }
}
