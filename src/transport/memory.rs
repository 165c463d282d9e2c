use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::dispatch::{Dispatcher, Request};

use super::envelope::{InboundEnvelope, OutboundEnvelope};
use super::{DisconnectHook, TransportAdapter, TransportError};

type Outboxes = Arc<Mutex<HashMap<String, Vec<OutboundEnvelope>>>>;

/// In-process adapter. Peers are plain address strings and every frame sent
/// to a peer lands in its outbox, where the embedder picks it up.
pub struct MemoryTransport {
    protocol_id: String,
    needs_queue: bool,
    dispatcher: RwLock<Option<Arc<Dispatcher>>>,
    disconnect_hooks: RwLock<Vec<DisconnectHook>>,
    outboxes: Outboxes,
}

impl MemoryTransport {
    pub fn new(protocol_id: impl Into<String>, needs_queue: bool) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            needs_queue,
            dispatcher: RwLock::new(None),
            disconnect_hooks: RwLock::new(Vec::new()),
            outboxes: Arc::default(),
        }
    }

    pub fn connect(&self, address: &str) {
        self.outboxes
            .lock()
            .expect("memory outbox lock poisoned")
            .entry(address.to_owned())
            .or_default();
    }

    /// Orderly peer departure: the peer is forgotten and disconnect hooks fire.
    pub fn disconnect(&self, address: &str) {
        self.sever(address);
        let hooks = self
            .disconnect_hooks
            .read()
            .expect("disconnect hook lock poisoned")
            .clone();
        for hook in hooks {
            hook(&self.protocol_id, address);
        }
    }

    /// Drops the peer without telling anyone, like a socket that died silently.
    pub fn sever(&self, address: &str) {
        self.outboxes
            .lock()
            .expect("memory outbox lock poisoned")
            .remove(address);
    }

    /// Feeds one inbound message from `address` through the dispatcher.
    /// Replies to a peer that is not connected are discarded.
    pub fn inject(&self, address: &str, channel: &str, envelope: InboundEnvelope) -> bool {
        let dispatcher = self
            .dispatcher
            .read()
            .expect("memory dispatcher lock poisoned")
            .clone();
        let Some(dispatcher) = dispatcher else {
            return false;
        };

        let outboxes = Arc::clone(&self.outboxes);
        let peer = address.to_owned();
        dispatcher.dispatch(
            Request {
                protocol: self.protocol_id.clone(),
                address: address.to_owned(),
                channel: channel.to_owned(),
                envelope,
            },
            Box::new(move |reply| {
                if let Some(outbox) = outboxes
                    .lock()
                    .expect("memory outbox lock poisoned")
                    .get_mut(&peer)
                {
                    outbox.push(reply);
                }
            }),
        );
        true
    }

    /// Drains everything delivered to `address` so far.
    pub fn take_outbox(&self, address: &str) -> Vec<OutboundEnvelope> {
        self.outboxes
            .lock()
            .expect("memory outbox lock poisoned")
            .get_mut(address)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.outboxes.lock().expect("memory outbox lock poisoned").len()
    }
}

impl TransportAdapter for MemoryTransport {
    fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn needs_queue(&self) -> bool {
        self.needs_queue
    }

    fn load_listeners(&self, dispatcher: Arc<Dispatcher>) {
        *self
            .dispatcher
            .write()
            .expect("memory dispatcher lock poisoned") = Some(dispatcher);
    }

    fn on_disconnect(&self, hook: DisconnectHook) {
        self.disconnect_hooks
            .write()
            .expect("disconnect hook lock poisoned")
            .push(hook);
    }

    fn send(&self, address: Option<&str>, envelope: &OutboundEnvelope) -> Result<(), TransportError> {
        let mut outboxes = self.outboxes.lock().expect("memory outbox lock poisoned");
        match address {
            Some(address) => {
                let outbox = outboxes
                    .get_mut(address)
                    .ok_or_else(|| TransportError::UnknownPeer {
                        address: address.to_owned(),
                    })?;
                outbox.push(envelope.clone());
            }
            None => {
                for outbox in outboxes.values_mut() {
                    outbox.push(envelope.clone());
                }
            }
        }
        Ok(())
    }

    fn is_connected(&self, address: &str) -> bool {
        self.outboxes
            .lock()
            .expect("memory outbox lock poisoned")
            .contains_key(address)
    }

    fn shutdown(&self) {
        let peers: Vec<String> = self
            .outboxes
            .lock()
            .expect("memory outbox lock poisoned")
            .keys()
            .cloned()
            .collect();
        for peer in peers {
            self.disconnect(&peer);
        }
        self.dispatcher
            .write()
            .expect("memory dispatcher lock poisoned")
            .take();
    }
}
