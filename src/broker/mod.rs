mod handlers;
mod router;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde_json::{json, Value};

use crate::directory::records::IdentityKind;
use crate::directory::Directory;
use crate::dispatch::{Dispatcher, HandlerKind, Registry, Reply, Request, RequestHandler};
use crate::events::{EventEmitter, CLIENT_DISCONNECTED_EVENT, NODE_DISCONNECTED_EVENT};
use crate::logging::{LogLevel, Logger};
use crate::presence::{Departure, PresenceTracker};
use crate::queue::MessageQueue;
use crate::session::SessionValidator;
use crate::side_store::SideStores;
use crate::storage::{StorageError, StorageFacade};
use crate::transport::TransportAdapter;

pub const INVALID_REQUEST_ERROR: &str = "InvalidRequest";
pub const UNAUTHENTICATED_ERROR: &str = "Unauthenticated";
pub const STORAGE_ERROR: &str = "StorageFailure";
pub const UNKNOWN_RECIPIENT_ERROR: &str = "UnknownRecipient";
pub const NOT_DELIVERABLE_ERROR: &str = "NotDeliverable";
pub const DISCONNECTED_ERROR: &str = "Disconnected";

/// One mutex per identity. Login, update and delete of the same identity hold
/// it from the record read to the presence change, so they apply in order.
#[derive(Default)]
struct IdentityLocks {
    locks: Mutex<HashMap<(IdentityKind, u64), Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    fn acquire(&self, kind: IdentityKind, id: u64) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .expect("identity lock map poisoned")
                .entry((kind, id))
                .or_default(),
        )
    }

    /// Called once the identity is deleted; later lookups find no record anyway.
    fn forget(&self, kind: IdentityKind, id: u64) {
        self.locks
            .lock()
            .expect("identity lock map poisoned")
            .remove(&(kind, id));
    }
}

/// Directory, presence and relay in one place. Every attached transport
/// dispatches into the same broker.
pub struct Broker {
    directory: Directory,
    sessions: SessionValidator,
    queue: MessageQueue,
    presence: PresenceTracker,
    identity_locks: IdentityLocks,
    side_stores: SideStores,
    events: Arc<EventEmitter>,
    adapters: RwLock<HashMap<String, Arc<dyn TransportAdapter>>>,
    registry: Registry,
    logger: Arc<Logger>,
}

impl Broker {
    pub fn new(
        storage: Arc<StorageFacade>,
        side_stores: SideStores,
        events: Arc<EventEmitter>,
        logger: Arc<Logger>,
    ) -> Arc<Self> {
        let directory = Directory::new(Arc::clone(&storage));
        Arc::new(Self {
            sessions: SessionValidator::new(directory.clone()),
            queue: MessageQueue::new(storage),
            directory,
            presence: PresenceTracker::new(),
            identity_locks: IdentityLocks::default(),
            side_stores,
            events,
            adapters: RwLock::new(HashMap::new()),
            registry: Registry::standard(),
            logger,
        })
    }

    /// Loads the shared binding table into `adapter` and routes its
    /// disconnects into presence cleanup. Replaces an adapter with the same id.
    pub fn attach_adapter(self: &Arc<Self>, adapter: Arc<dyn TransportAdapter>) {
        let handler: Arc<dyn RequestHandler> = self.clone();
        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            Arc::downgrade(&handler),
            Arc::clone(&self.logger),
        );
        adapter.load_listeners(Arc::new(dispatcher));

        let broker: Weak<Self> = Arc::downgrade(self);
        adapter.on_disconnect(Arc::new(move |protocol, address| {
            if let Some(broker) = broker.upgrade() {
                broker.logout(protocol, address);
            }
        }));

        let protocol_id = adapter.protocol_id().to_owned();
        self.logger.log(
            LogLevel::Info,
            Some("broker"),
            "Transport adapter attached",
            Some(json!({ "protocol": protocol_id, "needs_queue": adapter.needs_queue() })),
        );
        self.adapters
            .write()
            .expect("adapter map lock poisoned")
            .insert(protocol_id, adapter);
    }

    /// Shuts every adapter down and forgets it.
    pub fn detach_adapters(&self) {
        let adapters: Vec<Arc<dyn TransportAdapter>> = self
            .adapters
            .write()
            .expect("adapter map lock poisoned")
            .drain()
            .map(|(_, adapter)| adapter)
            .collect();
        for adapter in adapters {
            adapter.shutdown();
        }
    }

    pub fn adapter(&self, protocol: &str) -> Option<Arc<dyn TransportAdapter>> {
        self.adapters
            .read()
            .expect("adapter map lock poisoned")
            .get(protocol)
            .cloned()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.events
    }

    /// Drops every session on (protocol, address). Safe to repeat.
    pub fn logout(&self, protocol: &str, address: &str) -> Vec<Departure> {
        let departed = self.presence.logout(protocol, address);
        for departure in &departed {
            self.announce_departure(departure);
        }
        departed
    }

    fn announce_departure(&self, departure: &Departure) {
        let event = match departure.kind() {
            IdentityKind::Node => NODE_DISCONNECTED_EVENT,
            IdentityKind::Client => CLIENT_DISCONNECTED_EVENT,
        };
        self.logger.log(
            LogLevel::Debug,
            Some("broker::presence"),
            "Session ended",
            Some(departure.event_payload()),
        );
        self.notify(event, departure.event_payload());
    }

    fn notify(&self, event: &str, payload: Value) {
        if let Err(error) = self.events.emit(event, Some(payload)) {
            self.logger.log(
                LogLevel::Warn,
                Some("broker::events"),
                "Notification listener failed",
                Some(json!({ "event": event, "error": error.to_string() })),
            );
        }
    }

    fn reply_storage_failure(&self, reply: Reply, operation: &str, error: &StorageError) {
        self.logger.log(
            LogLevel::Error,
            Some("broker::storage"),
            "Persistence call failed",
            Some(json!({ "operation": operation, "error": error.to_string() })),
        );
        reply.send(storage_failure(error));
    }
}

impl RequestHandler for Broker {
    fn handle(&self, kind: HandlerKind, request: Request, reply: Reply) {
        match kind {
            HandlerKind::RegisterNode => self.register_node(&request, reply),
            HandlerKind::UpdateNode => self.update_node(&request, reply),
            HandlerKind::DeleteNode => self.delete_identity(IdentityKind::Node, &request, reply),
            HandlerKind::LoginNode => self.login_node(&request, reply),
            HandlerKind::RegisterClient => self.register_client(&request, reply),
            HandlerKind::UpdateClient => self.update_client(&request, reply),
            HandlerKind::DeleteClient => self.delete_identity(IdentityKind::Client, &request, reply),
            HandlerKind::LoginClient => self.login_client(&request, reply),
            HandlerKind::Logout => {
                let departed = self.logout(&request.protocol, &request.address);
                reply.send(json!({ "success": true, "removed": departed.len() }));
            }
            HandlerKind::Ping => self.ping(&request, reply),
            HandlerKind::Forward => self.forward(&request, reply),
        }
    }
}

fn failure(error: &str) -> Value {
    json!({ "success": false, "error": error })
}

fn storage_failure(error: &StorageError) -> Value {
    json!({ "success": false, "error": STORAGE_ERROR, "retryable": error.is_retryable() })
}

/// Bearer token from `authentication.token`, falling back to `parameters.token`.
fn token_of(request: &Request) -> Option<&str> {
    request
        .envelope
        .token
        .as_deref()
        .or_else(|| request.envelope.parameter_str("token"))
        .filter(|token| !token.is_empty())
}
