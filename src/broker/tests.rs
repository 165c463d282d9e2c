use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use crate::dispatch::{
    CLIENT_TO_INSTANCE, CLIENT_TO_NODE, INSTANCE_TO_CLIENT, INSTANCE_TO_NODE, NODE_TO_INSTANCE,
    UNKNOWN_ACTION_ERROR,
};
use crate::events::{EventEmitter, MESSAGE_QUEUED_EVENT, NODE_DISCONNECTED_EVENT};
use crate::logging::Logger;
use crate::side_store::SideStores;
use crate::storage::tests::StalledBackend;
use crate::storage::{StorageEngine, StorageFacade, DEFAULT_OPERATION_TIMEOUT};
use crate::transport::envelope::{InboundEnvelope, OutboundEnvelope};
use crate::transport::MemoryTransport;

use super::{Broker, NOT_DELIVERABLE_ERROR, UNAUTHENTICATED_ERROR, UNKNOWN_RECIPIENT_ERROR};

struct Harness {
    broker: Arc<Broker>,
    mem: Arc<MemoryTransport>,
    volatile: Arc<MemoryTransport>,
}

impl Harness {
    fn new() -> Self {
        Self::with_storage(StorageFacade::in_memory())
    }

    fn with_storage(storage: StorageFacade) -> Self {
        let broker = Broker::new(
            Arc::new(storage),
            SideStores::new(),
            Arc::new(EventEmitter::new()),
            Arc::new(Logger::silent()),
        );
        let mem = Arc::new(MemoryTransport::new("mem", true));
        let volatile = Arc::new(MemoryTransport::new("volatile", false));
        broker.attach_adapter(mem.clone());
        broker.attach_adapter(volatile.clone());
        Self {
            broker,
            mem,
            volatile,
        }
    }

    /// Sends one request from `address` and returns the single reply it got.
    fn call(
        &self,
        transport: &MemoryTransport,
        address: &str,
        channel: &str,
        envelope: InboundEnvelope,
    ) -> OutboundEnvelope {
        transport.connect(address);
        assert!(transport.inject(address, channel, envelope));
        let mut outbox = transport.take_outbox(address);
        assert_eq!(outbox.len(), 1, "expected exactly one reply, got {outbox:?}");
        outbox.remove(0)
    }

    fn register_node(&self, address: &str, components: &str) -> (u64, String) {
        let reply = self.call(
            &self.mem,
            address,
            NODE_TO_INSTANCE,
            InboundEnvelope::new(
                "register",
                json!({ "components": components, "information": { "name": address } }),
            ),
        );
        credentials(&reply)
    }

    fn register_client(&self, address: &str) -> (u64, String) {
        let reply = self.call(
            &self.mem,
            address,
            CLIENT_TO_INSTANCE,
            InboundEnvelope::new("register", json!({ "information": "{}" })),
        );
        credentials(&reply)
    }

    fn login_node(&self, transport: &MemoryTransport, address: &str, token: &str) -> OutboundEnvelope {
        self.call(
            transport,
            address,
            NODE_TO_INSTANCE,
            InboundEnvelope::new("login", json!({})).with_token(token),
        )
    }
}

fn credentials(reply: &OutboundEnvelope) -> (u64, String) {
    assert_eq!(reply.success(), Some(true), "register failed: {reply:?}");
    let id = reply.parameters["id"].as_u64().expect("id should be a number");
    let token = reply.parameters["token"]
        .as_str()
        .expect("token should be a string")
        .to_owned();
    (id, token)
}

fn error_of(reply: &OutboundEnvelope) -> &str {
    reply.parameters["error"].as_str().unwrap_or_default()
}

#[test]
fn registration_issues_unique_tokens_and_ids() {
    let harness = Harness::new();
    let (node_id, node_token) = harness.register_node("n1", "ipfs://QmA");
    let (other_id, other_token) = harness.register_node("n2", "ipfs://QmB");
    let (client_id, client_token) = harness.register_client("c1");

    assert_ne!(node_token, other_token);
    assert_ne!(node_token, client_token);
    assert_eq!(node_token.len(), 64);
    assert_ne!(node_id, other_id);
    assert_ne!(node_id, client_id);

    let mut tokens = std::collections::HashSet::new();
    for index in 0..32 {
        let (_, token) = harness.register_client(&format!("burst-{index}"));
        assert!(tokens.insert(token), "token repeated at registration {index}");
    }
}

#[test]
fn register_node_requires_components() {
    let harness = Harness::new();
    let reply = harness.call(
        &harness.mem,
        "n1",
        NODE_TO_INSTANCE,
        InboundEnvelope::new("register", json!({ "information": "{}" })),
    );
    assert_eq!(reply.channel, INSTANCE_TO_NODE);
    assert_eq!(reply.action, "registerConfirm");
    assert_eq!(error_of(&reply), "InvalidRequest");
}

#[test]
fn login_reflects_registration_and_later_updates() {
    let harness = Harness::new();
    let (id, token) = harness.register_node("n1", "ipfs://QmA");

    let logged = harness.login_node(&harness.mem, "n1", &token);
    assert_eq!(logged.action, "logged");
    assert_eq!(logged.parameters["id"], json!(id));
    assert_eq!(logged.parameters["components"], json!("ipfs://QmA"));
    assert_eq!(logged.parameters["information"], json!({ "name": "n1" }));
    assert_eq!(logged.parameters["queue"], json!([]));

    let updated = harness.call(
        &harness.mem,
        "n1",
        NODE_TO_INSTANCE,
        InboundEnvelope::new("update", json!({ "components": "ipfs://QmNew", "token": token })),
    );
    assert_eq!(updated.success(), Some(true));
    assert_eq!(
        harness
            .broker
            .presence()
            .find_online_node(id)
            .expect("node should be online")
            .components,
        "ipfs://QmNew"
    );

    let relogged = harness.login_node(&harness.mem, "n1", &token);
    assert_eq!(relogged.parameters["components"], json!("ipfs://QmNew"));
    assert_eq!(relogged.parameters["information"], json!({ "name": "n1" }));
}

#[test]
fn bad_token_is_unauthenticated() {
    let harness = Harness::new();
    let reply = harness.login_node(&harness.mem, "n1", "not-a-token");
    assert_eq!(error_of(&reply), UNAUTHENTICATED_ERROR);

    let (_, client_token) = harness.register_client("c1");
    let reply = harness.login_node(&harness.mem, "n1", &client_token);
    assert_eq!(error_of(&reply), UNAUTHENTICATED_ERROR);
    assert_eq!(harness.broker.presence().node_count(), 0);
}

#[test]
fn logout_is_idempotent_and_isolated_per_address() {
    let harness = Harness::new();
    let (first, first_token) = harness.register_node("n1", "ipfs://QmA");
    let (second, second_token) = harness.register_node("n2", "ipfs://QmB");
    harness.login_node(&harness.mem, "n1", &first_token);
    harness.login_node(&harness.mem, "n2", &second_token);

    let logout = || {
        harness.call(
            &harness.mem,
            "n1",
            NODE_TO_INSTANCE,
            InboundEnvelope::new("logout", json!({})),
        )
    };
    assert_eq!(logout().parameters["removed"], json!(1));
    assert_eq!(logout().parameters["removed"], json!(0));

    let presence = harness.broker.presence();
    assert!(presence.find_online_node(first).is_none());
    assert!(presence.find_online_node(second).is_some());
}

#[test]
fn same_address_on_different_protocols_does_not_collide() {
    let harness = Harness::new();
    let (first, first_token) = harness.register_node("shared", "ipfs://QmA");
    let (second, second_token) = harness.register_node("other", "ipfs://QmB");
    harness.login_node(&harness.mem, "shared", &first_token);
    harness.login_node(&harness.volatile, "shared", &second_token);

    harness.mem.disconnect("shared");

    let presence = harness.broker.presence();
    assert!(presence.find_online_node(first).is_none());
    assert_eq!(
        presence
            .find_online_node(second)
            .expect("volatile session should survive")
            .key
            .protocol,
        "volatile"
    );
}

#[test]
fn forward_reaches_online_node_without_credentials() {
    let harness = Harness::new();
    let (node_id, node_token) = harness.register_node("n1", "ipfs://QmA");
    harness.login_node(&harness.mem, "n1", &node_token);

    let reply = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_NODE,
        InboundEnvelope::new("fetch", json!({ "key": "k", "token": "secret" }))
            .with_token("secret")
            .with_recipient(node_id),
    );
    assert_eq!(reply.channel, INSTANCE_TO_CLIENT);
    assert_eq!(reply.action, "forwarded");
    assert_eq!(reply.parameters, json!({ "success": true, "type": "forward" }));

    let delivered = harness.mem.take_outbox("n1");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].channel, CLIENT_TO_NODE);
    assert_eq!(delivered[0].action, "fetch");
    assert_eq!(delivered[0].sender.as_deref(), Some("c1"));
    assert_eq!(delivered[0].parameters, json!({ "key": "k" }));
}

#[test]
fn offline_forward_is_queued_and_surfaced_once_on_login() {
    let harness = Harness::new();
    let queued_events = harness.broker.events().subscribe(MESSAGE_QUEUED_EVENT);
    let (node_id, node_token) = harness.register_node("n1", "ipfs://QmA");
    let (client_id, client_token) = harness.register_client("c1");

    let anonymous = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_NODE,
        InboundEnvelope::new("fetch", json!({ "key": "k" })).with_recipient(node_id),
    );
    assert_eq!(error_of(&anonymous), UNAUTHENTICATED_ERROR);

    let reply = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_NODE,
        InboundEnvelope::new("fetch", json!({ "key": "k", "token": client_token }))
            .with_recipient(node_id),
    );
    assert_eq!(reply.parameters, json!({ "success": true, "type": "queue" }));
    let event = queued_events
        .recv_timeout(Duration::from_secs(1))
        .expect("queued event should arrive");
    assert_eq!(event.payload.expect("payload should exist")["recipient"], json!(node_id));

    let logged = harness.login_node(&harness.mem, "n1", &node_token);
    let queue = logged.parameters["queue"]
        .as_array()
        .expect("queue should be a list");
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0]["sender"], json!(client_id));
    assert_eq!(queue[0]["action"], json!("fetch"));
    let message: Value = serde_json::from_str(queue[0]["message"].as_str().unwrap_or_default())
        .expect("message should be json");
    assert_eq!(message, json!({ "key": "k" }));

    harness.mem.disconnect("n1");
    let again = harness.login_node(&harness.mem, "n1", &node_token);
    assert_eq!(again.parameters["queue"], json!([]));
}

#[test]
fn stale_online_session_falls_back_to_queue() {
    let harness = Harness::new();
    let (node_id, node_token) = harness.register_node("n1", "ipfs://QmA");
    let (_, client_token) = harness.register_client("c1");
    harness.login_node(&harness.mem, "n1", &node_token);

    harness.mem.sever("n1");
    let reply = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_NODE,
        InboundEnvelope::new("fetch", json!({}))
            .with_token(client_token)
            .with_recipient(node_id),
    );
    assert_eq!(reply.parameters["type"], json!("queue"));
    assert!(harness.broker.presence().find_online_node(node_id).is_none());
    assert_eq!(
        harness
            .broker
            .queue()
            .pending_for(node_id)
            .expect("pending should work")
            .len(),
        1
    );
}

#[test]
fn offline_node_on_non_queue_protocol_is_not_deliverable() {
    let harness = Harness::new();
    let registered = harness.call(
        &harness.volatile,
        "n1",
        NODE_TO_INSTANCE,
        InboundEnvelope::new("register", json!({ "components": "ipfs://QmA" })),
    );
    let (node_id, _) = credentials(&registered);
    let (_, client_token) = harness.register_client("c1");

    let reply = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_NODE,
        InboundEnvelope::new("fetch", json!({}))
            .with_token(client_token)
            .with_recipient(node_id),
    );
    assert_eq!(error_of(&reply), NOT_DELIVERABLE_ERROR);
}

#[test]
fn unknown_recipient_and_unbound_action() {
    let harness = Harness::new();
    let reply = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_NODE,
        InboundEnvelope::new("fetch", json!({})).with_recipient(4242),
    );
    assert_eq!(error_of(&reply), UNKNOWN_RECIPIENT_ERROR);

    let missing = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_NODE,
        InboundEnvelope::new("fetch", json!({})),
    );
    assert_eq!(error_of(&missing), "InvalidRequest");

    let unbound = harness.call(
        &harness.mem,
        "n1",
        NODE_TO_INSTANCE,
        InboundEnvelope::new("teleport", json!({})),
    );
    assert_eq!(unbound.channel, INSTANCE_TO_NODE);
    assert_eq!(unbound.action, "teleport");
    assert_eq!(error_of(&unbound), UNKNOWN_ACTION_ERROR);
}

#[test]
fn delete_node_cascades_to_presence_and_queue() {
    let harness = Harness::new();
    let disconnected = harness.broker.events().subscribe(NODE_DISCONNECTED_EVENT);
    let (node_id, node_token) = harness.register_node("n1", "ipfs://QmA");
    let (_, client_token) = harness.register_client("c1");
    harness
        .broker
        .queue()
        .enqueue(7, node_id, "fetch", &json!({}))
        .expect("enqueue should work");
    harness.login_node(&harness.mem, "n1", &node_token);
    harness
        .broker
        .queue()
        .enqueue(7, node_id, "fetch", &json!({}))
        .expect("enqueue should work");

    let deleted = harness.call(
        &harness.mem,
        "n1",
        NODE_TO_INSTANCE,
        InboundEnvelope::new("delete", json!({})).with_token(node_token.as_str()),
    );
    assert_eq!(deleted.action, "deleted");
    assert_eq!(deleted.success(), Some(true));

    assert!(harness.broker.presence().find_online_node(node_id).is_none());
    assert!(harness
        .broker
        .queue()
        .pending_for(node_id)
        .expect("pending should work")
        .is_empty());
    assert!(disconnected.recv_timeout(Duration::from_secs(1)).is_ok());

    let relogin = harness.login_node(&harness.mem, "n1", &node_token);
    assert_eq!(error_of(&relogin), UNAUTHENTICATED_ERROR);
    let forward = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_NODE,
        InboundEnvelope::new("fetch", json!({}))
            .with_token(client_token)
            .with_recipient(node_id),
    );
    assert_eq!(error_of(&forward), UNKNOWN_RECIPIENT_ERROR);
}

#[test]
fn login_from_departed_peer_leaves_no_session() {
    let harness = Harness::new();
    let (node_id, node_token) = harness.register_node("n1", "ipfs://QmA");
    harness.mem.sever("ghost");

    assert!(harness.mem.inject(
        "ghost",
        NODE_TO_INSTANCE,
        InboundEnvelope::new("login", json!({})).with_token(node_token),
    ));
    assert!(harness.broker.presence().find_online_node(node_id).is_none());
    assert_eq!(harness.broker.presence().node_count(), 0);
}

#[test]
fn transport_disconnect_clears_sessions_and_notifies() {
    let harness = Harness::new();
    let disconnected = harness.broker.events().subscribe(NODE_DISCONNECTED_EVENT);
    let (node_id, node_token) = harness.register_node("n1", "ipfs://QmA");
    harness.login_node(&harness.mem, "n1", &node_token);

    harness.mem.disconnect("n1");

    assert!(harness.broker.presence().find_online_node(node_id).is_none());
    let event = disconnected
        .recv_timeout(Duration::from_secs(1))
        .expect("disconnect event should arrive");
    assert_eq!(event.payload.expect("payload should exist")["id"], json!(node_id));
}

#[test]
fn slow_storage_surfaces_retryable_failure() {
    let storage = StorageFacade::with_backend(
        StorageEngine::Memory,
        None,
        Duration::from_millis(20),
        Arc::new(StalledBackend::new("insert_node", Duration::from_millis(300))),
    );
    let harness = Harness::with_storage(storage);

    let reply = harness.call(
        &harness.mem,
        "n1",
        NODE_TO_INSTANCE,
        InboundEnvelope::new("register", json!({ "components": "ipfs://QmA" })),
    );
    assert_eq!(error_of(&reply), "StorageFailure");
    assert_eq!(reply.parameters["retryable"], json!(true));
}

#[test]
fn detached_broker_answers_unavailable() {
    let mem = Arc::new(MemoryTransport::new("mem", true));
    {
        let broker = Broker::new(
            Arc::new(StorageFacade::in_memory()),
            SideStores::new(),
            Arc::new(EventEmitter::new()),
            Arc::new(Logger::silent()),
        );
        broker.attach_adapter(mem.clone());
    }

    mem.connect("n1");
    assert!(mem.inject("n1", NODE_TO_INSTANCE, InboundEnvelope::new("ping", json!({}))));
    let outbox = mem.take_outbox("n1");
    assert_eq!(outbox.len(), 1);
    assert_eq!(error_of(&outbox[0]), "Unavailable");
    assert_eq!(outbox[0].parameters["retryable"], json!(true));
}

#[test]
fn information_updates_show_up_on_next_login() {
    let harness = Harness::new();
    let (node_id, node_token) = harness.register_node("n1", "ipfs://QmA");
    let updated = harness.call(
        &harness.mem,
        "n1",
        NODE_TO_INSTANCE,
        InboundEnvelope::new("update", json!({ "information": { "name": "renamed", "v": 2 } }))
            .with_token(node_token.as_str()),
    );
    assert_eq!(updated.success(), Some(true));

    let logged = harness.login_node(&harness.mem, "n1", &node_token);
    assert_eq!(logged.parameters["id"], json!(node_id));
    assert_eq!(logged.parameters["components"], json!("ipfs://QmA"));
    assert_eq!(logged.parameters["information"], json!({ "name": "renamed", "v": 2 }));

    let (client_id, client_token) = harness.register_client("c1");
    let updated = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_INSTANCE,
        InboundEnvelope::new("update", json!({ "information": "{\"tier\":\"gold\"}" }))
            .with_token(client_token.as_str()),
    );
    assert_eq!(updated.channel, INSTANCE_TO_CLIENT);
    assert_eq!(updated.action, "updated");
    assert_eq!(updated.success(), Some(true));

    let logged = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_INSTANCE,
        InboundEnvelope::new("login", json!({})).with_token(client_token.as_str()),
    );
    assert_eq!(logged.action, "logged");
    assert_eq!(logged.parameters["id"], json!(client_id));
    assert_eq!(logged.parameters["information"], json!({ "tier": "gold" }));
    assert!(harness.broker.presence().find_online_client(client_id).is_some());

    let rejected = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_INSTANCE,
        InboundEnvelope::new("update", json!({ "information": "{}" })).with_token("bogus"),
    );
    assert_eq!(error_of(&rejected), UNAUTHENTICATED_ERROR);
}

#[test]
fn forward_tries_every_session_before_queueing() {
    let harness = Harness::new();
    let (node_id, node_token) = harness.register_node("n1", "ipfs://QmA");
    harness.login_node(&harness.volatile, "n1-backup", &node_token);
    thread::sleep(Duration::from_millis(5));
    harness.login_node(&harness.mem, "n1", &node_token);
    harness.mem.sever("n1");

    let reply = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_NODE,
        InboundEnvelope::new("fetch", json!({ "key": "k" })).with_recipient(node_id),
    );
    assert_eq!(reply.parameters, json!({ "success": true, "type": "forward" }));

    let delivered = harness.volatile.take_outbox("n1-backup");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].action, "fetch");

    let sessions = harness.broker.presence().online_node_sessions(node_id);
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].key.protocol, "volatile");
    assert!(harness
        .broker
        .queue()
        .pending_for(node_id)
        .expect("pending should work")
        .is_empty());
}

#[test]
fn failed_queue_drain_leaves_node_offline() {
    let storage = StorageFacade::with_backend(
        StorageEngine::Memory,
        None,
        Duration::from_millis(50),
        Arc::new(StalledBackend::new("drain_messages", Duration::from_millis(300))),
    );
    let harness = Harness::with_storage(storage);
    let (node_id, node_token) = harness.register_node("n1", "ipfs://QmA");

    let logged = harness.login_node(&harness.mem, "n1", &node_token);
    assert_eq!(error_of(&logged), "StorageFailure");
    assert_eq!(logged.parameters["retryable"], json!(true));
    assert!(harness.broker.presence().find_online_node(node_id).is_none());

    let (_, client_token) = harness.register_client("c1");
    let forward = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_NODE,
        InboundEnvelope::new("fetch", json!({}))
            .with_token(client_token)
            .with_recipient(node_id),
    );
    assert_eq!(forward.parameters["type"], json!("queue"));
    assert!(harness.mem.take_outbox("n1").is_empty());
}

#[test]
fn delete_during_slow_login_leaves_no_session() {
    let storage = StorageFacade::with_backend(
        StorageEngine::Memory,
        None,
        DEFAULT_OPERATION_TIMEOUT,
        Arc::new(StalledBackend::once("node_by_token", Duration::from_millis(300))),
    );
    let harness = Harness::with_storage(storage);
    let (node_id, node_token) = harness.register_node("n1", "ipfs://QmA");

    harness.mem.connect("n1");
    let login = {
        let mem = Arc::clone(&harness.mem);
        let token = node_token.clone();
        thread::spawn(move || {
            mem.inject(
                "n1",
                NODE_TO_INSTANCE,
                InboundEnvelope::new("login", json!({})).with_token(token),
            )
        })
    };
    thread::sleep(Duration::from_millis(50));

    let deleted = harness.call(
        &harness.mem,
        "n1-admin",
        NODE_TO_INSTANCE,
        InboundEnvelope::new("delete", json!({})).with_token(node_token.as_str()),
    );
    assert_eq!(deleted.success(), Some(true));

    assert!(login.join().expect("login thread should not panic"));
    let login_replies = harness.mem.take_outbox("n1");
    assert_eq!(login_replies.len(), 1);
    assert_eq!(error_of(&login_replies[0]), UNAUTHENTICATED_ERROR);

    assert!(harness
        .broker
        .directory()
        .node_by_id(node_id)
        .expect("lookup should work")
        .is_none());
    assert!(harness.broker.presence().online_node_sessions(node_id).is_empty());

    let forward = harness.call(
        &harness.mem,
        "c1",
        CLIENT_TO_NODE,
        InboundEnvelope::new("fetch", json!({})).with_recipient(node_id),
    );
    assert_eq!(error_of(&forward), UNKNOWN_RECIPIENT_ERROR);
}
