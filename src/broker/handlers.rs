use std::sync::Arc;

use serde_json::{json, Value};

use crate::directory::records::{resource_for, ClientUpdate, IdentityKind, NodeUpdate};
use crate::dispatch::{Reply, Request};
use crate::events::{CLIENT_REGISTERED_EVENT, NODE_REGISTERED_EVENT, PING_EVENT};
use crate::logging::LogLevel;
use crate::queue::QueuedView;

use super::{
    failure, token_of, Broker, DISCONNECTED_ERROR, INVALID_REQUEST_ERROR, UNAUTHENTICATED_ERROR,
};

/// `information` is stored as a JSON string. Absent or null means "not given".
fn information_of(parameters: &Value) -> Option<String> {
    match parameters.get("information") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(raw.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn information_value(stored: &str) -> Value {
    serde_json::from_str(stored).unwrap_or_else(|_| Value::String(stored.to_owned()))
}

fn components_of(parameters: &Value) -> Option<&str> {
    parameters
        .get("components")
        .and_then(Value::as_str)
        .filter(|components| !components.is_empty())
}

impl Broker {
    pub(super) fn ping(&self, request: &Request, reply: Reply) {
        self.notify(
            PING_EVENT,
            json!({
                "protocol": request.protocol,
                "address": request.address,
                "parameters": request.envelope.parameters,
            }),
        );
        reply.send(json!({ "success": true }));
    }

    pub(super) fn register_node(&self, request: &Request, reply: Reply) {
        let parameters = &request.envelope.parameters;
        let Some(components) = components_of(parameters) else {
            reply.send(failure(INVALID_REQUEST_ERROR));
            return;
        };
        let information = information_of(parameters).unwrap_or_else(|| "{}".to_owned());
        let resource = resource_for(&request.protocol, &request.address);

        let node = match self.directory.create_node(components, &information, &resource) {
            Ok(node) => node,
            Err(error) => return self.reply_storage_failure(reply, "create_node", &error),
        };

        self.logger.log(
            LogLevel::Info,
            Some("broker::directory"),
            "Node registered",
            Some(json!({ "id": node.id, "resource": node.resource, "components": node.components })),
        );
        self.side_stores
            .spawn_save(&node.components, Arc::clone(&self.logger));
        self.notify(
            NODE_REGISTERED_EVENT,
            json!({ "id": node.id, "resource": node.resource }),
        );
        reply.send(json!({ "success": true, "token": node.token, "id": node.id }));
    }

    pub(super) fn register_client(&self, request: &Request, reply: Reply) {
        let information =
            information_of(&request.envelope.parameters).unwrap_or_else(|| "{}".to_owned());
        let resource = resource_for(&request.protocol, &request.address);

        let client = match self.directory.create_client(&information, &resource) {
            Ok(client) => client,
            Err(error) => return self.reply_storage_failure(reply, "create_client", &error),
        };

        self.logger.log(
            LogLevel::Info,
            Some("broker::directory"),
            "Client registered",
            Some(json!({ "id": client.id, "resource": client.resource })),
        );
        self.notify(
            CLIENT_REGISTERED_EVENT,
            json!({ "id": client.id, "resource": client.resource }),
        );
        reply.send(json!({ "success": true, "token": client.token, "id": client.id }));
    }

    pub(super) fn update_node(&self, request: &Request, reply: Reply) {
        let node = match self.sessions.validate_node(token_of(request).unwrap_or_default()) {
            Ok(Some(node)) => node,
            Ok(None) => return reply.send(failure(UNAUTHENTICATED_ERROR)),
            Err(error) => return self.reply_storage_failure(reply, "validate_node", &error),
        };

        let parameters = &request.envelope.parameters;
        let update = NodeUpdate {
            components: components_of(parameters).map(str::to_owned),
            information: information_of(parameters),
        };
        let components_changed = update
            .components
            .as_deref()
            .is_some_and(|components| components != node.components);

        let lock = self.identity_locks.acquire(IdentityKind::Node, node.id);
        let _guard = lock.lock().expect("identity lock poisoned");
        let updated = match self.directory.update_node(node.id, update) {
            Ok(Some(updated)) => updated,
            Ok(None) => return reply.send(failure(UNAUTHENTICATED_ERROR)),
            Err(error) => return self.reply_storage_failure(reply, "update_node", &error),
        };

        self.presence
            .refresh_node_components(updated.id, &updated.components);
        if components_changed {
            self.side_stores
                .spawn_save(&updated.components, Arc::clone(&self.logger));
        }
        reply.send(json!({ "success": true }));
    }

    pub(super) fn update_client(&self, request: &Request, reply: Reply) {
        let client = match self.sessions.validate_client(token_of(request).unwrap_or_default()) {
            Ok(Some(client)) => client,
            Ok(None) => return reply.send(failure(UNAUTHENTICATED_ERROR)),
            Err(error) => return self.reply_storage_failure(reply, "validate_client", &error),
        };

        let update = ClientUpdate {
            information: information_of(&request.envelope.parameters),
        };
        let lock = self.identity_locks.acquire(IdentityKind::Client, client.id);
        let _guard = lock.lock().expect("identity lock poisoned");
        match self.directory.update_client(client.id, update) {
            Ok(Some(_)) => reply.send(json!({ "success": true })),
            Ok(None) => reply.send(failure(UNAUTHENTICATED_ERROR)),
            Err(error) => self.reply_storage_failure(reply, "update_client", &error),
        }
    }

    /// Removes the record, then every live session of it. Node queues go with it.
    pub(super) fn delete_identity(&self, kind: IdentityKind, request: &Request, reply: Reply) {
        let token = token_of(request).unwrap_or_default();
        let id = match self.sessions.validate(kind, token) {
            Ok(Some(identity)) => identity.id(),
            Ok(None) => return reply.send(failure(UNAUTHENTICATED_ERROR)),
            Err(error) => return self.reply_storage_failure(reply, "validate", &error),
        };

        let lock = self.identity_locks.acquire(kind, id);
        let guard = lock.lock().expect("identity lock poisoned");
        if let Err(error) = self.directory.delete(kind, id) {
            return self.reply_storage_failure(reply, "delete", &error);
        }

        let departed = self.presence.remove_identity(kind, id);
        drop(guard);
        self.identity_locks.forget(kind, id);
        for departure in departed {
            self.announce_departure(&departure);
        }

        if kind == IdentityKind::Node {
            match self.queue.purge_for(id) {
                Ok(0) => {}
                Ok(purged) => self.logger.log(
                    LogLevel::Debug,
                    Some("broker::queue"),
                    "Purged messages of deleted node",
                    Some(json!({ "id": id, "purged": purged })),
                ),
                Err(error) => self.logger.log(
                    LogLevel::Warn,
                    Some("broker::queue"),
                    "Failed to purge messages of deleted node",
                    Some(json!({ "id": id, "error": error.to_string() })),
                ),
            }
        }

        self.logger.log(
            LogLevel::Info,
            Some("broker::directory"),
            "Identity deleted",
            Some(json!({ "id": id, "kind": kind.as_str() })),
        );
        reply.send(json!({ "success": true }));
    }

    pub(super) fn login_node(&self, request: &Request, reply: Reply) {
        let validated = match self.sessions.validate_node(token_of(request).unwrap_or_default()) {
            Ok(Some(node)) => node,
            Ok(None) => return reply.send(failure(UNAUTHENTICATED_ERROR)),
            Err(error) => return self.reply_storage_failure(reply, "validate_node", &error),
        };

        // Re-read under the identity lock: a delete or update may have landed
        // since the token lookup.
        let lock = self.identity_locks.acquire(IdentityKind::Node, validated.id);
        let _guard = lock.lock().expect("identity lock poisoned");
        let node = match self.directory.node_by_id(validated.id) {
            Ok(Some(node)) => node,
            Ok(None) => return reply.send(failure(UNAUTHENTICATED_ERROR)),
            Err(error) => return self.reply_storage_failure(reply, "node_by_id", &error),
        };

        self.presence
            .login_node(node.id, &request.protocol, &request.address, &node.components);
        if !self.still_connected(request) {
            self.presence
                .withdraw(IdentityKind::Node, node.id, &request.protocol, &request.address);
            return reply.send(failure(DISCONNECTED_ERROR));
        }

        let queued = match self.queue.drain_for(node.id) {
            Ok(queued) => queued,
            Err(error) => {
                self.presence
                    .withdraw(IdentityKind::Node, node.id, &request.protocol, &request.address);
                return self.reply_storage_failure(reply, "drain_messages", &error);
            }
        };
        let queue: Vec<QueuedView> = queued.into_iter().map(QueuedView::from).collect();

        self.logger.log(
            LogLevel::Info,
            Some("broker::presence"),
            "Node logged in",
            Some(json!({
                "id": node.id,
                "protocol": request.protocol,
                "address": request.address,
                "delivered_from_queue": queue.len(),
            })),
        );
        reply.send(json!({
            "success": true,
            "id": node.id,
            "components": node.components,
            "information": information_value(&node.information),
            "queue": queue,
        }));
    }

    pub(super) fn login_client(&self, request: &Request, reply: Reply) {
        let validated = match self.sessions.validate_client(token_of(request).unwrap_or_default()) {
            Ok(Some(client)) => client,
            Ok(None) => return reply.send(failure(UNAUTHENTICATED_ERROR)),
            Err(error) => return self.reply_storage_failure(reply, "validate_client", &error),
        };

        let lock = self.identity_locks.acquire(IdentityKind::Client, validated.id);
        let _guard = lock.lock().expect("identity lock poisoned");
        let client = match self.directory.client_by_id(validated.id) {
            Ok(Some(client)) => client,
            Ok(None) => return reply.send(failure(UNAUTHENTICATED_ERROR)),
            Err(error) => return self.reply_storage_failure(reply, "client_by_id", &error),
        };

        self.presence
            .login_client(client.id, &request.protocol, &request.address);
        if !self.still_connected(request) {
            self.presence
                .withdraw(IdentityKind::Client, client.id, &request.protocol, &request.address);
            return reply.send(failure(DISCONNECTED_ERROR));
        }

        self.logger.log(
            LogLevel::Info,
            Some("broker::presence"),
            "Client logged in",
            Some(json!({ "id": client.id, "protocol": request.protocol, "address": request.address })),
        );
        reply.send(json!({
            "success": true,
            "id": client.id,
            "information": information_value(&client.information),
        }));
    }

    /// Re-checks liveness after a login upsert so a disconnect that raced the
    /// login does not leave a ghost session.
    fn still_connected(&self, request: &Request) -> bool {
        self.adapter(&request.protocol)
            .map_or(true, |adapter| adapter.is_connected(&request.address))
    }
}
