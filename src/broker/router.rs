use serde_json::{json, Value};

use crate::directory::records::{split_scheme, IdentityKind};
use crate::dispatch::{Reply, Request, CLIENT_TO_NODE};
use crate::events::{MESSAGE_FORWARDED_EVENT, MESSAGE_QUEUED_EVENT};
use crate::logging::LogLevel;
use crate::presence::NodeSession;
use crate::queue::strip_credentials;
use crate::transport::envelope::OutboundEnvelope;

use super::{
    failure, token_of, Broker, INVALID_REQUEST_ERROR, NOT_DELIVERABLE_ERROR,
    UNAUTHENTICATED_ERROR, UNKNOWN_RECIPIENT_ERROR,
};

/// Accepts `5` or `"5"`.
fn recipient_id(raw: Option<&Value>) -> Option<u64> {
    match raw? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

impl Broker {
    /// Online recipients get the message now; offline ones get it queued when
    /// their protocol supports it; anything else is an explicit failure.
    pub(super) fn forward(&self, request: &Request, reply: Reply) {
        let Some(recipient) = recipient_id(request.envelope.recipient.as_ref()) else {
            reply.send(failure(INVALID_REQUEST_ERROR));
            return;
        };
        let action = request.envelope.action.as_str();
        let mut parameters = request.envelope.parameters.clone();
        strip_credentials(&mut parameters);

        for session in self.presence.online_node_sessions(recipient) {
            if self.deliver_online(request, &session, action, &parameters) {
                reply.send(json!({ "success": true, "type": "forward" }));
                return;
            }
        }

        let node = match self.directory.node_by_id(recipient) {
            Ok(Some(node)) => node,
            Ok(None) => return reply.send(failure(UNKNOWN_RECIPIENT_ERROR)),
            Err(error) => return self.reply_storage_failure(reply, "node_by_id", &error),
        };

        let queue_capable = split_scheme(&node.resource)
            .and_then(|(protocol, _)| self.adapter(protocol))
            .is_some_and(|adapter| adapter.needs_queue());
        if !queue_capable {
            return reply.send(failure(NOT_DELIVERABLE_ERROR));
        }

        let sender = match self.sessions.validate_client(token_of(request).unwrap_or_default()) {
            Ok(Some(client)) => client,
            Ok(None) => return reply.send(failure(UNAUTHENTICATED_ERROR)),
            Err(error) => return self.reply_storage_failure(reply, "validate_client", &error),
        };

        let queued = match self.queue.enqueue(sender.id, recipient, action, &parameters) {
            Ok(queued) => queued,
            Err(error) => return self.reply_storage_failure(reply, "enqueue_message", &error),
        };

        self.logger.log(
            LogLevel::Debug,
            Some("broker::router"),
            "Message queued for offline node",
            Some(json!({ "sender": sender.id, "recipient": recipient, "action": action })),
        );
        self.notify(
            MESSAGE_QUEUED_EVENT,
            json!({
                "message_id": queued.message_id.to_string(),
                "sender": sender.id,
                "recipient": recipient,
                "action": action,
            }),
        );
        reply.send(json!({ "success": true, "type": "queue" }));
    }

    /// Sends through the session's adapter. A failed send drops the stale
    /// session and reports false so routing moves on to the next session.
    fn deliver_online(
        &self,
        request: &Request,
        session: &NodeSession,
        action: &str,
        parameters: &Value,
    ) -> bool {
        let envelope = OutboundEnvelope::new(CLIENT_TO_NODE, action, parameters.clone())
            .with_sender(request.address.as_str());

        let outcome = match self.adapter(&session.key.protocol) {
            Some(adapter) => adapter
                .send(Some(&session.key.address), &envelope)
                .map_err(|error| error.to_string()),
            None => Err(format!("no adapter attached for '{}'", session.key.protocol)),
        };

        match outcome {
            Ok(()) => {
                self.notify(
                    MESSAGE_FORWARDED_EVENT,
                    json!({
                        "recipient": session.id,
                        "protocol": session.key.protocol,
                        "address": session.key.address,
                        "sender": request.address,
                        "action": action,
                    }),
                );
                true
            }
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some("broker::router"),
                    "Online delivery failed; dropping stale session",
                    Some(json!({
                        "recipient": session.id,
                        "protocol": session.key.protocol,
                        "address": session.key.address,
                        "error": error,
                    })),
                );
                if let Some(departure) = self.presence.withdraw(
                    IdentityKind::Node,
                    session.id,
                    &session.key.protocol,
                    &session.key.address,
                ) {
                    self.announce_departure(&departure);
                }
                false
            }
        }
    }
}
