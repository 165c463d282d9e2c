use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::{json, Value};

use crate::logging::{LogLevel, Logger};
use crate::transport::envelope::{InboundEnvelope, OutboundEnvelope};

pub const NODE_TO_INSTANCE: &str = "node.to.instance";
pub const INSTANCE_TO_NODE: &str = "instance.to.node";
pub const CLIENT_TO_INSTANCE: &str = "client.to.instance";
pub const INSTANCE_TO_CLIENT: &str = "instance.to.client";
pub const CLIENT_TO_NODE: &str = "client.to.node";

pub const UNKNOWN_ACTION_ERROR: &str = "UnknownAction";
pub const NO_REPLY_ERROR: &str = "NoReply";
pub const UNAVAILABLE_ERROR: &str = "Unavailable";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    RegisterNode,
    UpdateNode,
    DeleteNode,
    LoginNode,
    RegisterClient,
    UpdateClient,
    DeleteClient,
    LoginClient,
    Logout,
    Ping,
    Forward,
}

impl HandlerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegisterNode => "register_node",
            Self::UpdateNode => "update_node",
            Self::DeleteNode => "delete_node",
            Self::LoginNode => "login_node",
            Self::RegisterClient => "register_client",
            Self::UpdateClient => "update_client",
            Self::DeleteClient => "delete_client",
            Self::LoginClient => "login_client",
            Self::Logout => "logout",
            Self::Ping => "ping",
            Self::Forward => "forward",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseBinding {
    pub channel: &'static str,
    pub action: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub channel: String,
    /// `None` binds every action on the channel.
    pub action: Option<String>,
    pub handler: HandlerKind,
    pub response: ResponseBinding,
}

#[derive(Clone, Debug, Default)]
pub struct Registry {
    bindings: Vec<Binding>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The broker's channel table, shared by every transport adapter.
    pub fn standard() -> Self {
        let node_reply = |action| ResponseBinding {
            channel: INSTANCE_TO_NODE,
            action,
        };
        let client_reply = |action| ResponseBinding {
            channel: INSTANCE_TO_CLIENT,
            action,
        };

        let mut registry = Self::new();
        registry.bind(NODE_TO_INSTANCE, "register", HandlerKind::RegisterNode, node_reply("registerConfirm"));
        registry.bind(NODE_TO_INSTANCE, "update", HandlerKind::UpdateNode, node_reply("updated"));
        registry.bind(NODE_TO_INSTANCE, "delete", HandlerKind::DeleteNode, node_reply("deleted"));
        registry.bind(NODE_TO_INSTANCE, "login", HandlerKind::LoginNode, node_reply("logged"));
        registry.bind(NODE_TO_INSTANCE, "logout", HandlerKind::Logout, node_reply("loggedOut"));
        registry.bind(NODE_TO_INSTANCE, "ping", HandlerKind::Ping, node_reply("pinged"));
        registry.bind(CLIENT_TO_INSTANCE, "register", HandlerKind::RegisterClient, client_reply("registerConfirm"));
        registry.bind(CLIENT_TO_INSTANCE, "update", HandlerKind::UpdateClient, client_reply("updated"));
        registry.bind(CLIENT_TO_INSTANCE, "delete", HandlerKind::DeleteClient, client_reply("deleted"));
        registry.bind(CLIENT_TO_INSTANCE, "login", HandlerKind::LoginClient, client_reply("logged"));
        registry.bind(CLIENT_TO_INSTANCE, "logout", HandlerKind::Logout, client_reply("loggedOut"));
        registry.bind_channel(CLIENT_TO_NODE, HandlerKind::Forward, client_reply("forwarded"));
        registry
    }

    pub fn bind(
        &mut self,
        channel: impl Into<String>,
        action: impl Into<String>,
        handler: HandlerKind,
        response: ResponseBinding,
    ) {
        self.insert(Binding {
            channel: channel.into(),
            action: Some(action.into()),
            handler,
            response,
        });
    }

    pub fn bind_channel(&mut self, channel: impl Into<String>, handler: HandlerKind, response: ResponseBinding) {
        self.insert(Binding {
            channel: channel.into(),
            action: None,
            handler,
            response,
        });
    }

    fn insert(&mut self, binding: Binding) {
        self.bindings
            .retain(|existing| existing.channel != binding.channel || existing.action != binding.action);
        self.bindings.push(binding);
    }

    /// Exact (channel, action) first, then the channel wildcard.
    pub fn resolve(&self, channel: &str, action: &str) -> Option<&Binding> {
        self.bindings
            .iter()
            .find(|binding| binding.channel == channel && binding.action.as_deref() == Some(action))
            .or_else(|| {
                self.bindings
                    .iter()
                    .find(|binding| binding.channel == channel && binding.action.is_none())
            })
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }
}

/// `x.to.y` answers on `instance.to.x`; anything else has no reply path.
pub fn reply_channel_for(channel: &str) -> Option<String> {
    let (sender_side, _) = channel.split_once(".to.")?;
    (!sender_side.is_empty() && sender_side != "instance").then(|| format!("instance.to.{sender_side}"))
}

pub type ReplySink = Box<dyn FnOnce(OutboundEnvelope) + Send>;

/// Answers one request. Sending consumes the reply; dropping it unsent
/// answers `{success:false, error:"NoReply"}`.
pub struct Reply {
    channel: String,
    action: String,
    sink: Option<ReplySink>,
}

impl Reply {
    pub fn new(channel: impl Into<String>, action: impl Into<String>, sink: ReplySink) -> Self {
        Self {
            channel: channel.into(),
            action: action.into(),
            sink: Some(sink),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn send(mut self, parameters: Value) {
        self.deliver(parameters);
    }

    fn deliver(&mut self, parameters: Value) {
        if let Some(sink) = self.sink.take() {
            sink(OutboundEnvelope::new(
                self.channel.clone(),
                self.action.clone(),
                parameters,
            ));
        }
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        self.deliver(json!({"success": false, "error": NO_REPLY_ERROR}));
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("channel", &self.channel)
            .field("action", &self.action)
            .field("pending", &self.sink.is_some())
            .finish()
    }
}

/// One decoded inbound message and where it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub protocol: String,
    pub address: String,
    pub channel: String,
    pub envelope: InboundEnvelope,
}

pub trait RequestHandler: Send + Sync {
    fn handle(&self, kind: HandlerKind, request: Request, reply: Reply);
}

/// Shared entry point adapters feed decoded messages into.
pub struct Dispatcher {
    registry: Registry,
    handler: Weak<dyn RequestHandler>,
    logger: Arc<Logger>,
}

impl Dispatcher {
    pub fn new(registry: Registry, handler: Weak<dyn RequestHandler>, logger: Arc<Logger>) -> Self {
        Self {
            registry,
            handler,
            logger,
        }
    }

    pub fn dispatch(&self, request: Request, sink: ReplySink) {
        let Some(binding) = self.registry.resolve(&request.channel, &request.envelope.action) else {
            self.reject_unbound(request, sink);
            return;
        };

        let reply = Reply::new(binding.response.channel, binding.response.action, sink);
        let Some(handler) = self.handler.upgrade() else {
            reply.send(json!({"success": false, "error": UNAVAILABLE_ERROR, "retryable": true}));
            return;
        };

        self.logger.log(
            LogLevel::Verbose,
            Some("dispatch"),
            "Dispatching request",
            Some(json!({
                "protocol": request.protocol,
                "address": request.address,
                "channel": request.channel,
                "action": request.envelope.action,
                "handler": binding.handler.as_str(),
            })),
        );
        handler.handle(binding.handler, request, reply);
    }

    fn reject_unbound(&self, request: Request, sink: ReplySink) {
        let payload = json!({
            "protocol": request.protocol,
            "address": request.address,
            "channel": request.channel,
            "action": request.envelope.action,
        });

        match reply_channel_for(&request.channel) {
            Some(channel) => {
                self.logger
                    .log(LogLevel::Debug, Some("dispatch"), "Unbound action", Some(payload));
                Reply::new(channel, request.envelope.action, sink)
                    .send(json!({"success": false, "error": UNKNOWN_ACTION_ERROR}));
            }
            None => self.logger.log(
                LogLevel::Warn,
                Some("dispatch"),
                "Dropping message on unknown channel",
                Some(payload),
            ),
        }
    }
}
