use std::fmt;

use serde_json::{json, Map, Value};

pub const CHANNEL_FIELD: &str = "channel";
pub const ENVELOPE_FIELD: &str = "envelope";

#[derive(Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    MissingField { field: &'static str },
    InvalidFieldType { field: &'static str, expected: &'static str },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { field } => write!(f, "missing envelope field '{field}'"),
            Self::InvalidFieldType { field, expected } => {
                write!(f, "invalid field type for '{field}', expected {expected}")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// `{ action, parameters, authentication?: { token }, recipient?: { recipient } }`
#[derive(Clone, Debug, PartialEq)]
pub struct InboundEnvelope {
    pub action: String,
    pub parameters: Value,
    pub token: Option<String>,
    /// Raw recipient reference; parsed by the router so a bad id gets a reply.
    pub recipient: Option<Value>,
}

impl InboundEnvelope {
    pub fn new(action: impl Into<String>, parameters: Value) -> Self {
        Self {
            action: action.into(),
            parameters,
            token: None,
            recipient: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_recipient(mut self, recipient: u64) -> Self {
        self.recipient = Some(Value::from(recipient));
        self
    }

    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        let Some(map) = value.as_object() else {
            return Err(EnvelopeError::InvalidFieldType {
                field: ENVELOPE_FIELD,
                expected: "map",
            });
        };

        let action = match map.get("action") {
            Some(Value::String(action)) => action.clone(),
            Some(_) => {
                return Err(EnvelopeError::InvalidFieldType {
                    field: "action",
                    expected: "string",
                })
            }
            None => return Err(EnvelopeError::MissingField { field: "action" }),
        };

        let parameters = match map.get("parameters") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(parameters) => parameters.clone(),
        };

        let token = match nested(map, "authentication", "token")? {
            None => None,
            Some(Value::String(token)) => Some(token.clone()),
            Some(_) => {
                return Err(EnvelopeError::InvalidFieldType {
                    field: "authentication.token",
                    expected: "string",
                })
            }
        };

        let recipient = nested(map, "recipient", "recipient")?.cloned();

        Ok(Self {
            action,
            parameters,
            token,
            recipient,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("action".to_owned(), Value::String(self.action.clone()));
        map.insert("parameters".to_owned(), self.parameters.clone());
        if let Some(token) = &self.token {
            map.insert("authentication".to_owned(), json!({ "token": token }));
        }
        if let Some(recipient) = &self.recipient {
            map.insert("recipient".to_owned(), json!({ "recipient": recipient }));
        }
        Value::Object(map)
    }

    /// Reads a string parameter, treating absent and non-string values alike.
    pub fn parameter_str(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(Value::as_str)
    }
}

fn nested<'a>(
    map: &'a Map<String, Value>,
    outer: &'static str,
    inner: &str,
) -> Result<Option<&'a Value>, EnvelopeError> {
    match map.get(outer) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(section)) => Ok(section.get(inner).filter(|value| !value.is_null())),
        Some(_) => Err(EnvelopeError::InvalidFieldType {
            field: outer,
            expected: "map",
        }),
    }
}

/// A decoded inbound frame: `{ channel, envelope }`.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundFrame {
    pub channel: String,
    pub envelope: InboundEnvelope,
}

impl InboundFrame {
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeError> {
        let channel = match value.get(CHANNEL_FIELD) {
            Some(Value::String(channel)) => channel.clone(),
            Some(_) => {
                return Err(EnvelopeError::InvalidFieldType {
                    field: CHANNEL_FIELD,
                    expected: "string",
                })
            }
            None => return Err(EnvelopeError::MissingField { field: CHANNEL_FIELD }),
        };
        let Some(envelope) = value.get(ENVELOPE_FIELD) else {
            return Err(EnvelopeError::MissingField {
                field: ENVELOPE_FIELD,
            });
        };

        Ok(Self {
            channel,
            envelope: InboundEnvelope::from_value(envelope)?,
        })
    }

    pub fn to_value(&self) -> Value {
        json!({
            (CHANNEL_FIELD): self.channel,
            (ENVELOPE_FIELD): self.envelope.to_value(),
        })
    }
}

/// `{ channel, action, parameters, sender? }`
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundEnvelope {
    pub channel: String,
    pub action: String,
    pub parameters: Value,
    /// Transport address of the original sender on forwarded traffic.
    pub sender: Option<String>,
}

impl OutboundEnvelope {
    pub fn new(channel: impl Into<String>, action: impl Into<String>, parameters: Value) -> Self {
        Self {
            channel: channel.into(),
            action: action.into(),
            parameters,
            sender: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(CHANNEL_FIELD.to_owned(), Value::String(self.channel.clone()));
        map.insert("action".to_owned(), Value::String(self.action.clone()));
        map.insert("parameters".to_owned(), self.parameters.clone());
        if let Some(sender) = &self.sender {
            map.insert("sender".to_owned(), Value::String(sender.clone()));
        }
        Value::Object(map)
    }

    pub fn success(&self) -> Option<bool> {
        self.parameters.get("success").and_then(Value::as_bool)
    }
}
