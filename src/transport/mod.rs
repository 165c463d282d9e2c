pub mod codec;
pub mod envelope;
mod memory;
mod tcp;

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::dispatch::Dispatcher;

use self::codec::CodecError;
use self::envelope::OutboundEnvelope;

pub use self::memory::MemoryTransport;
pub use self::tcp::{TcpTransport, TcpTransportConfig};

/// Called with (protocol id, transport address) when a peer goes away.
pub type DisconnectHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// A protocol the broker speaks. Every adapter feeds the same dispatcher.
pub trait TransportAdapter: Send + Sync {
    /// Registry key and the scheme of resources created through this adapter.
    fn protocol_id(&self) -> &str;

    /// Whether offline peers of this protocol get store-and-forward.
    fn needs_queue(&self) -> bool;

    fn load_listeners(&self, dispatcher: Arc<Dispatcher>);

    fn on_disconnect(&self, hook: DisconnectHook);

    /// `None` broadcasts to every connected peer.
    fn send(&self, address: Option<&str>, envelope: &OutboundEnvelope) -> Result<(), TransportError>;

    fn is_connected(&self, _address: &str) -> bool {
        true
    }

    /// Closes every peer and stops taking new ones.
    fn shutdown(&self) {}
}

#[derive(Debug)]
pub enum TransportError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    StreamClone {
        source: io::Error,
    },
    UnknownPeer {
        address: String,
    },
    Write {
        address: String,
        source: io::Error,
    },
    Encode(CodecError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP transport on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP listener to non-blocking mode: {source}")
            }
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone accepted TCP stream for full duplex IO: {source}")
            }
            Self::UnknownPeer { address } => write!(f, "no connected peer at '{address}'"),
            Self::Write { address, source } => {
                write!(f, "failed to write frame to '{address}': {source}")
            }
            Self::Encode(source) => write!(f, "failed to encode outbound frame: {source}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<CodecError> for TransportError {
    fn from(value: CodecError) -> Self {
        Self::Encode(value)
    }
}
