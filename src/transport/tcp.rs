use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::dispatch::{reply_channel_for, Dispatcher, Reply, Request};
use crate::logging::{LogLevel, Logger};

use super::codec::{self, CodecError, FRAME_HEADER_SIZE_BYTES};
use super::envelope::{InboundFrame, OutboundEnvelope, CHANNEL_FIELD};
use super::{DisconnectHook, TransportAdapter, TransportError};

pub const INVALID_REQUEST_ERROR: &str = "InvalidRequest";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpTransportConfig {
    pub host: String,
    pub port: u16,
    pub protocol_id: String,
    pub needs_queue: bool,
    pub max_envelope_size_bytes: usize,
}

impl TcpTransportConfig {
    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self {
            host: app_config.server.host.clone(),
            port: app_config.server.port,
            protocol_id: app_config.server.protocol_id.clone(),
            needs_queue: app_config.server.needs_queue,
            max_envelope_size_bytes: app_config.wire.max_envelope_size_bytes,
        }
    }
}

/// Write half of one accepted socket. The read half lives on the peer's
/// reader thread.
struct PeerConnection {
    peer_addr: SocketAddr,
    writer: Mutex<TcpStream>,
}

impl PeerConnection {
    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().expect("connection writer lock poisoned");
        writer.write_all(frame)?;
        writer.flush()
    }

    fn shutdown(&self) -> io::Result<()> {
        self.writer
            .lock()
            .expect("connection writer lock poisoned")
            .shutdown(Shutdown::Both)
    }
}

/// Persistent TCP adapter speaking length-prefixed MessagePack frames.
/// Accepting is polled by the owner; each peer gets a blocking reader thread
/// that dispatches inline.
pub struct TcpTransport {
    config: TcpTransportConfig,
    listener: TcpListener,
    connections: Mutex<HashMap<String, Arc<PeerConnection>>>,
    dispatcher: RwLock<Option<Arc<Dispatcher>>>,
    disconnect_hooks: RwLock<Vec<DisconnectHook>>,
    accepting: AtomicBool,
    logger: Arc<Logger>,
}

impl TcpTransport {
    pub fn bind(config: TcpTransportConfig, logger: Arc<Logger>) -> Result<Self, TransportError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| TransportError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::SetNonBlocking { source })?;

        Ok(Self {
            config,
            listener,
            connections: Mutex::new(HashMap::new()),
            dispatcher: RwLock::new(None),
            disconnect_hooks: RwLock::new(Vec::new()),
            accepting: AtomicBool::new(true),
            logger,
        })
    }

    pub fn from_app_config(app_config: &AppConfig, logger: Arc<Logger>) -> Result<Self, TransportError> {
        Self::bind(TcpTransportConfig::from_app_config(app_config), logger)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts at most one pending peer. Returns the peer address when one was taken.
    pub fn poll_accept(self: &Arc<Self>) -> Result<Option<SocketAddr>, TransportError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let (stream, peer_addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(source) => return Err(TransportError::ConfigureAcceptedStream { source }),
        };

        stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|source| TransportError::ConfigureAcceptedStream { source })?;
        let writer = stream
            .try_clone()
            .map_err(|source| TransportError::StreamClone { source })?;

        let connection = Arc::new(PeerConnection {
            peer_addr,
            writer: Mutex::new(writer),
        });
        self.connections
            .lock()
            .expect("tcp connections lock poisoned")
            .insert(peer_addr.to_string(), Arc::clone(&connection));

        self.logger.log(
            LogLevel::Debug,
            Some("transport::tcp"),
            "Accepted peer",
            Some(json!({ "peer": peer_addr.to_string(), "protocol": self.config.protocol_id })),
        );

        let transport = Arc::clone(self);
        thread::Builder::new()
            .name(format!("tcp-peer-{peer_addr}"))
            .spawn(move || transport.serve_peer(stream, connection))
            .map_err(|source| TransportError::ConfigureAcceptedStream { source })?;

        Ok(Some(peer_addr))
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("tcp connections lock poisoned")
            .len()
    }

    fn serve_peer(self: Arc<Self>, mut stream: TcpStream, connection: Arc<PeerConnection>) {
        let address = connection.peer_addr.to_string();

        loop {
            match read_frame(&mut stream, self.config.max_envelope_size_bytes) {
                Ok(Some(value)) => self.handle_frame(&address, &connection, value),
                Ok(None) => break,
                Err(FrameReadError::Io(error)) => {
                    self.logger.log(
                        LogLevel::Debug,
                        Some("transport::tcp"),
                        "Peer read ended",
                        Some(json!({ "peer": address, "error": error.to_string() })),
                    );
                    break;
                }
                Err(FrameReadError::Codec(error)) => {
                    self.logger.log(
                        LogLevel::Warn,
                        Some("transport::tcp"),
                        "Closing peer after undecodable frame",
                        Some(json!({ "peer": address, "error": error.to_string() })),
                    );
                    break;
                }
            }
        }

        let _ = connection.shutdown();
        self.release_peer(&address);
    }

    fn handle_frame(&self, address: &str, connection: &Arc<PeerConnection>, value: Value) {
        let sink_connection = Arc::clone(connection);
        let limit = self.config.max_envelope_size_bytes;
        let logger = Arc::clone(&self.logger);
        let sink = Box::new(move |reply: OutboundEnvelope| {
            if let Err(error) = write_envelope(&sink_connection, &reply, limit) {
                logger.log(
                    LogLevel::Warn,
                    Some("transport::tcp"),
                    "Failed to write reply",
                    Some(json!({ "peer": sink_connection.peer_addr.to_string(), "error": error.to_string() })),
                );
            }
        });

        let frame = match InboundFrame::from_value(&value) {
            Ok(frame) => frame,
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some("transport::tcp"),
                    "Rejected malformed envelope",
                    Some(json!({ "peer": address, "error": error.to_string() })),
                );
                let reply_channel = value
                    .get(CHANNEL_FIELD)
                    .and_then(Value::as_str)
                    .and_then(reply_channel_for);
                let action = value
                    .pointer("/envelope/action")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                if let Some(channel) = reply_channel {
                    Reply::new(channel, action, sink).send(json!({
                        "success": false,
                        "error": INVALID_REQUEST_ERROR,
                    }));
                }
                return;
            }
        };

        let dispatcher = self
            .dispatcher
            .read()
            .expect("tcp dispatcher lock poisoned")
            .clone();
        let Some(dispatcher) = dispatcher else {
            self.logger.warn(
                Some("transport::tcp"),
                "Frame received before listeners were loaded; dropping",
            );
            return;
        };

        dispatcher.dispatch(
            Request {
                protocol: self.config.protocol_id.clone(),
                address: address.to_owned(),
                channel: frame.channel,
                envelope: frame.envelope,
            },
            sink,
        );
    }

    fn release_peer(&self, address: &str) {
        let removed = self
            .connections
            .lock()
            .expect("tcp connections lock poisoned")
            .remove(address);
        if removed.is_none() {
            return;
        }

        self.logger.log(
            LogLevel::Debug,
            Some("transport::tcp"),
            "Peer disconnected",
            Some(json!({ "peer": address })),
        );
        let hooks = self
            .disconnect_hooks
            .read()
            .expect("disconnect hook lock poisoned")
            .clone();
        for hook in hooks {
            hook(&self.config.protocol_id, address);
        }
    }
}

enum FrameReadError {
    Io(io::Error),
    Codec(CodecError),
}

/// `Ok(None)` on a clean end of stream between frames.
fn read_frame(stream: &mut TcpStream, limit: usize) -> Result<Option<Value>, FrameReadError> {
    let mut header = [0_u8; FRAME_HEADER_SIZE_BYTES];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(FrameReadError::Io(error)),
    }

    let length = codec::decode_header(header, limit).map_err(FrameReadError::Codec)?;
    let mut payload = vec![0_u8; length];
    stream.read_exact(&mut payload).map_err(FrameReadError::Io)?;

    codec::decode_payload(&payload, limit)
        .map(Some)
        .map_err(FrameReadError::Codec)
}

fn write_envelope(
    connection: &PeerConnection,
    envelope: &OutboundEnvelope,
    limit: usize,
) -> Result<(), TransportError> {
    let frame = codec::encode_frame(&envelope.to_value(), limit)?;
    connection
        .write_frame(&frame)
        .map_err(|source| TransportError::Write {
            address: connection.peer_addr.to_string(),
            source,
        })
}

impl TransportAdapter for TcpTransport {
    fn protocol_id(&self) -> &str {
        &self.config.protocol_id
    }

    fn needs_queue(&self) -> bool {
        self.config.needs_queue
    }

    fn load_listeners(&self, dispatcher: Arc<Dispatcher>) {
        *self.dispatcher.write().expect("tcp dispatcher lock poisoned") = Some(dispatcher);
    }

    fn on_disconnect(&self, hook: DisconnectHook) {
        self.disconnect_hooks
            .write()
            .expect("disconnect hook lock poisoned")
            .push(hook);
    }

    fn send(&self, address: Option<&str>, envelope: &OutboundEnvelope) -> Result<(), TransportError> {
        let limit = self.config.max_envelope_size_bytes;
        match address {
            Some(address) => {
                let connection = self
                    .connections
                    .lock()
                    .expect("tcp connections lock poisoned")
                    .get(address)
                    .cloned()
                    .ok_or_else(|| TransportError::UnknownPeer {
                        address: address.to_owned(),
                    })?;
                write_envelope(&connection, envelope, limit)
            }
            None => {
                let connections: Vec<Arc<PeerConnection>> = self
                    .connections
                    .lock()
                    .expect("tcp connections lock poisoned")
                    .values()
                    .cloned()
                    .collect();
                for connection in connections {
                    // Broadcast is best-effort per peer.
                    let _ = write_envelope(&connection, envelope, limit);
                }
                Ok(())
            }
        }
    }

    fn is_connected(&self, address: &str) -> bool {
        self.connections
            .lock()
            .expect("tcp connections lock poisoned")
            .contains_key(address)
    }

    fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let connections: Vec<Arc<PeerConnection>> = self
            .connections
            .lock()
            .expect("tcp connections lock poisoned")
            .values()
            .cloned()
            .collect();
        for connection in connections {
            let _ = connection.shutdown();
        }
        self.dispatcher
            .write()
            .expect("tcp dispatcher lock poisoned")
            .take();
    }
}
