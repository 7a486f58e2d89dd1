//! File server node
//!
//! Owns the peer registry, dials bootstrap peers, replicates local writes to
//! every connected peer, and dispatches inbound messages to their handlers.

pub mod message;
pub mod registry;

pub use message::{Message, Payload};
pub use registry::PeerRegistry;

use crate::config::Config;
use crate::p2p::{
    Encoder, Envelope, FrameCodec, Peer, TcpTransport, TcpTransportOpts, Transport,
    TransportError,
};
use crate::store::{Store, StoreError, StoreOpts};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use thiserror::Error;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("message encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("peer already registered: {0}")]
    DuplicatePeer(String),

    #[error("server is {actual}, expected {expected}")]
    InvalidState {
        expected: NodeState,
        actual: NodeState,
    },
}

/// Lifecycle of a server: Created -> Started -> Running -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Started,
    Running,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Created => "created",
            NodeState::Started => "started",
            NodeState::Running => "running",
            NodeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// File server configuration
pub struct FileServerOpts {
    /// Advertised in outgoing messages when the transport has no bound address
    pub listen_addr: String,
    pub store: StoreOpts,
    pub transport: Arc<dyn Transport>,
    /// Must produce bytes the peers' decoders accept
    pub encoder: Arc<dyn Encoder>,
    pub bootstrap_nodes: Vec<String>,
}

/// A storage node
pub struct FileServer {
    listen_addr: String,
    store: Store,
    transport: Arc<dyn Transport>,
    encoder: Arc<dyn Encoder>,
    bootstrap_nodes: Vec<String>,
    registry: Arc<PeerRegistry>,
    state: Mutex<NodeState>,
    stopped: AtomicBool,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl FileServer {
    /// Create a server with a fresh, empty registry
    pub fn new(opts: FileServerOpts) -> Self {
        Self::with_registry(opts, Arc::new(PeerRegistry::new()))
    }

    /// Create a server around a registry the transport already reports to
    pub fn with_registry(opts: FileServerOpts, registry: Arc<PeerRegistry>) -> Self {
        let (stop_tx, stop_rx) = bounded(1);
        Self {
            listen_addr: opts.listen_addr,
            store: Store::new(opts.store),
            transport: opts.transport,
            encoder: opts.encoder,
            bootstrap_nodes: opts.bootstrap_nodes,
            registry,
            state: Mutex::new(NodeState::Created),
            stopped: AtomicBool::new(false),
            stop_tx,
            stop_rx,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn state(&self) -> NodeState {
        *self.lock_state()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn has_peer(&self, addr: &str) -> bool {
        self.registry.contains(addr)
    }

    /// Address this node advertises to its peers
    pub fn local_addr(&self) -> String {
        self.transport
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| self.listen_addr.clone())
    }

    /// Register a peer that passed the handshake
    pub fn on_peer(&self, peer: Arc<dyn Peer>) -> Result<(), ServerError> {
        self.registry.insert(peer)
    }

    /// Listen, dial the bootstrap peers, and run the dispatch loop until
    /// [`FileServer::stop`] is called.
    pub fn start(&self) -> Result<(), ServerError> {
        {
            let mut state = self.lock_state();
            if *state != NodeState::Created {
                return Err(ServerError::InvalidState {
                    expected: NodeState::Created,
                    actual: *state,
                });
            }
            self.transport.listen_and_accept()?;
            *state = NodeState::Started;
        }

        log::info!("File server started on {}", self.local_addr());
        self.bootstrap();

        *self.lock_state() = NodeState::Running;
        self.run_loop();
        Ok(())
    }

    /// Signal the dispatch loop to exit. Safe to call any number of times.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Stopping file server on {}", self.local_addr());

        let mut state = self.lock_state();
        if *state == NodeState::Created {
            *state = NodeState::Stopped;
        }
        let _ = self.stop_tx.try_send(());
    }

    /// Write locally, then replicate the same bytes to every peer.
    ///
    /// The replication frame is built before the local write, so an encoding
    /// failure leaves the store untouched. Returns the number of peers that
    /// accepted the message.
    pub fn store_data<R: Read + ?Sized>(&self, key: &str, reader: &mut R) -> Result<usize, ServerError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let payload = Payload::StoreFile {
            key: key.to_string(),
            data: data.clone(),
        };
        let kind = payload.kind();
        let frame = self.encode_frame(payload)?;

        self.store.write(key, &mut data.as_slice())?;
        log::info!("Stored {} bytes under {}", data.len(), key);

        Ok(self.send_to_peers(kind, &frame))
    }

    /// Encode `payload` once and send it to every registered peer.
    ///
    /// Send failures are logged and skipped. Returns the number of peers
    /// that accepted the bytes.
    pub fn broadcast(&self, payload: Payload) -> Result<usize, ServerError> {
        let kind = payload.kind();
        let frame = self.encode_frame(payload)?;
        Ok(self.send_to_peers(kind, &frame))
    }

    fn encode_frame(&self, payload: Payload) -> Result<Vec<u8>, ServerError> {
        let message = Message::new(self.local_addr(), payload);
        Ok(self.encoder.encode(&message.encode()?)?)
    }

    fn send_to_peers(&self, kind: &str, frame: &[u8]) -> usize {
        let peers = self.registry.snapshot();
        let mut delivered = 0;
        for peer in &peers {
            match peer.send(frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Failed to send {} to {}: {}", kind, peer.remote_addr(), e);
                }
            }
        }

        log::debug!("Broadcast {} to {}/{} peers", kind, delivered, peers.len());
        delivered
    }

    /// Run the handler for one decoded message
    pub fn handle_message(&self, message: Message) -> Result<(), ServerError> {
        match message.payload {
            Payload::StoreFile { key, data } => {
                let written = self.store.write(&key, &mut data.as_slice())?;
                log::info!("Stored {} bytes under {} from {}", written, key, message.from);
                Ok(())
            }
            Payload::Unknown => {
                log::debug!("Ignoring unknown message from {}", message.from);
                Ok(())
            }
        }
    }

    fn bootstrap(&self) {
        for addr in self.bootstrap_nodes.iter().filter(|addr| !addr.is_empty()) {
            let transport = Arc::clone(&self.transport);
            let addr = addr.clone();
            thread::spawn(move || {
                log::info!("Dialing bootstrap node {}", addr);
                if let Err(e) = transport.dial(&addr) {
                    log::warn!("Failed to dial bootstrap node {}: {}", addr, e);
                }
            });
        }
    }

    fn run_loop(&self) {
        let envelopes = self.transport.consume();

        loop {
            select! {
                recv(envelopes) -> envelope => match envelope {
                    Ok(envelope) => self.handle_envelope(envelope),
                    Err(_) => {
                        log::warn!("Envelope stream closed");
                        break;
                    }
                },
                recv(self.stop_rx) -> _ => break,
            }
        }

        self.stopped.store(true, Ordering::Release);
        if let Err(e) = self.transport.close() {
            log::warn!("Failed to close transport: {}", e);
        }
        *self.lock_state() = NodeState::Stopped;
        log::info!("File server stopped");
    }

    fn handle_envelope(&self, envelope: Envelope) {
        let message = match Message::decode(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping malformed message from {}: {}", envelope.from, e);
                return;
            }
        };

        log::debug!(
            "Received {} from {} (via {})",
            message.payload.kind(),
            message.from,
            envelope.from
        );
        if let Err(e) = self.handle_message(message) {
            log::error!("Failed to handle message from {}: {}", envelope.from, e);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wire a TCP transport, frame codec, no-op handshake and registry hooks
/// into a server
pub fn build_tcp_server(config: &Config) -> FileServer {
    let registry = Arc::new(PeerRegistry::new());

    let mut transport_opts = TcpTransportOpts::new(config.node.listen_addr.clone());
    transport_opts.on_peer = Some(registry.on_peer_hook());
    transport_opts.on_peer_closed = Some(registry.on_peer_closed_hook());
    transport_opts.max_decode_errors = config.transport.max_decode_errors;
    transport_opts.envelope_buffer = config.transport.envelope_buffer;

    let opts = FileServerOpts {
        listen_addr: config.node.listen_addr.clone(),
        store: StoreOpts {
            root: config.node.storage_root.clone(),
            transform: config.node.path_transform.transform(),
        },
        transport: Arc::new(TcpTransport::new(transport_opts)),
        encoder: Arc::new(FrameCodec),
        bootstrap_nodes: config.node.bootstrap.clone(),
    };

    FileServer::with_registry(opts, registry)
}
