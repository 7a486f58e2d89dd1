//! Peer-to-peer transport layer
//!
//! A [`Transport`] owns the listening socket and every peer connection. Each
//! connection runs a handshake, is offered to the peer-accepted hook, and then
//! decodes [`Envelope`]s onto a single shared stream returned by
//! [`Transport::consume`].

pub mod codec;
pub mod tcp;

pub use codec::FrameCodec;
pub use tcp::{TcpPeer, TcpTransport, TcpTransportOpts};

use crossbeam_channel::Receiver;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("peer rejected: {0}")]
    Rejected(String),

    #[error("transport is already listening")]
    AlreadyListening,

    #[error("transport is closed")]
    Closed,
}

/// One decoded network message, tagged with the sender's address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub payload: Vec<u8>,
}

/// A remote node reachable over one connection
pub trait Peer: Send + Sync {
    /// Write already-encoded bytes to the connection
    fn send(&self, bytes: &[u8]) -> io::Result<()>;

    /// Remote address, used as the registry key
    fn remote_addr(&self) -> String;

    /// True if this side dialed the connection
    fn is_outbound(&self) -> bool;

    /// Close the connection. Closing twice is a no-op.
    fn close(&self) -> io::Result<()>;
}

/// Reads one envelope off a connection.
///
/// `UnexpectedEof` signals the end of the stream; every other error is a
/// recoverable decode failure.
pub trait Decoder: Send + Sync {
    fn decode(&self, reader: &mut dyn Read) -> io::Result<Envelope>;
}

/// Wraps a payload into bytes the matching [`Decoder`] can read back
pub trait Encoder: Send + Sync {
    fn encode(&self, payload: &[u8]) -> io::Result<Vec<u8>>;
}

/// Runs once per new connection before any message is read
pub type HandshakeFn = Arc<dyn Fn(&dyn Peer) -> Result<(), TransportError> + Send + Sync>;

/// Offered every connection that passed the handshake; an error drops it
pub type OnPeerFn = Arc<dyn Fn(Arc<dyn Peer>) -> Result<(), TransportError> + Send + Sync>;

/// Called when an accepted connection goes away
pub type OnPeerClosedFn = Arc<dyn Fn(&Arc<dyn Peer>) + Send + Sync>;

/// Handshake that accepts every connection
pub fn nop_handshake(_peer: &dyn Peer) -> Result<(), TransportError> {
    Ok(())
}

/// Connection manager that produces a stream of envelopes
pub trait Transport: Send + Sync {
    /// Bind the listen address and start accepting connections
    fn listen_and_accept(&self) -> Result<(), TransportError>;

    /// Open an outbound connection. No retry.
    fn dial(&self, addr: &str) -> Result<(), TransportError>;

    /// Stream of decoded envelopes from every connection.
    ///
    /// Meant for a single consumer; clones share one queue.
    fn consume(&self) -> Receiver<Envelope>;

    /// Stop accepting. Open connections are left alone.
    fn close(&self) -> Result<(), TransportError>;

    /// Address actually bound, once listening
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// True for errors that mean the remote side is gone
pub(crate) fn is_end_of_stream(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
