//! TCP transport
//!
//! One thread accepts connections, and every accepted or dialed connection
//! gets its own thread that runs the handshake and then decodes envelopes
//! until the stream ends.

use super::{
    is_end_of_stream, nop_handshake, Decoder, Envelope, FrameCodec, HandshakeFn, OnPeerClosedFn,
    OnPeerFn, Peer, Transport, TransportError,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Consecutive decode failures tolerated before a connection is dropped
pub const DEFAULT_MAX_DECODE_ERRORS: usize = 8;

/// Envelopes buffered between connection readers and the consumer
pub const DEFAULT_ENVELOPE_BUFFER: usize = 32;

/// How often the accept loop checks for new connections and for close
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Peer over a TCP connection
pub struct TcpPeer {
    stream: TcpStream,
    remote: SocketAddr,
    outbound: bool,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl TcpPeer {
    pub fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        Ok(Self {
            stream,
            remote,
            outbound,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }
}

impl Peer for TcpPeer {
    fn send(&self, bytes: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection to {} is closed", self.remote),
            ));
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut writer = &self.stream;
        writer.write_all(bytes)?;
        writer.flush()
    }

    fn remote_addr(&self) -> String {
        self.remote.to_string()
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// TCP transport configuration
#[derive(Clone)]
pub struct TcpTransportOpts {
    /// Address to bind, e.g. `127.0.0.1:3000`
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    pub decoder: Arc<dyn Decoder>,
    /// Registration hook; `None` accepts every peer
    pub on_peer: Option<OnPeerFn>,
    pub on_peer_closed: Option<OnPeerClosedFn>,
    pub max_decode_errors: usize,
    pub envelope_buffer: usize,
}

impl TcpTransportOpts {
    /// Options with the frame codec and a no-op handshake
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(nop_handshake),
            decoder: Arc::new(FrameCodec),
            on_peer: None,
            on_peer_closed: None,
            max_decode_errors: DEFAULT_MAX_DECODE_ERRORS,
            envelope_buffer: DEFAULT_ENVELOPE_BUFFER,
        }
    }
}

struct Shared {
    opts: TcpTransportOpts,
    envelopes: Sender<Envelope>,
}

#[derive(Default)]
struct ListenerState {
    local_addr: Option<SocketAddr>,
    accept_thread: Option<JoinHandle<()>>,
}

/// TCP implementation of [`Transport`]
pub struct TcpTransport {
    shared: Arc<Shared>,
    receiver: Receiver<Envelope>,
    listener: Mutex<ListenerState>,
    closed: Arc<AtomicBool>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (tx, rx) = bounded(opts.envelope_buffer);
        Self {
            shared: Arc::new(Shared {
                opts,
                envelopes: tx,
            }),
            receiver: rx,
            listener: Mutex::new(ListenerState::default()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> MutexGuard<'_, ListenerState> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for TcpTransport {
    fn listen_and_accept(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if state.local_addr.is_some() {
            return Err(TransportError::AlreadyListening);
        }

        let listener = TcpListener::bind(&self.shared.opts.listen_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("TCP transport listening on {}", local_addr);

        let shared = Arc::clone(&self.shared);
        let closed = Arc::clone(&self.closed);
        state.local_addr = Some(local_addr);
        state.accept_thread = Some(thread::spawn(move || {
            accept_loop(shared, listener, closed)
        }));

        Ok(())
    }

    fn dial(&self, addr: &str) -> Result<(), TransportError> {
        let stream = TcpStream::connect(addr)?;
        log::debug!("Dialed {}", addr);

        let shared = Arc::clone(&self.shared);
        thread::spawn(move || handle_connection(shared, stream, true));
        Ok(())
    }

    fn consume(&self) -> Receiver<Envelope> {
        self.receiver.clone()
    }

    fn close(&self) -> Result<(), TransportError> {
        let accept_thread = {
            let mut state = self.state();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            state.accept_thread.take()
        };

        // The listener is dropped by the accept thread, so the port is free
        // once the join returns
        if let Some(accept_thread) = accept_thread {
            if accept_thread.join().is_err() {
                log::warn!("TCP transport: accept thread panicked");
            }
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.state().local_addr
    }
}

/// Accept until the closed flag is set. The listener is non-blocking, so the
/// flag is seen within one poll interval.
fn accept_loop(shared: Arc<Shared>, listener: TcpListener, closed: Arc<AtomicBool>) {
    while !closed.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                // Accepted sockets inherit non-blocking mode on some platforms
                if let Err(e) = stream.set_nonblocking(false) {
                    log::warn!("Dropping connection that cannot block: {}", e);
                    continue;
                }
                let shared = Arc::clone(&shared);
                thread::spawn(move || handle_connection(shared, stream, false));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                log::error!("Connection error: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    log::info!("TCP transport: listener closed");
}

/// Per-connection task: handshake, registration, then the decode loop
fn handle_connection(shared: Arc<Shared>, stream: TcpStream, outbound: bool) {
    let read_half = match stream.try_clone() {
        Ok(read_half) => read_half,
        Err(e) => {
            log::warn!("Failed to clone connection stream: {}", e);
            return;
        }
    };
    let peer: Arc<dyn Peer> = match TcpPeer::new(stream, outbound) {
        Ok(peer) => Arc::new(peer),
        Err(e) => {
            log::warn!("Dropping connection without peer address: {}", e);
            return;
        }
    };
    let remote = peer.remote_addr();
    log::info!(
        "New {} connection with {}",
        if outbound { "outbound" } else { "inbound" },
        remote
    );

    if let Err(e) = (shared.opts.handshake)(peer.as_ref()) {
        log::warn!("Handshake with {} failed: {}", remote, e);
        let _ = peer.close();
        return;
    }

    if let Some(on_peer) = &shared.opts.on_peer {
        if let Err(e) = on_peer(Arc::clone(&peer)) {
            log::warn!("Peer {} not accepted: {}", remote, e);
            let _ = peer.close();
            return;
        }
    }

    read_loop(&shared, &remote, BufReader::new(read_half));

    let _ = peer.close();
    if let Some(on_peer_closed) = &shared.opts.on_peer_closed {
        on_peer_closed(&peer);
    }
}

fn read_loop(shared: &Shared, remote: &str, mut reader: BufReader<TcpStream>) {
    let max_errors = shared.opts.max_decode_errors.max(1);
    let mut failures = 0;

    loop {
        match shared.opts.decoder.decode(&mut reader) {
            Ok(mut envelope) => {
                failures = 0;
                envelope.from = remote.to_string();
                log::debug!(
                    "Received {} byte envelope from {}",
                    envelope.payload.len(),
                    remote
                );
                if shared.envelopes.send(envelope).is_err() {
                    return;
                }
            }
            Err(e) if is_end_of_stream(&e) => {
                log::info!("Connection closed by peer {}", remote);
                return;
            }
            Err(e) => {
                failures += 1;
                log::warn!(
                    "Error decoding message from {} ({}/{}): {}",
                    remote,
                    failures,
                    max_errors,
                    e
                );
                if failures >= max_errors {
                    log::warn!(
                        "Dropping {} after {} consecutive decode errors",
                        remote,
                        failures
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::codec::{write_frame, FrameKind};
    use crate::p2p::Encoder;
    use crossbeam_channel::unbounded;
    use std::io::Read;

    const WAIT: Duration = Duration::from_secs(5);

    fn listening(opts: TcpTransportOpts) -> (TcpTransport, SocketAddr) {
        let transport = TcpTransport::new(opts);
        transport.listen_and_accept().unwrap();
        let addr = transport.local_addr().unwrap();
        (transport, addr)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream
    }

    /// True once the server side has shut the connection down
    fn closed_by_server(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => is_end_of_stream(&e),
        }
    }

    #[test]
    fn test_inbound_envelopes() {
        let (transport, addr) = listening(TcpTransportOpts::new("127.0.0.1:0"));
        let mut client = connect(addr);

        write_frame(&mut client, FrameKind::Message, b"one").unwrap();
        write_frame(&mut client, FrameKind::Message, b"two").unwrap();

        let envelopes = transport.consume();
        let first = envelopes.recv_timeout(WAIT).unwrap();
        let second = envelopes.recv_timeout(WAIT).unwrap();

        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
        assert_eq!(first.from, client.local_addr().unwrap().to_string());

        transport.close().unwrap();
    }

    #[test]
    fn test_dial_and_send() {
        let (server, addr) = listening(TcpTransportOpts::new("127.0.0.1:0"));

        let (peer_tx, peer_rx) = unbounded();
        let mut opts = TcpTransportOpts::new("127.0.0.1:0");
        opts.on_peer = Some(Arc::new(move |peer: Arc<dyn Peer>| -> Result<(), TransportError> {
            peer_tx.send(peer).unwrap();
            Ok(())
        }));
        let client = TcpTransport::new(opts);
        client.dial(&addr.to_string()).unwrap();

        let peer = peer_rx.recv_timeout(WAIT).unwrap();
        assert!(peer.is_outbound());
        assert_eq!(peer.remote_addr(), addr.to_string());

        peer.send(&FrameCodec.encode(b"over the wire").unwrap()).unwrap();
        let envelope = server.consume().recv_timeout(WAIT).unwrap();
        assert_eq!(envelope.payload, b"over the wire");

        server.close().unwrap();
    }

    #[test]
    fn test_dial_failure() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let transport = TcpTransport::new(TcpTransportOpts::new("127.0.0.1:0"));
        assert!(matches!(
            transport.dial(&addr.to_string()),
            Err(TransportError::Io(_))
        ));
    }

    #[test]
    fn test_handshake_failure_closes_connection() {
        let (registered_tx, registered_rx) = unbounded();
        let mut opts = TcpTransportOpts::new("127.0.0.1:0");
        opts.handshake = Arc::new(|_peer: &dyn Peer| -> Result<(), TransportError> {
            Err(TransportError::Handshake("bad hello".to_string()))
        });
        opts.on_peer = Some(Arc::new(move |peer: Arc<dyn Peer>| -> Result<(), TransportError> {
            registered_tx.send(peer.remote_addr()).unwrap();
            Ok(())
        }));
        let (transport, addr) = listening(opts);

        let mut client = connect(addr);
        assert!(closed_by_server(&mut client));
        assert!(registered_rx.try_recv().is_err());

        transport.close().unwrap();
    }

    #[test]
    fn test_rejected_peer_is_dropped() {
        let (closed_tx, closed_rx) = unbounded();
        let mut opts = TcpTransportOpts::new("127.0.0.1:0");
        opts.on_peer = Some(Arc::new(|peer: Arc<dyn Peer>| -> Result<(), TransportError> {
            Err(TransportError::Rejected(peer.remote_addr()))
        }));
        opts.on_peer_closed = Some(Arc::new(move |peer: &Arc<dyn Peer>| {
            closed_tx.send(peer.remote_addr()).unwrap();
        }));
        let (transport, addr) = listening(opts);

        let mut client = connect(addr);
        assert!(closed_by_server(&mut client));
        // Only accepted peers are reported as closed
        assert!(closed_rx.recv_timeout(Duration::from_millis(200)).is_err());

        transport.close().unwrap();
    }

    #[test]
    fn test_decode_errors_drop_connection() {
        let (closed_tx, closed_rx) = unbounded();
        let mut opts = TcpTransportOpts::new("127.0.0.1:0");
        opts.max_decode_errors = 3;
        opts.on_peer_closed = Some(Arc::new(move |peer: &Arc<dyn Peer>| {
            closed_tx.send(peer.remote_addr()).unwrap();
        }));
        let (transport, addr) = listening(opts);

        let mut client = connect(addr);
        client.write_all(&[0x7f, 0x7f, 0x7f]).unwrap();

        let closed = closed_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(closed, client.local_addr().unwrap().to_string());
        assert!(closed_by_server(&mut client));
        assert!(transport.consume().try_recv().is_err());

        transport.close().unwrap();
    }

    #[test]
    fn test_decode_errors_reset_after_good_frame() {
        let mut opts = TcpTransportOpts::new("127.0.0.1:0");
        opts.max_decode_errors = 2;
        let (transport, addr) = listening(opts);

        let mut client = connect(addr);
        client.write_all(&[0x7f]).unwrap();
        write_frame(&mut client, FrameKind::Message, b"still here").unwrap();
        client.write_all(&[0x7f]).unwrap();
        write_frame(&mut client, FrameKind::Message, b"and again").unwrap();

        let envelopes = transport.consume();
        assert_eq!(envelopes.recv_timeout(WAIT).unwrap().payload, b"still here");
        assert_eq!(envelopes.recv_timeout(WAIT).unwrap().payload, b"and again");

        transport.close().unwrap();
    }

    #[test]
    fn test_close_stops_accepting() {
        let (transport, addr) = listening(TcpTransportOpts::new("127.0.0.1:0"));

        transport.close().unwrap();
        transport.close().unwrap();

        assert!(TcpStream::connect(addr).is_err());
        assert!(matches!(
            transport.listen_and_accept(),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_close_on_unspecified_address_frees_port() {
        let (transport, addr) = listening(TcpTransportOpts::new("0.0.0.0:0"));

        transport.close().unwrap();

        let rebound = TcpListener::bind(("0.0.0.0", addr.port())).unwrap();
        assert_eq!(rebound.local_addr().unwrap().port(), addr.port());
    }

    #[test]
    fn test_close_without_listen() {
        let transport = TcpTransport::new(TcpTransportOpts::new("127.0.0.1:0"));
        transport.close().unwrap();
        assert!(transport.local_addr().is_none());
    }

    #[test]
    fn test_close_keeps_open_connections() {
        let (transport, addr) = listening(TcpTransportOpts::new("127.0.0.1:0"));
        let mut client = connect(addr);
        write_frame(&mut client, FrameKind::Message, b"before").unwrap();

        let envelopes = transport.consume();
        assert_eq!(envelopes.recv_timeout(WAIT).unwrap().payload, b"before");

        transport.close().unwrap();

        write_frame(&mut client, FrameKind::Message, b"after").unwrap();
        assert_eq!(envelopes.recv_timeout(WAIT).unwrap().payload, b"after");
    }

    #[test]
    fn test_listen_twice() {
        let (transport, _addr) = listening(TcpTransportOpts::new("127.0.0.1:0"));
        assert!(matches!(
            transport.listen_and_accept(),
            Err(TransportError::AlreadyListening)
        ));
        transport.close().unwrap();
    }

    #[test]
    fn test_peer_close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let peer = TcpPeer::new(stream, true).unwrap();

        peer.close().unwrap();
        peer.close().unwrap();
        assert_eq!(
            peer.send(b"late").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}
