//! Peer-to-peer file store
//!
//! A node stores files under content-derived paths and replicates every local
//! write to the peers it is connected to over a small framed TCP protocol.

pub mod config;
pub mod p2p;
pub mod server;
pub mod store;

pub use config::Config;
pub use p2p::{Peer, Transport, TransportError};
pub use server::{build_tcp_server, FileServer, Message, Payload, ServerError};
pub use store::{Store, StoreError};
