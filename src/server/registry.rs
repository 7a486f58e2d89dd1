//! Registry of connected peers
//!
//! Keyed by remote address. The lock is only held for map operations, never
//! while talking to a peer.

use super::ServerError;
use crate::p2p::{OnPeerClosedFn, OnPeerFn, Peer, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Set of active peers, at most one per address
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Arc<dyn Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Fails if its address is already present.
    pub fn insert(&self, peer: Arc<dyn Peer>) -> Result<(), ServerError> {
        let addr = peer.remote_addr();
        let mut peers = self.peers();
        if peers.contains_key(&addr) {
            return Err(ServerError::DuplicatePeer(addr));
        }

        log::info!(
            "Registered {} peer {}",
            if peer.is_outbound() { "outbound" } else { "inbound" },
            addr
        );
        peers.insert(addr, peer);
        Ok(())
    }

    /// Drop `peer` if it is the one registered under its address
    pub fn remove(&self, peer: &Arc<dyn Peer>) -> bool {
        let addr = peer.remote_addr();
        let mut peers = self.peers();
        let same = peers
            .get(&addr)
            .is_some_and(|current| std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(peer)));
        if same {
            peers.remove(&addr);
            log::info!("Removed peer {}", addr);
        }
        same
    }

    /// Copy of the current peer set
    pub fn snapshot(&self) -> Vec<Arc<dyn Peer>> {
        self.peers().values().cloned().collect()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers().contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers().is_empty()
    }

    /// Transport hook that registers accepted connections
    pub fn on_peer_hook(self: &Arc<Self>) -> OnPeerFn {
        let registry = Arc::clone(self);
        Arc::new(move |peer: Arc<dyn Peer>| {
            registry
                .insert(peer)
                .map_err(|e| TransportError::Rejected(e.to_string()))
        })
    }

    /// Transport hook that forgets closed connections
    pub fn on_peer_closed_hook(self: &Arc<Self>) -> OnPeerClosedFn {
        let registry = Arc::clone(self);
        Arc::new(move |peer: &Arc<dyn Peer>| {
            registry.remove(peer);
        })
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Peer>>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
