//! Swarm-maintained view of connected peers.
//!
//! The swarm event loop is the only writer. The substrate and the
//! [`NetworkNode`](crate::service::NetworkNode) handle read snapshots.

use libp2p::swarm::ConnectionId;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use weft_core::types::Role;

use crate::transport::{Connection, ConnectionStatus, ResourceLimits};

#[derive(Debug, Clone)]
struct ConnectionEntry {
    id: ConnectionId,
    established_at: Instant,
    relayed: bool,
    status: ConnectionStatus,
}

#[derive(Debug, Default)]
struct PeerEntry {
    connections: Vec<ConnectionEntry>,
    addresses: Vec<Multiaddr>,
    /// Advertised through identify; unknown until the first exchange.
    role: Option<Role>,
}

#[derive(Debug, Default)]
struct BookState {
    peers: HashMap<PeerId, PeerEntry>,
    listen_addrs: Vec<Multiaddr>,
}

/// Connections, learned addresses and own listen addresses.
#[derive(Debug)]
pub struct PeerBook {
    circuit_duration: Duration,
    circuit_bytes: u64,
    state: RwLock<BookState>,
    connected: Notify,
}

impl PeerBook {
    /// A book whose relayed connections carry the given circuit budget.
    pub fn new(circuit_duration: Duration, circuit_bytes: u64) -> Self {
        Self {
            circuit_duration,
            circuit_bytes,
            state: RwLock::new(BookState::default()),
            connected: Notify::new(),
        }
    }

    /// Record an established connection. Returns `true` for the first
    /// connection to `peer`.
    pub fn connection_established(&self, peer: PeerId, id: ConnectionId, relayed: bool) -> bool {
        let mut state = self.state.write();
        let entry = state.peers.entry(peer).or_default();
        let first = entry.connections.is_empty();
        entry.connections.push(ConnectionEntry {
            id,
            established_at: Instant::now(),
            relayed,
            status: ConnectionStatus::Open,
        });
        drop(state);
        self.connected.notify_waiters();
        first
    }

    /// Forget a closed connection. Returns `true` when it was the last one to
    /// `peer`.
    pub fn connection_closed(&self, peer: &PeerId, id: ConnectionId) -> bool {
        let mut state = self.state.write();
        let Some(entry) = state.peers.get_mut(peer) else {
            return false;
        };
        entry.connections.retain(|c| c.id != id);
        if entry.connections.is_empty() {
            state.peers.remove(peer);
            return true;
        }
        false
    }

    pub fn mark_closing(&self, id: ConnectionId) {
        let mut state = self.state.write();
        for entry in state.peers.values_mut() {
            if let Some(conn) = entry.connections.iter_mut().find(|c| c.id == id) {
                conn.status = ConnectionStatus::Closing;
                return;
            }
        }
    }

    /// Remember addresses a connected peer reported via identify.
    pub fn add_addresses(&self, peer: &PeerId, addrs: impl IntoIterator<Item = Multiaddr>) {
        let mut state = self.state.write();
        if let Some(entry) = state.peers.get_mut(peer) {
            for addr in addrs {
                if !entry.addresses.contains(&addr) {
                    entry.addresses.push(addr);
                }
            }
        }
    }

    /// Record the role a connected peer advertised.
    pub fn set_role(&self, peer: &PeerId, role: Role) {
        if let Some(entry) = self.state.write().peers.get_mut(peer) {
            entry.role = Some(role);
        }
    }

    pub fn role(&self, peer: &PeerId) -> Option<Role> {
        self.state.read().peers.get(peer).and_then(|e| e.role)
    }

    /// Connected peers that advertised the `RELAY` role.
    pub fn relays(&self) -> Vec<PeerId> {
        self.state
            .read()
            .peers
            .iter()
            .filter(|(_, e)| e.role == Some(Role::Relay))
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.state
            .read()
            .peers
            .get(peer)
            .map(|e| e.addresses.clone())
            .unwrap_or_default()
    }

    pub fn add_listen_addr(&self, addr: Multiaddr) {
        let mut state = self.state.write();
        if !state.listen_addrs.contains(&addr) {
            state.listen_addrs.push(addr);
        }
    }

    pub fn remove_listen_addr(&self, addr: &Multiaddr) {
        self.state.write().listen_addrs.retain(|a| a != addr);
    }

    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.state.read().listen_addrs.clone()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.state.read().peers.keys().copied().collect()
    }

    /// Total number of established connections across all peers.
    pub fn connection_count(&self) -> usize {
        self.state.read().peers.values().map(|e| e.connections.len()).sum()
    }

    /// The connection streams to `peer` are attributed to.
    ///
    /// Streams are opened per peer, so each peer is represented by one
    /// connection: the oldest open direct one, else the oldest open relayed
    /// one, else the oldest of any status.
    pub fn primary(&self, peer: &PeerId) -> Option<Connection> {
        let state = self.state.read();
        let entry = state.peers.get(peer)?;
        let chosen = entry
            .connections
            .iter()
            .find(|c| c.status == ConnectionStatus::Open && !c.relayed)
            .or_else(|| entry.connections.iter().find(|c| c.status == ConnectionStatus::Open))
            .or_else(|| entry.connections.first())?;
        Some(self.snapshot(*peer, chosen))
    }

    /// Like [`primary`](Self::primary), but waits up to `within` for the
    /// swarm loop to record a connection to `peer`.
    ///
    /// Streams are handed over by the connection task and can overtake the
    /// swarm's connection event.
    pub async fn wait_primary(&self, peer: &PeerId, within: Duration) -> Option<Connection> {
        let deadline = Instant::now() + within;
        loop {
            let notified = self.connected.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(connection) = self.primary(peer) {
                return Some(connection);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.primary(peer);
            }
        }
    }

    /// One connection snapshot per connected peer.
    pub fn connections(&self) -> Vec<Connection> {
        let peers = self.peers();
        peers.iter().filter_map(|p| self.primary(p)).collect()
    }

    fn snapshot(&self, peer: PeerId, entry: &ConnectionEntry) -> Connection {
        let limits = entry.relayed.then(|| {
            let remaining = self
                .circuit_duration
                .saturating_sub(entry.established_at.elapsed());
            ResourceLimits {
                seconds: Some(remaining.as_secs()),
                bytes: Some(self.circuit_bytes),
            }
        });
        Connection {
            id: entry.id,
            peer,
            status: entry.status,
            limits,
        }
    }
}
