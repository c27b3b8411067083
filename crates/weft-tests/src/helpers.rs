//! Shared test helpers: an in-memory substrate and service fixtures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use libp2p::futures::channel::mpsc;
use libp2p::futures::StreamExt;
use libp2p::swarm::ConnectionId;
use libp2p::{PeerId, StreamProtocol};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::codec::Encoder;
use weft_core::error::NetworkError;
use weft_core::types::MessageType;
use weft_network::{
    BoxedStream, Connection, ConnectionStatus, EnvelopeCodec, Envelope, InboundStream,
    IncomingStreams, MessagesConfig, MessagesService, ResourceLimits, Substrate, WireEnvelope,
};

/// Buffer size of each in-memory stream direction.
const PIPE_CAPACITY: usize = 64 * 1024;

/// How a peer reacts to streams opened towards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerBehaviour {
    #[default]
    Healthy,
    /// Stream opens fail immediately.
    Failing,
    /// Stream opens never complete.
    Stalled,
}

#[derive(Debug, Clone)]
struct LinkEnd {
    connection: Connection,
    /// Id of the same link as seen from the remote side.
    remote_id: ConnectionId,
}

#[derive(Default)]
struct PeerState {
    behaviour: PeerBehaviour,
    registration: Option<(StreamProtocol, mpsc::UnboundedSender<InboundStream>)>,
    links: Vec<LinkEnd>,
}

#[derive(Default)]
struct MeshState {
    next_id: usize,
    peers: HashMap<PeerId, PeerState>,
    opened: HashMap<(PeerId, PeerId), usize>,
}

/// A set of peers connected by in-memory links.
#[derive(Default)]
pub struct MemoryMesh {
    state: Mutex<MeshState>,
}

impl MemoryMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_peer(&self) -> PeerId {
        let peer = PeerId::random();
        self.state.lock().peers.insert(peer, PeerState::default());
        peer
    }

    /// The substrate as seen by `peer`.
    pub fn substrate(self: &Arc<Self>, peer: PeerId) -> Arc<MemorySubstrate> {
        Arc::new(MemorySubstrate {
            mesh: Arc::clone(self),
            local: peer,
        })
    }

    /// Link `a` and `b`. Returns the connection ids on `a`'s and `b`'s side.
    pub fn connect(&self, a: PeerId, b: PeerId) -> (ConnectionId, ConnectionId) {
        let mut state = self.state.lock();
        let a_id = ConnectionId::new_unchecked(state.next_id);
        let b_id = ConnectionId::new_unchecked(state.next_id + 1);
        state.next_id += 2;
        if let Some(p) = state.peers.get_mut(&a) {
            p.links.push(LinkEnd {
                connection: Connection::open(a_id, b),
                remote_id: b_id,
            });
        }
        if let Some(p) = state.peers.get_mut(&b) {
            p.links.push(LinkEnd {
                connection: Connection::open(b_id, a),
                remote_id: a_id,
            });
        }
        (a_id, b_id)
    }

    /// `owner`'s connection to `remote`.
    pub fn connection(&self, owner: PeerId, remote: PeerId) -> Option<Connection> {
        let state = self.state.lock();
        state
            .peers
            .get(&owner)?
            .links
            .iter()
            .find(|l| l.connection.peer == remote)
            .map(|l| l.connection.clone())
    }

    fn with_link(&self, owner: PeerId, id: ConnectionId, f: impl FnOnce(&mut Connection)) {
        let mut state = self.state.lock();
        if let Some(link) = state
            .peers
            .get_mut(&owner)
            .and_then(|p| p.links.iter_mut().find(|l| l.connection.id == id))
        {
            f(&mut link.connection);
        }
    }

    pub fn set_limits(&self, owner: PeerId, id: ConnectionId, limits: ResourceLimits) {
        self.with_link(owner, id, |c| c.limits = Some(limits));
    }

    pub fn set_status(&self, owner: PeerId, id: ConnectionId, status: ConnectionStatus) {
        self.with_link(owner, id, |c| c.status = status);
    }

    pub fn status(&self, owner: PeerId, id: ConnectionId) -> Option<ConnectionStatus> {
        let state = self.state.lock();
        state
            .peers
            .get(&owner)?
            .links
            .iter()
            .find(|l| l.connection.id == id)
            .map(|l| l.connection.status)
    }

    pub fn set_behaviour(&self, peer: PeerId, behaviour: PeerBehaviour) {
        if let Some(p) = self.state.lock().peers.get_mut(&peer) {
            p.behaviour = behaviour;
        }
    }

    /// Number of streams successfully opened from `from` to `to`.
    pub fn streams_opened(&self, from: PeerId, to: PeerId) -> usize {
        self.state.lock().opened.get(&(from, to)).copied().unwrap_or(0)
    }

    /// Total streams opened across the mesh.
    pub fn total_streams(&self) -> usize {
        self.state.lock().opened.values().sum()
    }
}

enum Open {
    Ready(BoxedStream),
    Stall,
    Fail(NetworkError),
}

/// [`Substrate`] view of one mesh peer.
pub struct MemorySubstrate {
    mesh: Arc<MemoryMesh>,
    local: PeerId,
}

impl MemorySubstrate {
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    fn open(&self, connection: &Connection, protocol: &StreamProtocol) -> Open {
        let mut state = self.mesh.state.lock();
        let Some(link) = state
            .peers
            .get(&self.local)
            .and_then(|p| p.links.iter().find(|l| l.connection.id == connection.id))
            .cloned()
        else {
            return Open::Fail(NetworkError::SendFailure("unknown connection".into()));
        };
        if link.connection.status == ConnectionStatus::Closed {
            return Open::Fail(NetworkError::SendFailure("connection closed".into()));
        }

        let remote = link.connection.peer;
        let Some(remote_state) = state.peers.get(&remote) else {
            return Open::Fail(NetworkError::SendFailure("remote peer gone".into()));
        };
        match remote_state.behaviour {
            PeerBehaviour::Failing => {
                return Open::Fail(NetworkError::SendFailure("stream reset".into()));
            }
            PeerBehaviour::Stalled => return Open::Stall,
            PeerBehaviour::Healthy => {}
        }

        let Some(remote_conn) = remote_state
            .links
            .iter()
            .find(|l| l.connection.id == link.remote_id)
            .map(|l| l.connection.clone())
        else {
            return Open::Fail(NetworkError::SendFailure("remote side closed".into()));
        };
        let Some((_, sender)) = remote_state
            .registration
            .as_ref()
            .filter(|(p, tx)| p == protocol && !tx.is_closed())
        else {
            return Open::Fail(NetworkError::SendFailure(format!(
                "protocol {protocol} not supported"
            )));
        };

        let (local_end, remote_end) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound = InboundStream {
            connection: remote_conn,
            stream: Box::new(remote_end),
        };
        if sender.unbounded_send(inbound).is_err() {
            return Open::Fail(NetworkError::SendFailure("remote stopped accepting".into()));
        }
        *state.opened.entry((self.local, remote)).or_default() += 1;
        Open::Ready(Box::new(local_end))
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn handle(&self, protocol: StreamProtocol) -> Result<IncomingStreams, NetworkError> {
        let mut state = self.mesh.state.lock();
        let peer = state
            .peers
            .get_mut(&self.local)
            .ok_or_else(|| NetworkError::Registration("unknown peer".into()))?;
        if let Some((existing, tx)) = &peer.registration {
            if !tx.is_closed() {
                return Err(NetworkError::Registration(format!(
                    "{existing} already registered"
                )));
            }
        }
        let (tx, rx) = mpsc::unbounded();
        peer.registration = Some((protocol, tx));
        Ok(rx.boxed())
    }

    fn connections(&self) -> Vec<Connection> {
        let state = self.mesh.state.lock();
        state
            .peers
            .get(&self.local)
            .map(|p| p.links.iter().map(|l| l.connection.clone()).collect())
            .unwrap_or_default()
    }

    async fn new_stream(
        &self,
        connection: &Connection,
        protocol: StreamProtocol,
    ) -> Result<BoxedStream, NetworkError> {
        match self.open(connection, &protocol) {
            Open::Ready(stream) => Ok(stream),
            Open::Fail(e) => Err(e),
            Open::Stall => std::future::pending().await,
        }
    }

    fn close_connection(&self, connection: &Connection) {
        self.mesh
            .set_status(self.local, connection.id, ConnectionStatus::Closing);
    }
}

/// Messages settings with short timeouts for tests.
pub fn fast_config() -> MessagesConfig {
    MessagesConfig {
        read_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_millis(500),
        ..MessagesConfig::default()
    }
}

/// One mesh peer running a messages service.
pub struct TestPeer {
    pub id: PeerId,
    pub substrate: Arc<MemorySubstrate>,
    pub service: MessagesService,
    pub events: broadcast::Receiver<Envelope>,
}

impl TestPeer {
    /// Add a peer to `mesh` and start its service.
    pub async fn spawn(mesh: &Arc<MemoryMesh>, config: MessagesConfig) -> Self {
        let id = mesh.add_peer();
        let substrate = mesh.substrate(id);
        let service = MessagesService::new(substrate.clone(), config).unwrap();
        let events = service.subscribe();
        service.start().await.unwrap();
        Self {
            id,
            substrate,
            service,
            events,
        }
    }

    /// Wait up to `within` for the next delivered envelope.
    pub async fn next_event(&mut self, within: Duration) -> Option<Envelope> {
        tokio::time::timeout(within, self.events.recv())
            .await
            .ok()
            .and_then(|r| r.ok())
    }

    /// Whether no envelope arrives within `within`.
    pub async fn stays_quiet(&mut self, within: Duration) -> bool {
        self.next_event(within).await.is_none()
    }

    /// Open a raw stream to `remote` under this peer's protocol.
    pub async fn raw_stream(&self, mesh: &MemoryMesh, remote: PeerId) -> BoxedStream {
        let connection = mesh.connection(self.id, remote).unwrap();
        self.substrate
            .new_stream(&connection, self.service.protocol().clone())
            .await
            .unwrap()
    }
}

/// Encode one length-prefixed frame.
pub fn frame(kind: MessageType, value: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    EnvelopeCodec::default()
        .encode(
            WireEnvelope {
                kind,
                value: value.to_vec(),
            },
            &mut buf,
        )
        .unwrap();
    buf.to_vec()
}

/// Give spawned tasks time to settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
