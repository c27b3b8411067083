//! Network node running the libp2p swarm and the messages service.
//!
//! Uses a command-channel architecture: the [`NetworkNode`] handle sends
//! commands over an mpsc channel to a background task that owns the swarm.
//! Connection state observed by that task is published through a shared
//! [`PeerBook`], which backs the [`Libp2pSubstrate`] the messages service
//! runs on.

use libp2p::futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{identify, relay, Multiaddr, PeerId, StreamProtocol};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use weft_core::constants::EVENT_CHANNEL_CAPACITY;
use weft_core::error::{NetworkError, NodeError, StartupError};
use weft_core::types::Role;

use crate::behaviour::{self, Composed, WeftBehaviour, WeftBehaviourEvent};
use crate::config::NetworkConfig;
use crate::messages::MessagesService;
use crate::peer_book::PeerBook;
use crate::substrate::Libp2pSubstrate;

/// Commands sent from [`NetworkNode`] and the substrate to the swarm task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Dial a remote peer address.
    Dial(Multiaddr),
    /// Publish raw bytes on the deployment's pubsub topic.
    Publish(Vec<u8>),
    /// Close one connection.
    CloseConnection(ConnectionId),
    /// Shut down the swarm event loop.
    Shutdown,
}

/// Events emitted by the network layer for consumption by higher layers.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// First connection to a peer was established.
    PeerConnected(PeerId),
    /// Last connection to a peer was closed.
    PeerDisconnected(PeerId),
    /// A pubsub message arrived on the deployment topic.
    PubsubMessage {
        /// Peer that forwarded the message.
        source: PeerId,
        /// The raw message data.
        data: Vec<u8>,
    },
}

/// State shared between the [`NetworkNode`] handle and the swarm task.
struct SharedState {
    book: Arc<PeerBook>,
    /// Whether the swarm event loop is still running.
    running: AtomicBool,
}

/// A running P2P node.
///
/// Created via [`NetworkNode::start`], which composes the swarm for the
/// configured role, starts listening and spawns the swarm event loop.
pub struct NetworkNode {
    command_tx: mpsc::UnboundedSender<Command>,
    state: Arc<SharedState>,
    local_peer_id: PeerId,
    messages: MessagesService,
}

impl std::fmt::Debug for NetworkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkNode")
            .field("peer_id", &self.local_peer_id)
            .field("connections", &self.state.book.connection_count())
            .field("running", &self.state.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl NetworkNode {
    /// Compose, listen, dial bootstrap peers and start the messages service.
    ///
    /// Returns the handle and a receiver for [`NetworkEvent`]s.
    pub async fn start(
        config: NetworkConfig,
    ) -> Result<(Self, broadcast::Receiver<NetworkEvent>), NodeError> {
        let Composed {
            mut swarm,
            listen_addrs,
            control,
            local_peer_id,
        } = behaviour::compose(&config)?;
        info!(%local_peer_id, role = %config.role, network = %config.network_name, "starting network node");

        let topic = IdentTopic::new(config.pubsub_topic());
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| StartupError::Composition(format!("subscribe {topic}: {e}")))?;

        for addr in listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| StartupError::Composition(format!("listen on {addr}: {e}")))?;
        }

        for peer_addr in &config.bootstrap_peers {
            match peer_addr.parse::<Multiaddr>() {
                Ok(addr) => {
                    if let Some(Protocol::P2p(peer_id)) = addr.iter().last() {
                        swarm
                            .behaviour_mut()
                            .kademlia
                            .add_address(&peer_id, addr.clone());
                    }
                    if let Err(e) = swarm.dial(addr) {
                        warn!(addr = %peer_addr, error = %e, "bootstrap dial failed");
                    }
                }
                Err(e) => warn!(addr = %peer_addr, error = %e, "ignoring invalid bootstrap address"),
            }
        }
        if !config.bootstrap_peers.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
                debug!(error = %e, "kademlia bootstrap not started");
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let state = Arc::new(SharedState {
            book: Arc::new(PeerBook::new(
                config.relay.circuit_duration,
                config.relay.circuit_bytes,
            )),
            running: AtomicBool::new(true),
        });

        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            swarm_event_loop(swarm, command_rx, event_tx, topic, state_clone).await;
        });

        let substrate = Libp2pSubstrate::new(
            control,
            Arc::clone(&state.book),
            command_tx.clone(),
            config.messages.max_inbound_streams,
            config.messages.max_outbound_streams,
        );
        let messages = MessagesService::new(Arc::new(substrate), config.messages.clone())?;
        messages.start().await?;

        let node = NetworkNode {
            command_tx,
            state,
            local_peer_id,
            messages,
        };
        Ok((node, event_rx))
    }

    /// The local peer ID assigned to this node.
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// The message protocol identifier this node handles.
    pub fn protocol(&self) -> &StreamProtocol {
        self.messages.protocol()
    }

    /// The flood-propagation service.
    pub fn messages(&self) -> &MessagesService {
        &self.messages
    }

    /// Number of established connections.
    pub fn connection_count(&self) -> usize {
        self.state.book.connection_count()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.state.book.peers()
    }

    /// Role a connected peer advertised, once identify has run.
    pub fn peer_role(&self, peer: &PeerId) -> Option<Role> {
        self.state.book.role(peer)
    }

    /// Connected peers that advertised the `RELAY` role.
    pub fn relays(&self) -> Vec<PeerId> {
        self.state.book.relays()
    }

    /// Listen addresses a connected peer reported.
    pub fn peer_addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.state.book.addresses(peer)
    }

    /// Addresses the swarm is currently listening on.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.state.book.listen_addrs()
    }

    /// Whether the background swarm event loop is still running.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Relaxed)
    }

    /// Dial a remote peer by multiaddr.
    pub fn connect_peer(&self, addr: Multiaddr) -> Result<(), NetworkError> {
        self.command_tx
            .send(Command::Dial(addr))
            .map_err(|_| NetworkError::SwarmStopped)
    }

    /// Publish raw bytes on the deployment's pubsub topic.
    pub fn publish_pubsub(&self, data: Vec<u8>) -> Result<(), NetworkError> {
        self.command_tx
            .send(Command::Publish(data))
            .map_err(|_| NetworkError::SwarmStopped)
    }

    /// Stop the messages service, then the swarm.
    pub async fn shutdown(&self) {
        self.messages.stop().await;
        let _ = self.command_tx.send(Command::Shutdown);
    }
}

fn log_relay_server(event: relay::Event) {
    match event {
        relay::Event::ReservationReqAccepted { src_peer_id, .. } => {
            info!(peer = %src_peer_id, "relay reservation accepted");
        }
        relay::Event::ReservationTimedOut { src_peer_id } => {
            debug!(peer = %src_peer_id, "relay reservation timed out");
        }
        relay::Event::CircuitReqAccepted { src_peer_id, dst_peer_id } => {
            debug!(src = %src_peer_id, dst = %dst_peer_id, "relay circuit opened");
        }
        relay::Event::CircuitClosed { src_peer_id, dst_peer_id, error } => {
            debug!(src = %src_peer_id, dst = %dst_peer_id, ?error, "relay circuit closed");
        }
        other => debug!(event = ?other, "relay server event"),
    }
}

fn log_relay_client(event: relay::client::Event) {
    match event {
        relay::client::Event::ReservationReqAccepted { relay_peer_id, renewal, .. } => {
            info!(relay = %relay_peer_id, renewal, "relay reservation accepted");
        }
        relay::client::Event::OutboundCircuitEstablished { relay_peer_id, .. } => {
            debug!(relay = %relay_peer_id, "outbound relay circuit established");
        }
        relay::client::Event::InboundCircuitEstablished { src_peer_id, .. } => {
            debug!(peer = %src_peer_id, "inbound relay circuit established");
        }
        #[allow(unreachable_patterns)]
        other => debug!(event = ?other, "relay client event"),
    }
}

/// Background task running the libp2p swarm event loop.
///
/// Executes commands from [`NetworkNode`] and the substrate, keeps the peer
/// book current and emits [`NetworkEvent`]s to subscribers.
async fn swarm_event_loop(
    mut swarm: libp2p::Swarm<WeftBehaviour>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: broadcast::Sender<NetworkEvent>,
    topic: IdentTopic,
    state: Arc<SharedState>,
) {
    let book = Arc::clone(&state.book);
    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Dial(addr)) => {
                        if let Err(e) = swarm.dial(addr) {
                            warn!(error = %e, "dial error");
                        }
                    }
                    Some(Command::Publish(data)) => {
                        if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic.clone(), data) {
                            debug!(error = %e, "gossipsub publish error");
                        }
                    }
                    Some(Command::CloseConnection(id)) => {
                        if !swarm.close_connection(id) {
                            debug!(connection = ?id, "connection already closed");
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        info!("shutting down swarm event loop");
                        break;
                    }
                }
            }
            event = swarm.next() => {
                let Some(event) = event else {
                    break;
                };

                match event {
                    SwarmEvent::ConnectionEstablished { peer_id, connection_id, endpoint, .. } => {
                        let relayed = endpoint.is_relayed();
                        if book.connection_established(peer_id, connection_id, relayed) {
                            let _ = event_tx.send(NetworkEvent::PeerConnected(peer_id));
                        }
                        info!(peer = %peer_id, relayed, count = book.connection_count(), "connection established");
                    }

                    SwarmEvent::ConnectionClosed { peer_id, connection_id, cause, .. } => {
                        if book.connection_closed(&peer_id, connection_id) {
                            let _ = event_tx.send(NetworkEvent::PeerDisconnected(peer_id));
                        }
                        info!(peer = %peer_id, ?cause, count = book.connection_count(), "connection closed");
                    }

                    SwarmEvent::Behaviour(WeftBehaviourEvent::Identify(
                        identify::Event::Received { peer_id, info, .. },
                    )) => {
                        debug!(peer = %peer_id, agent = %info.agent_version, "identify received");
                        if let Some(role) = behaviour::role_from_agent(&info.agent_version) {
                            book.set_role(&peer_id, role);
                        }
                        for addr in &info.listen_addrs {
                            swarm
                                .behaviour_mut()
                                .kademlia
                                .add_address(&peer_id, addr.clone());
                        }
                        book.add_addresses(&peer_id, info.listen_addrs);
                    }

                    SwarmEvent::Behaviour(WeftBehaviourEvent::Gossipsub(
                        gossipsub::Event::Message { propagation_source, message, .. },
                    )) => {
                        let _ = event_tx.send(NetworkEvent::PubsubMessage {
                            source: propagation_source,
                            data: message.data,
                        });
                    }

                    SwarmEvent::Behaviour(WeftBehaviourEvent::Relay(event)) => {
                        log_relay_server(event);
                    }

                    SwarmEvent::Behaviour(WeftBehaviourEvent::RelayClient(event)) => {
                        log_relay_client(event);
                    }

                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!(%address, "listening on");
                        book.add_listen_addr(address);
                    }

                    SwarmEvent::ExpiredListenAddr { address, .. } => {
                        debug!(%address, "listen address expired");
                        book.remove_listen_addr(&address);
                    }

                    SwarmEvent::ListenerError { error, .. } => {
                        error!(%error, "listener error");
                    }

                    SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                        debug!(peer = ?peer_id, %error, "outgoing connection failed");
                    }

                    _ => {}
                }
            }
        }
    }
    state.running.store(false, Ordering::Relaxed);
}
