//! Composite libp2p [`NetworkBehaviour`] and role-driven swarm composition.
//!
//! Every node carries the relay client transport, gossipsub, identify,
//! Kademlia peer routing, raw streams for the message protocol and a
//! connection cap. A `RELAY` additionally serves relay reservations.

use libp2p::identity::Keypair;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{
    connection_limits, gossipsub, identify, kad, noise, relay, tcp, yamux, Multiaddr, PeerId,
    StreamProtocol, Swarm, SwarmBuilder,
};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::info;
use weft_core::error::StartupError;
use weft_core::types::Role;

use crate::config::{NetworkConfig, RelayLimits};
use crate::identity::load_or_create_keypair;

/// Composite network behaviour combining all Weft sub-protocols.
#[derive(NetworkBehaviour)]
pub struct WeftBehaviour {
    /// Dialing and listening through relays.
    pub relay_client: relay::client::Behaviour,
    /// Relay server, enabled only for the `RELAY` role.
    pub relay: Toggle<relay::Behaviour>,
    /// Pubsub topic shared by the deployment.
    pub gossipsub: gossipsub::Behaviour,
    /// Peer handshake and address exchange.
    pub identify: identify::Behaviour,
    /// Kademlia DHT for peer routing.
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    /// Raw streams carrying the message protocol.
    pub stream: libp2p_stream::Behaviour,
    /// Established connection cap.
    pub limits: connection_limits::Behaviour,
}

/// A composed, not yet listening swarm.
pub struct Composed {
    pub swarm: Swarm<WeftBehaviour>,
    pub listen_addrs: Vec<Multiaddr>,
    pub control: libp2p_stream::Control,
    pub local_peer_id: PeerId,
}

/// Identify protocol version for the given prefix.
pub fn identify_protocol(prefix: &str) -> String {
    format!("/{prefix}/1.0.0")
}

/// Identify agent string advertising this node's role, `weft/<version>/<ROLE>`.
pub fn agent_version(role: Role) -> String {
    format!("weft/{}/{role}", env!("CARGO_PKG_VERSION"))
}

/// Role advertised in a remote identify agent string, if it is a Weft agent.
pub fn role_from_agent(agent: &str) -> Option<Role> {
    let rest = agent.strip_prefix("weft/")?;
    rest.rsplit('/').next()?.parse().ok()
}

/// Kademlia protocol name for the given prefix.
pub fn kad_protocol(prefix: &str) -> String {
    format!("/{prefix}/kad/1.0.0")
}

/// Build a gossipsub behaviour with content-addressed message IDs.
///
/// Messages are signed with the node identity and flood-published.
pub fn build_gossipsub(
    keypair: &Keypair,
    heartbeat: Duration,
    max_transmit_size: usize,
) -> Result<gossipsub::Behaviour, String> {
    let message_id_fn = |message: &gossipsub::Message| {
        let hash = Sha256::digest(&message.data);
        gossipsub::MessageId::from(hash.to_vec())
    };

    let config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(heartbeat)
        .validation_mode(gossipsub::ValidationMode::Strict)
        .max_transmit_size(max_transmit_size)
        .flood_publish(true)
        .message_id_fn(message_id_fn)
        .build()
        .map_err(|e| format!("gossipsub config error: {e}"))?;

    gossipsub::Behaviour::new(gossipsub::MessageAuthenticity::Signed(keypair.clone()), config)
        .map_err(|e| format!("gossipsub behaviour error: {e}"))
}

pub fn relay_server_config(limits: &RelayLimits) -> relay::Config {
    relay::Config {
        max_reservations: limits.max_reservations,
        max_circuits: limits.max_circuits,
        max_circuit_duration: limits.circuit_duration,
        max_circuit_bytes: limits.circuit_bytes,
        ..Default::default()
    }
}

/// Compose the swarm for the configured role.
///
/// The identity is loaded first; a failure there is reported as
/// [`StartupError::IdentityLoad`]. Every later failure is a
/// [`StartupError::Composition`].
pub fn compose(config: &NetworkConfig) -> Result<Composed, StartupError> {
    let keypair = load_or_create_keypair(&config.identity_path())?;
    let local_peer_id = PeerId::from(keypair.public());

    let listen_addrs = config.listen_multiaddrs().map_err(StartupError::Composition)?;
    let prefix = &config.messages.protocol_prefix;

    let gossipsub = build_gossipsub(
        &keypair,
        config.gossipsub_heartbeat,
        config.messages.max_frame_size,
    )
    .map_err(StartupError::Composition)?;

    let kad_protocol = StreamProtocol::try_from_owned(kad_protocol(prefix))
        .map_err(|e| StartupError::Composition(format!("invalid kad protocol: {e}")))?;
    let kademlia = kad::Behaviour::with_config(
        local_peer_id,
        kad::store::MemoryStore::new(local_peer_id),
        kad::Config::new(kad_protocol),
    );

    let identify = identify::Behaviour::new(
        identify::Config::new(identify_protocol(prefix), keypair.public())
            .with_agent_version(agent_version(config.role))
            .with_push_listen_addr_updates(true),
    );

    let relay = match config.role {
        Role::Relay => Some(relay::Behaviour::new(
            local_peer_id,
            relay_server_config(&config.relay),
        )),
        Role::Node => None,
    };

    let stream = libp2p_stream::Behaviour::new();
    let control = stream.new_control();

    let limits = connection_limits::Behaviour::new(
        connection_limits::ConnectionLimits::default()
            .with_max_established(Some(config.max_connections)),
    );

    let idle_timeout = config.idle_connection_timeout;
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)
        .map_err(|e| StartupError::Composition(format!("TCP transport error: {e}")))?
        .with_dns()
        .map_err(|e| StartupError::Composition(format!("DNS transport error: {e}")))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| StartupError::Composition(format!("relay transport error: {e}")))?
        .with_behaviour(|_, relay_client| {
            Ok(WeftBehaviour {
                relay_client,
                relay: relay.into(),
                gossipsub,
                identify,
                kademlia,
                stream,
                limits,
            })
        })
        .map_err(|e| StartupError::Composition(format!("behaviour error: {e}")))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
        .build();

    info!(%local_peer_id, role = %config.role, "composed swarm");

    Ok(Composed {
        swarm,
        listen_addrs,
        control,
        local_peer_id,
    })
}
