//! Network configuration for the Weft P2P layer.

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::path::PathBuf;
use std::time::Duration;
use weft_core::constants::{
    DEFAULT_LISTEN_ADDR, DEFAULT_NETWORK, DEFAULT_P2P_PORT, HISTORY_SWEEP_INTERVAL,
    MAX_CONNECTIONS, MAX_FRAME_SIZE, MAX_INBOUND_STREAMS, MAX_OUTBOUND_STREAMS,
    MESSAGE_EXPIRATION, MIN_CONNECTION_BYTES, MIN_CONNECTION_SECONDS, PEER_ID_FILE,
    PROTOCOL_NAME, PROTOCOL_PREFIX, PROTOCOL_VERSION, RELAY_CIRCUIT_BYTES,
    RELAY_CIRCUIT_DURATION, RELAY_MAX_CIRCUITS, RELAY_MAX_RESERVATIONS, STREAM_TIMEOUT,
};
use weft_core::types::Role;

/// Settings of the message propagation protocol handler.
#[derive(Debug, Clone)]
pub struct MessagesConfig {
    /// First segment of the protocol identifier.
    pub protocol_prefix: String,
    /// Maximum wait for the next frame on an inbound stream.
    pub read_timeout: Duration,
    /// Maximum time to open a stream and write one frame.
    pub send_timeout: Duration,
    /// Concurrently accepted inbound streams.
    pub max_inbound_streams: usize,
    /// Concurrently open outbound streams.
    pub max_outbound_streams: usize,
    /// Lifetime of a history cache entry.
    pub message_expiration: Duration,
    /// Cadence of the history sweep.
    pub sweep_interval: Duration,
    /// Limited connections below this many remaining seconds are skipped.
    pub min_limit_seconds: u64,
    /// Limited connections below this many remaining bytes are skipped.
    pub min_limit_bytes: u64,
    /// Largest accepted frame payload.
    pub max_frame_size: usize,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            protocol_prefix: PROTOCOL_PREFIX.to_string(),
            read_timeout: STREAM_TIMEOUT,
            send_timeout: STREAM_TIMEOUT,
            max_inbound_streams: MAX_INBOUND_STREAMS,
            max_outbound_streams: MAX_OUTBOUND_STREAMS,
            message_expiration: MESSAGE_EXPIRATION,
            sweep_interval: HISTORY_SWEEP_INTERVAL,
            min_limit_seconds: MIN_CONNECTION_SECONDS,
            min_limit_bytes: MIN_CONNECTION_BYTES,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl MessagesConfig {
    /// The protocol identifier, `/<prefix>/messages/1.0.0`.
    pub fn protocol(&self) -> String {
        format!("/{}/{PROTOCOL_NAME}/{PROTOCOL_VERSION}", self.protocol_prefix)
    }
}

/// Bounds applied by the relay server capability.
#[derive(Debug, Clone)]
pub struct RelayLimits {
    /// Concurrent reservations.
    pub max_reservations: usize,
    /// Concurrent relayed circuits.
    pub max_circuits: usize,
    /// Lifetime of a relayed circuit.
    pub circuit_duration: Duration,
    /// Data quota of a relayed circuit.
    pub circuit_bytes: u64,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_reservations: RELAY_MAX_RESERVATIONS,
            max_circuits: RELAY_MAX_CIRCUITS,
            circuit_duration: RELAY_CIRCUIT_DURATION,
            circuit_bytes: RELAY_CIRCUIT_BYTES,
        }
    }
}

/// Configuration for the P2P network node.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Role this process plays in the mesh.
    pub role: Role,
    /// Network name; selects the identity subdirectory.
    pub network_name: String,
    /// Root directory for the identity file.
    pub data_dir: PathBuf,
    /// Base listen addresses. The port is appended to each verbatim.
    pub listen_addrs: Vec<String>,
    /// TCP port to listen on (`0` picks a free port).
    pub port: u16,
    /// Relay multiaddresses (ending in `/p2p/<peer id>`) a `NODE` listens through.
    pub relay_addrs: Vec<String>,
    /// Peer multiaddresses to dial on startup.
    pub bootstrap_peers: Vec<String>,
    /// Maximum number of established connections.
    pub max_connections: u32,
    /// Gossipsub heartbeat interval.
    pub gossipsub_heartbeat: Duration,
    /// Idle connections are closed after this long.
    pub idle_connection_timeout: Duration,
    /// Relay server bounds (applied when the role is `RELAY`).
    pub relay: RelayLimits,
    /// Message protocol handler settings.
    pub messages: MessagesConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            role: Role::Node,
            network_name: DEFAULT_NETWORK.to_string(),
            data_dir: PathBuf::from("data"),
            listen_addrs: vec![DEFAULT_LISTEN_ADDR.to_string()],
            port: DEFAULT_P2P_PORT,
            relay_addrs: Vec::new(),
            bootstrap_peers: Vec::new(),
            max_connections: MAX_CONNECTIONS,
            gossipsub_heartbeat: Duration::from_secs(1),
            idle_connection_timeout: Duration::from_secs(60),
            relay: RelayLimits::default(),
            messages: MessagesConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Configuration preset for a full node.
    pub fn node() -> Self {
        Self {
            role: Role::Node,
            ..Self::default()
        }
    }

    /// Configuration preset for a relay.
    pub fn relay() -> Self {
        Self {
            role: Role::Relay,
            ..Self::default()
        }
    }

    /// Path of the persisted peer identity: `<data_dir>/<network>/peer-id.bin`.
    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join(&self.network_name).join(PEER_ID_FILE)
    }

    /// Gossipsub topic shared by all peers of this deployment.
    pub fn pubsub_topic(&self) -> String {
        format!("/{}/pubsub/1", self.messages.protocol_prefix)
    }

    /// Build the listen address set.
    ///
    /// Each base address is concatenated with the port. A `NODE` also listens
    /// through every configured relay via its `/p2p-circuit` address.
    pub fn listen_multiaddrs(&self) -> Result<Vec<Multiaddr>, String> {
        let mut addrs = Vec::with_capacity(self.listen_addrs.len() + self.relay_addrs.len());
        for base in &self.listen_addrs {
            let raw = format!("{base}{}", self.port);
            let addr: Multiaddr = raw
                .parse()
                .map_err(|e| format!("invalid listen addr '{raw}': {e}"))?;
            addrs.push(addr);
        }

        if self.role == Role::Node {
            for relay in &self.relay_addrs {
                let addr: Multiaddr = relay
                    .parse()
                    .map_err(|e| format!("invalid relay addr '{relay}': {e}"))?;
                if !matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
                    return Err(format!("relay addr '{relay}' must end with /p2p/<peer id>"));
                }
                addrs.push(addr.with(Protocol::P2pCircuit));
            }
        }

        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;
    use libp2p::PeerId;

    fn relay_addr() -> String {
        let peer = PeerId::from(Keypair::generate_ed25519().public());
        format!("/ip4/10.0.0.1/tcp/6006/p2p/{peer}")
    }

    #[test]
    fn default_protocol_identifier() {
        assert_eq!(MessagesConfig::default().protocol(), "/weft/messages/1.0.0");
    }

    #[test]
    fn custom_prefix_changes_protocol() {
        let cfg = MessagesConfig {
            protocol_prefix: "testnet".into(),
            ..MessagesConfig::default()
        };
        assert_eq!(cfg.protocol(), "/testnet/messages/1.0.0");
    }

    #[test]
    fn default_config_uses_default_port_and_role() {
        let cfg = NetworkConfig::default();
        assert_eq!(cfg.port, DEFAULT_P2P_PORT);
        assert_eq!(cfg.role, Role::Node);
        assert!(cfg.bootstrap_peers.is_empty());
    }

    #[test]
    fn presets_select_role() {
        assert_eq!(NetworkConfig::node().role, Role::Node);
        assert_eq!(NetworkConfig::relay().role, Role::Relay);
    }

    #[test]
    fn identity_path_is_per_network() {
        let cfg = NetworkConfig {
            data_dir: PathBuf::from("/var/weft"),
            network_name: "testnet".into(),
            ..NetworkConfig::default()
        };
        assert_eq!(cfg.identity_path(), PathBuf::from("/var/weft/testnet/peer-id.bin"));
    }

    #[test]
    fn listen_addrs_append_port() {
        let cfg = NetworkConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/".into(), "/ip4/0.0.0.0/tcp/".into()],
            port: 9999,
            ..NetworkConfig::default()
        };
        let addrs = cfg.listen_multiaddrs().unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].to_string(), "/ip4/127.0.0.1/tcp/9999");
        assert_eq!(addrs[1].to_string(), "/ip4/0.0.0.0/tcp/9999");
    }

    #[test]
    fn node_listens_through_relays() {
        let relay = relay_addr();
        let cfg = NetworkConfig {
            relay_addrs: vec![relay.clone()],
            port: 0,
            ..NetworkConfig::node()
        };
        let addrs = cfg.listen_multiaddrs().unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[1].to_string(), format!("{relay}/p2p-circuit"));
    }

    #[test]
    fn relay_role_ignores_relay_addrs() {
        let cfg = NetworkConfig {
            relay_addrs: vec![relay_addr()],
            port: 0,
            ..NetworkConfig::relay()
        };
        let addrs = cfg.listen_multiaddrs().unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(addrs.iter().all(|a| !a.iter().any(|p| p == Protocol::P2pCircuit)));
    }

    #[test]
    fn relay_addr_without_peer_id_rejected() {
        let cfg = NetworkConfig {
            relay_addrs: vec!["/ip4/10.0.0.1/tcp/6006".into()],
            ..NetworkConfig::node()
        };
        let err = cfg.listen_multiaddrs().unwrap_err();
        assert!(err.contains("/p2p/<peer id>"));
    }

    #[test]
    fn invalid_listen_addr_rejected() {
        let cfg = NetworkConfig {
            listen_addrs: vec!["not-an-addr/".into()],
            ..NetworkConfig::default()
        };
        assert!(cfg.listen_multiaddrs().is_err());
    }

    #[test]
    fn pubsub_topic_follows_prefix() {
        assert_eq!(NetworkConfig::default().pubsub_topic(), "/weft/pubsub/1");
    }
}
