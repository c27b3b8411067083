//! Protocol constants. Durations are wall-clock; sizes are in bytes.

use std::time::Duration;

/// Default prefix of every Weft protocol identifier.
pub const PROTOCOL_PREFIX: &str = "weft";

/// Name segment of the message propagation protocol.
pub const PROTOCOL_NAME: &str = "messages";

/// Version segment of the message propagation protocol.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Default TCP port for P2P connections.
pub const DEFAULT_P2P_PORT: u16 = 6006;

/// Base listen address; the port is appended verbatim.
pub const DEFAULT_LISTEN_ADDR: &str = "/ip4/0.0.0.0/tcp/";

/// Default network name. Selects the identity and storage subdirectory.
pub const DEFAULT_NETWORK: &str = "mainnet";

/// File name of the persisted peer identity inside the network directory.
pub const PEER_ID_FILE: &str = "peer-id.bin";

/// Per-read timeout on inbound streams and per-send timeout on outbound streams.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum concurrently accepted inbound message streams.
pub const MAX_INBOUND_STREAMS: usize = 32;

/// How long an inbound stream waits for its connection to be recorded.
pub const STREAM_ADMIT_GRACE: Duration = Duration::from_secs(2);

/// Maximum concurrently open outbound message streams.
pub const MAX_OUTBOUND_STREAMS: usize = 64;

/// How long a message hash stays in the history cache after receipt.
pub const MESSAGE_EXPIRATION: Duration = Duration::from_secs(60);

/// Cadence of the history cache sweep.
pub const HISTORY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Limited connections with fewer remaining seconds are not used for broadcast.
pub const MIN_CONNECTION_SECONDS: u64 = 10_000;

/// Limited connections with fewer remaining bytes are not used for broadcast.
pub const MIN_CONNECTION_BYTES: u64 = 10_000;

/// Maximum encoded envelope size carried by a single frame.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Maximum simultaneous connections held by the swarm.
pub const MAX_CONNECTIONS: u32 = 128;

/// Relay server: maximum concurrent reservations.
pub const RELAY_MAX_RESERVATIONS: usize = 128;

/// Relay server: maximum concurrent relayed circuits.
pub const RELAY_MAX_CIRCUITS: usize = 128;

/// Relay server: lifetime of one relayed circuit.
pub const RELAY_CIRCUIT_DURATION: Duration = Duration::from_secs(600);

/// Relay server: data quota of one relayed circuit.
pub const RELAY_CIRCUIT_BYTES: u64 = 1 << 24;

/// Capacity of the local event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_limits_match_relay_quota_ordering() {
        // A default relayed circuit must fall below the broadcast threshold.
        assert!(RELAY_CIRCUIT_DURATION.as_secs() < MIN_CONNECTION_SECONDS);
        assert!(RELAY_CIRCUIT_BYTES > MIN_CONNECTION_BYTES);
    }

    #[test]
    fn sweep_runs_inside_expiration_window() {
        assert!(HISTORY_SWEEP_INTERVAL < MESSAGE_EXPIRATION);
    }

    #[test]
    fn listen_addr_expects_port_suffix() {
        assert!(DEFAULT_LISTEN_ADDR.ends_with('/'));
    }
}
