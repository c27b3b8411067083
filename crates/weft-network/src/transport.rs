//! The seam between the messages service and the peer-to-peer substrate.
//!
//! The substrate owns connections and multiplexed streams. The messages
//! service only reads connection snapshots, registers for inbound streams on
//! its protocol and asks for fresh outbound streams. [`crate::substrate`]
//! implements this over libp2p; tests use an in-memory mesh.

use async_trait::async_trait;
use libp2p::futures::stream::BoxStream;
use libp2p::swarm::ConnectionId;
use libp2p::{PeerId, StreamProtocol};
use tokio::io::{AsyncRead, AsyncWrite};
use weft_core::error::NetworkError;

/// Lifecycle of a connection as reported by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Open,
    Closing,
    Closed,
}

/// Remaining budget of a limited (relayed) connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceLimits {
    /// Seconds left before the substrate reclaims the connection.
    pub seconds: Option<u64>,
    /// Bytes left before the substrate reclaims the connection.
    pub bytes: Option<u64>,
}

/// Snapshot of a live transport session to one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub peer: PeerId,
    pub status: ConnectionStatus,
    /// Present only for limited sessions.
    pub limits: Option<ResourceLimits>,
}

impl Connection {
    /// An unlimited, open connection.
    pub fn open(id: ConnectionId, peer: PeerId) -> Self {
        Self {
            id,
            peer,
            status: ConnectionStatus::Open,
            limits: None,
        }
    }

    /// Check whether this connection may carry a broadcast stream.
    ///
    /// Connections that are not open, or whose limits fall below the given
    /// minimums, are about to be reclaimed and are rejected.
    pub fn check_eligible(&self, min_seconds: u64, min_bytes: u64) -> Result<(), NetworkError> {
        if self.status != ConnectionStatus::Open {
            return Err(NetworkError::ConnectionIneligible(format!(
                "connection is {:?}",
                self.status
            )));
        }
        if let Some(limits) = &self.limits {
            if let Some(seconds) = limits.seconds.filter(|s| *s < min_seconds) {
                return Err(NetworkError::ConnectionIneligible(format!(
                    "{seconds}s remaining, below {min_seconds}s"
                )));
            }
            if let Some(bytes) = limits.bytes.filter(|b| *b < min_bytes) {
                return Err(NetworkError::ConnectionIneligible(format!(
                    "{bytes} bytes remaining, below {min_bytes}"
                )));
            }
        }
        Ok(())
    }
}

/// Byte stream usable by the codec.
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

pub type BoxedStream = Box<dyn StreamIo>;

/// An inbound stream together with the connection it was opened on.
pub struct InboundStream {
    pub connection: Connection,
    pub stream: BoxedStream,
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Inbound streams for one registered protocol. Dropping it unregisters.
pub type IncomingStreams = BoxStream<'static, InboundStream>;

/// Transport substrate used by the messages service.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Register `protocol` and receive its inbound streams.
    async fn handle(&self, protocol: StreamProtocol) -> Result<IncomingStreams, NetworkError>;

    /// Snapshot of the currently known connections.
    fn connections(&self) -> Vec<Connection>;

    /// Open a fresh outbound stream on `connection` under `protocol`.
    async fn new_stream(
        &self,
        connection: &Connection,
        protocol: StreamProtocol,
    ) -> Result<BoxedStream, NetworkError>;

    /// Ask the substrate to close `connection`. Redialing is its own decision.
    fn close_connection(&self, connection: &Connection);
}
