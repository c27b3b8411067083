//! # weft-network: message propagation over libp2p.
//!
//! Nodes exchange length-delimited envelopes on a dedicated stream protocol.
//! Every new envelope is delivered locally once and flooded to all other
//! connections; a time-bounded history suppresses duplicates.
//!
//! The main entry point is [`NetworkNode::start`], which composes the swarm
//! for the configured [`Role`](weft_core::types::Role) and starts the
//! [`MessagesService`] on top of it. The service itself only depends on the
//! [`Substrate`] trait and can run over any stream transport.

pub mod behaviour;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod history;
pub mod identity;
pub mod messages;
pub mod peer_book;
pub mod service;
pub mod substrate;
pub mod transport;

pub use codec::{EnvelopeCodec, WireEnvelope};
pub use config::{MessagesConfig, NetworkConfig, RelayLimits};
pub use envelope::Envelope;
pub use history::MessageHistory;
pub use messages::{BroadcastReport, MessagesService};
pub use service::{NetworkEvent, NetworkNode};
pub use transport::{
    BoxedStream, Connection, ConnectionStatus, InboundStream, IncomingStreams, ResourceLimits,
    Substrate,
};
