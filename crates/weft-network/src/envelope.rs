//! The unit of propagation.

use sha2::{Digest, Sha256};
use tokio::time::Instant;
use weft_core::types::{Hash256, MessageType};

use crate::codec::WireEnvelope;
use crate::transport::Connection;

/// A propagated message with its locally derived metadata.
///
/// Only `kind` and `value` travel on the wire. The hash is recomputed by every
/// receiver and the sender is stamped from the connection a frame arrived on.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: MessageType,
    pub value: Vec<u8>,
    pub hash: Hash256,
    /// Connection this envelope arrived on; `None` when originated locally.
    pub sender: Option<Connection>,
    pub received_at: Instant,
}

impl Envelope {
    /// A locally originated envelope.
    pub fn new(kind: MessageType, value: Vec<u8>) -> Self {
        let hash = content_hash(kind, &value);
        Self {
            kind,
            value,
            hash,
            sender: None,
            received_at: Instant::now(),
        }
    }

    /// An envelope decoded from `connection`, stamped with that sender.
    pub fn received(wire: WireEnvelope, connection: Connection) -> Self {
        let hash = content_hash(wire.kind, &wire.value);
        Self {
            kind: wire.kind,
            value: wire.value,
            hash,
            sender: Some(connection),
            received_at: Instant::now(),
        }
    }

    /// Whether this envelope arrived on `connection`.
    pub fn arrived_on(&self, connection: &Connection) -> bool {
        self.sender.as_ref().is_some_and(|s| s.id == connection.id)
    }

    /// The wire form of this envelope.
    pub fn to_wire(&self) -> WireEnvelope {
        WireEnvelope {
            kind: self.kind,
            value: self.value.clone(),
        }
    }
}

/// SHA-256 over `tag(kind) || len(value) as u64 BE || value`.
pub fn content_hash(kind: MessageType, value: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update([kind.tag()]);
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value);
    Hash256(hasher.finalize().into())
}
