//! Core types: hashes, message kinds, node roles and stored records.

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::traits::Record;

/// A 32-byte SHA-256 content identity of envelopes and stored records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub struct Hash256(pub [u8; 32]);

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

/// Discriminator of a propagated message. The payload itself is opaque.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub enum MessageType {
    /// A ledger transaction.
    Transaction,
    /// A ledger block.
    Block,
    /// A smart contract deployment; the payload is a bincode [`SmartContract`].
    SmartContract,
    /// A peer announcing itself or its addresses.
    PeerAnnouncement,
}

impl MessageType {
    /// Stable one-byte tag, part of the content hash.
    pub fn tag(&self) -> u8 {
        match self {
            MessageType::Transaction => 0,
            MessageType::Block => 1,
            MessageType::SmartContract => 2,
            MessageType::PeerAnnouncement => 3,
        }
    }
}

/// The role a node plays in the mesh. Fixed for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// A full node; also listens through relays when directly unreachable.
    #[default]
    Node,
    /// A connectivity helper that additionally serves relay reservations.
    Relay,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Node => f.write_str("NODE"),
            Role::Relay => f.write_str("RELAY"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown role: {0} (expected NODE or RELAY)")]
pub struct ParseRoleError(pub String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NODE" => Ok(Role::Node),
            "RELAY" => Ok(Role::Relay),
            _ => Err(ParseRoleError(s.to_string())),
        }
    }
}

/// A deployed smart contract as persisted by the node.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SmartContract {
    /// Content hash over author, code and timestamp.
    pub hash: Hash256,
    /// Free-form author identifier.
    pub author: String,
    /// Contract code, opaque to the node.
    pub code: Vec<u8>,
    /// Unix timestamp (seconds) of deployment.
    pub timestamp: i64,
}

impl SmartContract {
    /// Build a contract and derive its content hash.
    pub fn new(author: impl Into<String>, code: Vec<u8>, timestamp: i64) -> Self {
        let author = author.into();
        let mut hasher = Sha256::new();
        hasher.update(author.as_bytes());
        hasher.update((code.len() as u64).to_be_bytes());
        hasher.update(&code);
        hasher.update(timestamp.to_be_bytes());
        Self {
            hash: Hash256(hasher.finalize().into()),
            author,
            code,
            timestamp,
        }
    }
}

impl Record for SmartContract {
    const NAMESPACE: &'static str = "smartContract";

    fn id(&self) -> Hash256 {
        self.hash
    }
}
