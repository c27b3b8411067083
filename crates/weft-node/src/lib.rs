//! # weft-node: node composition, configuration and storage.
//!
//! Composes the Weft subsystems into a running node:
//! - [`storage::RocksStore`] / [`storage::MemoryStore`]: record persistence
//! - [`node::Node`]: event loop wiring the network to contract storage
//! - [`config::NodeConfig`]: layered node configuration

pub mod config;
pub mod node;
pub mod storage;

pub use config::NodeConfig;
pub use node::Node;
pub use storage::{MemoryStore, RocksStore};
