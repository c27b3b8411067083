//! Integration test suite for Weft message propagation.
//!
//! [`helpers::MemoryMesh`] wires any number of [`weft_network::MessagesService`]
//! instances together over in-process duplex pipes, with per-peer fault
//! injection. The suites in `tests/` drive deduplication, broadcast and
//! stream handling through it, plus a small set of real libp2p scenarios.

pub mod helpers;
