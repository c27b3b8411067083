//! Node composition and event loop.
//!
//! The [`Node`] wires the P2P network to record storage: every smart contract
//! propagated through the mesh is persisted locally, and contracts deployed
//! through this node are saved and then flooded to peers.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use weft_core::constants::MAX_FRAME_SIZE;
use weft_core::error::{NetworkError, NodeError, StorageError};
use weft_core::traits::RecordStore;
use weft_core::types::{Hash256, MessageType, SmartContract};
use weft_network::{BroadcastReport, Envelope, NetworkEvent, NetworkNode};

use crate::config::NodeConfig;
use crate::storage::RocksStore;

/// Decode the smart contract carried by `envelope`, if any.
///
/// Returns `None` for other message kinds, undecodable payloads and contracts
/// whose hash does not match their content.
pub fn contract_from_envelope(envelope: &Envelope) -> Option<SmartContract> {
    if envelope.kind != MessageType::SmartContract {
        return None;
    }
    let contract = match decode_contract(&envelope.value) {
        Ok(contract) => contract,
        Err(reason) => {
            warn!(hash = %envelope.hash, %reason, "undecodable smart contract payload");
            return None;
        }
    };
    let expected =
        SmartContract::new(contract.author.clone(), contract.code.clone(), contract.timestamp).hash;
    if expected != contract.hash {
        warn!(hash = %contract.hash, %expected, "smart contract hash mismatch");
        return None;
    }
    Some(contract)
}

/// Decode a contract payload received from a peer.
///
/// Length claims inside the payload are bounded by the frame cap, so a forged
/// length fails instead of allocating. Trailing bytes are rejected.
fn decode_contract(payload: &[u8]) -> Result<SmartContract, String> {
    let config = bincode::config::standard().with_limit::<{ MAX_FRAME_SIZE }>();
    let (contract, read): (SmartContract, usize) =
        bincode::decode_from_slice(payload, config).map_err(|e| e.to_string())?;
    if read != payload.len() {
        return Err(format!("{} trailing bytes", payload.len() - read));
    }
    Ok(contract)
}

/// Persist the contract carried by `envelope`. Returns the stored contract.
pub async fn persist_contract(
    store: &dyn RecordStore<SmartContract>,
    envelope: &Envelope,
) -> Result<Option<SmartContract>, StorageError> {
    let Some(contract) = contract_from_envelope(envelope) else {
        return Ok(None);
    };
    store.save(&contract).await?;
    Ok(Some(contract))
}

/// A running node: network plus contract storage.
pub struct Node {
    network: NetworkNode,
    /// Receiver for network events (behind tokio Mutex for async recv).
    events: Mutex<broadcast::Receiver<NetworkEvent>>,
    contracts: Arc<dyn RecordStore<SmartContract>>,
    config: NodeConfig,
}

impl Node {
    /// Open RocksDB storage and start the network.
    pub async fn new(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        let store = RocksStore::open(config.db_path())?;
        Self::with_store(config, Arc::new(store)).await
    }

    /// Start the network with the given contract store.
    pub async fn with_store(
        config: NodeConfig,
        contracts: Arc<dyn RecordStore<SmartContract>>,
    ) -> Result<Arc<Self>, NodeError> {
        let (network, events) = NetworkNode::start(config.network.clone()).await?;
        info!(peer_id = %network.local_peer_id(), protocol = %network.protocol(), "node started");
        Ok(Arc::new(Self {
            network,
            events: Mutex::new(events),
            contracts,
            config,
        }))
    }

    /// Process network traffic until the network stops.
    ///
    /// Returns an error when the swarm event loop has ended underneath the
    /// node; callers treat that as fatal.
    pub async fn run(self: &Arc<Self>) -> Result<(), NodeError> {
        let mut messages = self.network.messages().subscribe();
        let mut events = self.events.lock().await;

        loop {
            tokio::select! {
                msg = messages.recv() => match msg {
                    Ok(envelope) => self.on_envelope(&envelope).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "lagged behind on messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(NetworkError::SwarmStopped.into());
                    }
                },
                event = events.recv() => match event {
                    Ok(NetworkEvent::PeerConnected(peer)) => info!(%peer, "peer connected"),
                    Ok(NetworkEvent::PeerDisconnected(peer)) => info!(%peer, "peer disconnected"),
                    Ok(NetworkEvent::PubsubMessage { source, data }) => {
                        debug!(%source, size = data.len(), "pubsub message");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "lagged behind on network events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("network event channel closed");
                        return Err(NetworkError::SwarmStopped.into());
                    }
                },
            }
        }
    }

    async fn on_envelope(&self, envelope: &Envelope) {
        debug!(hash = %envelope.hash, kind = ?envelope.kind, "message delivered");
        match persist_contract(self.contracts.as_ref(), envelope).await {
            Ok(Some(contract)) => info!(hash = %contract.hash, author = %contract.author, "stored smart contract"),
            Ok(None) => {}
            Err(e) => error!(hash = %envelope.hash, error = %e, "failed to store smart contract"),
        }
    }

    /// Flood a message originated by this node.
    pub async fn publish(&self, kind: MessageType, value: Vec<u8>) -> BroadcastReport {
        self.network.messages().publish(kind, value).await
    }

    /// Save a new contract locally, then flood it.
    pub async fn deploy_contract(
        &self,
        author: impl Into<String>,
        code: Vec<u8>,
    ) -> Result<(SmartContract, BroadcastReport), NodeError> {
        let contract = SmartContract::new(author, code, chrono::Utc::now().timestamp());
        self.contracts.save(&contract).await?;
        let payload = bincode::encode_to_vec(&contract, bincode::config::standard())
            .map_err(|e| StorageError::Encode(e.to_string()))?;
        let report = self.publish(MessageType::SmartContract, payload).await;
        info!(hash = %contract.hash, ?report, "deployed smart contract");
        Ok((contract, report))
    }

    pub async fn get_contract(&self, id: &Hash256) -> Result<Option<SmartContract>, NodeError> {
        Ok(self.contracts.get(id).await?)
    }

    pub fn network(&self) -> &NetworkNode {
        &self.network
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Stop the messages service and the swarm.
    pub async fn shutdown(&self) {
        self.network.shutdown().await;
    }
}
