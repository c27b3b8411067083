//! Stream protocol handler and broadcast sender.
//!
//! The [`MessagesService`] registers the message protocol with a [`Substrate`],
//! reads envelopes from every inbound stream, drops those already in the
//! [`MessageHistory`], hands new ones to local subscribers and floods them to
//! every other connection. Each outbound send uses a fresh stream carrying a
//! single frame.

use libp2p::futures::future::join_all;
use libp2p::futures::{SinkExt, StreamExt};
use libp2p::StreamProtocol;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use weft_core::constants::EVENT_CHANNEL_CAPACITY;
use weft_core::error::NetworkError;
use weft_core::types::MessageType;

use crate::codec::{EnvelopeCodec, WireEnvelope};
use crate::config::MessagesConfig;
use crate::envelope::Envelope;
use crate::history::MessageHistory;
use crate::transport::{Connection, InboundStream, IncomingStreams, Substrate};

/// Per-connection tally of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections that received the frame.
    pub sent: usize,
    /// Connections rejected as ineligible (closing or nearly exhausted).
    pub skipped: usize,
    /// Connections where opening or writing the stream failed or timed out.
    pub failed: usize,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.sent + self.skipped + self.failed
    }
}

/// How an inbound read loop ended.
#[derive(Debug)]
enum StreamOutcome {
    Finished,
    TimedOut,
    Failed(NetworkError),
}

struct Tasks {
    shutdown: CancellationToken,
    accept: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

struct Inner {
    protocol: StreamProtocol,
    config: MessagesConfig,
    substrate: Arc<dyn Substrate>,
    history: Arc<MessageHistory>,
    events: broadcast::Sender<Envelope>,
    started: AtomicBool,
}

/// Flood-propagation protocol handler bound to one substrate.
pub struct MessagesService {
    inner: Arc<Inner>,
    tasks: Mutex<Option<Tasks>>,
}

impl std::fmt::Debug for MessagesService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagesService")
            .field("protocol", &self.inner.protocol)
            .field("started", &self.is_started())
            .field("history", &self.inner.history.len())
            .finish()
    }
}

impl MessagesService {
    /// Create a stopped service. Fails if the configured prefix does not form
    /// a valid protocol identifier.
    pub fn new(substrate: Arc<dyn Substrate>, config: MessagesConfig) -> Result<Self, NetworkError> {
        let protocol = StreamProtocol::try_from_owned(config.protocol())
            .map_err(|e| NetworkError::Registration(format!("invalid protocol id: {e}")))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let history = Arc::new(MessageHistory::new(config.message_expiration));
        Ok(Self {
            inner: Arc::new(Inner {
                protocol,
                config,
                substrate,
                history,
                events,
                started: AtomicBool::new(false),
            }),
            tasks: Mutex::new(None),
        })
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.inner.protocol
    }

    pub fn history(&self) -> &Arc<MessageHistory> {
        &self.inner.history
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Receive every new (non-duplicate) envelope decoded from the network.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.events.subscribe()
    }

    /// Register the protocol and start accepting streams and sweeping history.
    ///
    /// Calling `start` on a running service is a no-op.
    pub async fn start(&self) -> Result<(), NetworkError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Ok(());
        }

        let incoming = self.inner.substrate.handle(self.inner.protocol.clone()).await?;
        let shutdown = CancellationToken::new();
        let accept = tokio::spawn(accept_loop(
            Arc::clone(&self.inner),
            incoming,
            shutdown.clone(),
        ));
        let sweeper = self
            .inner
            .history
            .spawn_sweeper(self.inner.config.sweep_interval, shutdown.clone());

        *tasks = Some(Tasks {
            shutdown,
            accept,
            sweeper,
        });
        self.inner.started.store(true, Ordering::Release);
        info!(protocol = %self.inner.protocol, "messages service started");
        Ok(())
    }

    /// Unregister the protocol and stop the sweeper.
    ///
    /// Streams already being read run to completion.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        tasks.shutdown.cancel();
        for (name, handle) in [("accept loop", tasks.accept), ("history sweeper", tasks.sweeper)] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "messages task ended abnormally");
            }
        }
        self.inner.started.store(false, Ordering::Release);
        info!(protocol = %self.inner.protocol, "messages service stopped");
    }

    /// Flood `envelope` to every eligible connection except the one it
    /// arrived on.
    pub async fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        self.inner.broadcast(envelope).await
    }

    /// Originate a message locally: record it so echoes are dropped, then
    /// flood it. Content already in the history is not sent again.
    pub async fn publish(&self, kind: MessageType, value: Vec<u8>) -> BroadcastReport {
        let envelope = Envelope::new(kind, value);
        if !self.inner.history.record(&envelope) {
            debug!(hash = %envelope.hash, "message already propagated, not publishing");
            return BroadcastReport::default();
        }
        self.inner.broadcast(&envelope).await
    }
}

impl Drop for MessagesService {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            tasks.shutdown.cancel();
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, mut incoming: IncomingStreams, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = incoming.next() => {
                let Some(inbound) = next else {
                    warn!(protocol = %inner.protocol, "substrate closed inbound stream registration");
                    break;
                };
                let inner = Arc::clone(&inner);
                tokio::spawn(async move { inner.read_stream(inbound).await });
            }
        }
    }
    // Dropping `incoming` releases the registration.
    drop(incoming);
    debug!(protocol = %inner.protocol, "accept loop finished");
}

impl Inner {
    async fn read_stream(self: Arc<Self>, inbound: InboundStream) {
        let InboundStream { connection, stream } = inbound;
        let peer = connection.peer;
        trace!(%peer, connection = ?connection.id, "inbound stream opened");

        let mut frames = FramedRead::new(stream, EnvelopeCodec::new(self.config.max_frame_size));
        let outcome = loop {
            match tokio::time::timeout(self.config.read_timeout, frames.next()).await {
                Err(_) => break StreamOutcome::TimedOut,
                Ok(None) => break StreamOutcome::Finished,
                Ok(Some(Err(e))) => break StreamOutcome::Failed(e),
                Ok(Some(Ok(wire))) => self.accept(Envelope::received(wire, connection.clone())),
            }
        };

        match outcome {
            StreamOutcome::Finished => trace!(%peer, "inbound stream finished"),
            StreamOutcome::TimedOut => {
                warn!(%peer, error = %NetworkError::StreamTimeout, "closing idle inbound stream")
            }
            StreamOutcome::Failed(e) => error!(%peer, error = %e, "inbound stream aborted"),
        }

        let mut stream = frames.into_inner();
        if let Err(e) = stream.shutdown().await {
            trace!(%peer, error = %e, "inbound stream shutdown failed");
        }
    }

    fn accept(self: &Arc<Self>, envelope: Envelope) {
        if !self.history.record(&envelope) {
            debug!(hash = %envelope.hash, kind = ?envelope.kind, "dropping duplicate message");
            return;
        }
        debug!(
            hash = %envelope.hash,
            kind = ?envelope.kind,
            size = envelope.value.len(),
            "received new message"
        );

        // No subscribers is fine.
        let _ = self.events.send(envelope.clone());

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let report = inner.broadcast(&envelope).await;
            debug!(hash = %envelope.hash, ?report, "relayed message");
        });
    }

    async fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        let targets: Vec<Connection> = self
            .substrate
            .connections()
            .into_iter()
            .filter(|c| !envelope.arrived_on(c))
            .collect();
        let wire = envelope.to_wire();
        let results = join_all(targets.iter().map(|c| self.send_to(c, wire.clone()))).await;

        let mut report = BroadcastReport::default();
        for (connection, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.sent += 1,
                Err(NetworkError::ConnectionIneligible(reason)) => {
                    debug!(peer = %connection.peer, %reason, "skipping connection");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(peer = %connection.peer, hash = %envelope.hash, error = %e, "send failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn send_to(&self, connection: &Connection, wire: WireEnvelope) -> Result<(), NetworkError> {
        connection.check_eligible(self.config.min_limit_seconds, self.config.min_limit_bytes)?;

        let send = async {
            let stream = self
                .substrate
                .new_stream(connection, self.protocol.clone())
                .await?;
            let mut frames = FramedWrite::new(stream, EnvelopeCodec::new(self.config.max_frame_size));
            frames.send(wire).await?;
            frames.close().await?;
            Ok::<(), NetworkError>(())
        };

        match tokio::time::timeout(self.config.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => {
                self.substrate.close_connection(connection);
                Err(NetworkError::SendTimeout)
            }
        }
    }
}
