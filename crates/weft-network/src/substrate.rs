//! [`Substrate`] implementation backed by `libp2p-stream`.

use async_trait::async_trait;
use libp2p::futures::{future, StreamExt};
use libp2p::{PeerId, StreamProtocol};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, warn};
use weft_core::constants::STREAM_ADMIT_GRACE;
use weft_core::error::NetworkError;

use crate::peer_book::PeerBook;
use crate::service::Command;
use crate::transport::{BoxedStream, Connection, InboundStream, IncomingStreams, Substrate};

/// Stream wrapper holding a concurrency permit until dropped.
struct Permitted<T> {
    inner: T,
    _permit: OwnedSemaphorePermit,
}

impl<T: AsyncRead + Unpin> AsyncRead for Permitted<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Permitted<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Streams and connections of a running swarm.
///
/// Inbound and outbound streams are each bounded by a semaphore. Excess
/// inbound streams are dropped (reset) immediately; excess outbound opens
/// fail with [`NetworkError::SendFailure`]. An inbound stream from a peer the
/// swarm loop has not recorded yet waits up to [`STREAM_ADMIT_GRACE`] for its
/// connection before it is refused.
pub struct Libp2pSubstrate {
    control: libp2p_stream::Control,
    book: Arc<PeerBook>,
    commands: mpsc::UnboundedSender<Command>,
    inbound: Arc<Semaphore>,
    outbound: Arc<Semaphore>,
}

impl Libp2pSubstrate {
    pub(crate) fn new(
        control: libp2p_stream::Control,
        book: Arc<PeerBook>,
        commands: mpsc::UnboundedSender<Command>,
        max_inbound: usize,
        max_outbound: usize,
    ) -> Self {
        Self {
            control,
            book,
            commands,
            inbound: Arc::new(Semaphore::new(max_inbound)),
            outbound: Arc::new(Semaphore::new(max_outbound)),
        }
    }
}

async fn admit(
    book: Arc<PeerBook>,
    permits: Arc<Semaphore>,
    peer: PeerId,
    stream: libp2p::Stream,
) -> Option<InboundStream> {
    let Some(connection) = book.wait_primary(&peer, STREAM_ADMIT_GRACE).await else {
        debug!(%peer, "refusing stream from peer without a known connection");
        return None;
    };
    let Ok(permit) = permits.try_acquire_owned() else {
        warn!(%peer, "inbound stream limit reached, refusing stream");
        return None;
    };
    Some(InboundStream {
        connection,
        stream: Box::new(Permitted {
            inner: stream.compat(),
            _permit: permit,
        }),
    })
}

#[async_trait]
impl Substrate for Libp2pSubstrate {
    async fn handle(&self, protocol: StreamProtocol) -> Result<IncomingStreams, NetworkError> {
        let incoming = self
            .control
            .clone()
            .accept(protocol)
            .map_err(|e| NetworkError::Registration(e.to_string()))?;
        let book = Arc::clone(&self.book);
        let permits = Arc::clone(&self.inbound);
        // Admission waits run side by side so one early stream does not hold
        // up the others.
        let pending = permits.available_permits().max(1);
        Ok(incoming
            .map(move |(peer, stream)| admit(Arc::clone(&book), Arc::clone(&permits), peer, stream))
            .buffer_unordered(pending)
            .filter_map(future::ready)
            .boxed())
    }

    fn connections(&self) -> Vec<Connection> {
        self.book.connections()
    }

    async fn new_stream(
        &self,
        connection: &Connection,
        protocol: StreamProtocol,
    ) -> Result<BoxedStream, NetworkError> {
        let permit = Arc::clone(&self.outbound)
            .try_acquire_owned()
            .map_err(|_| NetworkError::SendFailure("outbound stream limit reached".into()))?;
        let mut control = self.control.clone();
        let stream = control
            .open_stream(connection.peer, protocol)
            .await
            .map_err(|e| NetworkError::SendFailure(e.to_string()))?;
        Ok(Box::new(Permitted {
            inner: stream.compat(),
            _permit: permit,
        }))
    }

    fn close_connection(&self, connection: &Connection) {
        self.book.mark_closing(connection.id);
        if self
            .commands
            .send(Command::CloseConnection(connection.id))
            .is_err()
        {
            debug!(peer = %connection.peer, "swarm stopped before connection close");
        }
    }
}
