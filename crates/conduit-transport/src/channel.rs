//! Per-connection I/O driver.
//!
//! One task per stream connection runs [`run_channel`]: it reads and
//! decodes frames, hands messages to the callback executor, and writes
//! queued outbound frames. A framing violation closes only that connection.

use crate::error::TransportError;
use crate::shared::ConnectorCore;
use bytes::{Bytes, BytesMut};
use conduit_core::{AsyncHandle, CompletionHandle, Endpoint, FrameError, RawMessage, SharedHandle};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Initial read buffer capacity
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on a graceful stream shutdown (TLS close_notify, FIN)
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one accepted or established connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frame queued for writing plus the handle settled once it is written
pub(crate) struct Outbound {
    frame: Bytes,
    done: Arc<CompletionHandle>,
}

/// Sending side of a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: Endpoint,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub(crate) fn new(peer: Endpoint) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: ConnectionId::next(),
            peer,
            outbound,
        };
        (handle, rx)
    }

    /// Connection identifier
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote endpoint
    pub fn peer(&self) -> &Endpoint {
        &self.peer
    }

    /// Whether the driver has exited
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Queue an already framed payload.
    ///
    /// The returned handle completes once the frame is flushed to the
    /// socket. Cancelling it before the driver reaches the frame skips the
    /// write.
    pub(crate) fn send(&self, frame: Bytes) -> Result<SharedHandle, TransportError> {
        let done = CompletionHandle::pending();
        self.outbound
            .send(Outbound {
                frame,
                done: Arc::clone(&done),
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(done)
    }
}

/// Why a connection driver stopped
#[derive(Debug)]
pub(crate) enum ChannelExit {
    /// Connector shutdown requested
    Shutdown,
    /// Peer closed its side
    PeerClosed,
    /// Peer violated the framing
    Frame(FrameError),
    /// Socket error
    Io(io::Error),
}

impl fmt::Display for ChannelExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("shutdown"),
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::Frame(e) => write!(f, "{}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

/// Resolves once shutdown is requested or the connector's signal is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Drive one connection until shutdown, peer close, or error.
pub(crate) async fn run_channel<S>(
    mut stream: S,
    peer: &Endpoint,
    core: &ConnectorCore,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) -> ChannelExit
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let exit = loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break ChannelExit::Shutdown,
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) => break ChannelExit::PeerClosed,
                Ok(n) => {
                    trace!(peer = %peer, bytes = n, "Read");
                    if let Err(e) = decode_frames(&mut buf, peer, core) {
                        warn!(peer = %peer, "Closing connection: {}", e);
                        core.stats.record_recv_error();
                        break ChannelExit::Frame(e);
                    }
                }
                Err(e) => {
                    core.stats.record_recv_error();
                    break ChannelExit::Io(e);
                }
            },
            Some(out) = outbound.recv() => {
                if out.done.is_cancelled() {
                    continue;
                }
                let len = out.frame.len();
                match write_frame(&mut stream, &out.frame).await {
                    Ok(()) => {
                        trace!(peer = %peer, len, "Wrote frame");
                        core.stats.record_send(len);
                        out.done.complete();
                    }
                    Err(e) => {
                        core.stats.record_send_error();
                        out.done.fail(&e);
                        break ChannelExit::Io(e);
                    }
                }
            }
        }
    };

    reject_queued(outbound);

    if !matches!(exit, ChannelExit::Io(_)) {
        match tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = %peer, "Stream shutdown failed: {}", e),
            Err(_) => debug!(peer = %peer, "Stream shutdown timed out"),
        }
    }

    exit
}

/// Close the queue and fail every frame still waiting in it.
///
/// Later sends on the connection's handle see [`TransportError::Closed`].
pub(crate) fn reject_queued(mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    outbound.close();
    while let Ok(out) = outbound.try_recv() {
        out.done.fail(TransportError::Closed);
    }
}

fn decode_frames(
    buf: &mut BytesMut,
    peer: &Endpoint,
    core: &ConnectorCore,
) -> Result<(), FrameError> {
    while let Some(payload) = core.codec.decode(buf)? {
        trace!(peer = %peer, len = payload.len(), "Decoded frame");
        core.deliver(RawMessage::new(payload, peer.clone()));
    }
    Ok(())
}

async fn write_frame<S>(stream: &mut S, frame: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await
}
