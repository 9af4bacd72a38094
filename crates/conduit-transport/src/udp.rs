//! Connectionless UDP node.
//!
//! One datagram carries one message, so there is no stream framing, no
//! connection state, and no registry: every datagram is addressed by its
//! own endpoint. An optional [`DatagramSecurity`] layer seals outbound and
//! opens inbound datagrams.

use crate::channel::stopped;
use crate::config::{ConnectionConfig, Security};
use crate::connector::{Connector, MessageReceiver};
use crate::error::TransportError;
use crate::shared::{ConnectorCore, drain_runtime};
use crate::stats::TransportStats;
use bytes::Bytes;
use conduit_core::{
    AsyncHandle, CompleteOnDrop, CompletionHandle, CompositeHandle, Endpoint, FrameError,
    RawMessage, SharedHandle,
};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{UdpSocket, lookup_host};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Receive buffer size (largest possible datagram)
const RECV_BUFFER_SIZE: usize = 65_536;

/// Datagram security layer (for example DTLS) supplied by the caller.
///
/// The node never interprets sealed bytes; it only hands them to the socket.
pub trait DatagramSecurity: Send + Sync {
    /// Protect an outbound payload for `peer`.
    ///
    /// # Errors
    ///
    /// Returned to the caller of `send`; nothing is transmitted.
    fn seal(&self, peer: &Endpoint, payload: &[u8]) -> Result<Bytes, TransportError>;

    /// Recover the payload of a datagram received from `peer`.
    ///
    /// # Errors
    ///
    /// The datagram is dropped and counted as a receive error.
    fn open(&self, peer: &Endpoint, datagram: &[u8]) -> Result<Bytes, TransportError>;
}

struct Datagram {
    payload: Bytes,
    peer: Endpoint,
    done: Arc<CompletionHandle>,
}

struct Link {
    outbound: mpsc::UnboundedSender<Datagram>,
    local: Endpoint,
}

struct NodeInner {
    bind: Endpoint,
    security: Option<Arc<dyn DatagramSecurity>>,
    max_payload: usize,
    core: ConnectorCore,
    link: Mutex<Option<Link>>,
}

struct Session {
    runtime: Runtime,
    shutdown: watch::Sender<bool>,
    closed: Arc<CompletionHandle>,
}

#[derive(Default)]
struct Lifecycle {
    session: Option<Session>,
    draining: Option<Arc<CompletionHandle>>,
}

/// UDP node bound to a local endpoint, sending to and receiving from any peer.
pub struct UdpNodeConnector {
    inner: Arc<NodeInner>,
    lifecycle: Mutex<Lifecycle>,
}

impl UdpNodeConnector {
    pub(crate) fn new(
        config: &ConnectionConfig,
        receiver: Option<Arc<dyn MessageReceiver>>,
    ) -> Result<Self, TransportError> {
        let security = match &config.security {
            Security::None => None,
            Security::Dtls(layer) => Some(Arc::clone(layer)),
            Security::Tls(_) => {
                return Err(TransportError::configuration("UDP does not support TLS"));
            }
        };
        let core = ConnectorCore::new(config, None, receiver)?;
        Ok(Self {
            inner: Arc::new(NodeInner {
                bind: config.endpoint.clone(),
                security,
                max_payload: config.max_frame_size.min(MAX_DATAGRAM_SIZE),
                core,
                link: Mutex::new(None),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Traffic counters
    pub fn stats(&self) -> TransportStats {
        self.inner.core.stats.snapshot()
    }

    /// Whether the socket is bound
    pub fn is_bound(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    /// Whether a datagram security layer is installed
    pub fn is_secure(&self) -> bool {
        self.inner.security.is_some()
    }
}

impl Connector for UdpNodeConnector {
    /// Bind the socket and start receiving; the handle completes once bound.
    fn start(&self) -> Result<SharedHandle, TransportError> {
        let inner = &self.inner;
        inner.core.ensure_live()?;

        let mut lifecycle = self.lifecycle.lock();
        if let Some(session) = &lifecycle.session {
            if !session.closed.is_done() {
                return Err(TransportError::AlreadyStarted);
            }
        }
        if lifecycle.draining.as_ref().is_some_and(|d| !d.is_done()) {
            return Err(TransportError::AlreadyStarted);
        }
        if let Some(stale) = lifecycle.session.take() {
            stale.runtime.shutdown_background();
        }

        let runtime = inner.core.io_runtime("conduit-udp")?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let bound = CompletionHandle::pending();
        let closed = CompletionHandle::pending();

        runtime.spawn(Arc::clone(inner).run(
            Arc::clone(&bound),
            CompleteOnDrop::new(Arc::clone(&closed)),
            shutdown_rx,
        ));

        lifecycle.session = Some(Session {
            runtime,
            shutdown,
            closed,
        });
        lifecycle.draining = None;
        Ok(bound)
    }

    /// Close the socket; returns `Composite[socket closed, runtime drained]`.
    fn stop(&self) -> SharedHandle {
        let drained = CompletionHandle::pending();
        let session = {
            let mut lifecycle = self.lifecycle.lock();
            let Some(session) = lifecycle.session.take() else {
                return CompletionHandle::completed();
            };
            lifecycle.draining = Some(Arc::clone(&drained));
            session
        };

        info!(local = %self.local_address(), "Stopping UDP node");
        let _ = session.shutdown.send(true);
        let after = Arc::clone(&self.inner);
        drain_runtime("conduit-udp-drain", session.runtime, Arc::clone(&drained), move || {
            after.link.lock().take();
        });

        Arc::new(CompositeHandle::new(vec![
            session.closed as SharedHandle,
            drained as SharedHandle,
        ]))
    }

    fn destroy(&self) {
        self.stop();
        self.inner.core.destroy();
    }

    /// Send `message` as one datagram to its endpoint.
    ///
    /// # Errors
    ///
    /// [`TransportError::Frame`] when the payload does not fit in a datagram,
    /// [`TransportError::NotConnected`] before the socket is bound, or any
    /// error from the security layer.
    fn send(&self, message: RawMessage) -> Result<SharedHandle, TransportError> {
        let inner = &self.inner;
        inner.core.ensure_live()?;
        if message.len() > inner.max_payload {
            return Err(FrameError::FrameTooLarge {
                len: message.len() as u64,
                max: inner.max_payload,
            }
            .into());
        }

        let outbound = inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(TransportError::NotConnected)?;

        let (payload, peer) = message.into_parts();
        let payload = match &inner.security {
            Some(layer) => layer.seal(&peer, &payload)?,
            None => payload,
        };

        let done = CompletionHandle::pending();
        outbound
            .send(Datagram {
                payload,
                peer,
                done: Arc::clone(&done),
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(done)
    }

    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        self.inner.core.receiver.set(receiver);
    }

    fn local_address(&self) -> Endpoint {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.local.clone())
            .unwrap_or_else(|| self.inner.bind.clone())
    }
}

impl Drop for UdpNodeConnector {
    fn drop(&mut self) {
        if let Some(session) = self.lifecycle.get_mut().session.take() {
            let _ = session.shutdown.send(true);
            session.runtime.shutdown_background();
        }
    }
}

impl NodeInner {
    async fn run(
        self: Arc<Self>,
        bound: Arc<CompletionHandle>,
        _closed: CompleteOnDrop,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let socket = match self.bind_socket().await {
            Ok(socket) => socket,
            Err(e) => {
                warn!("{}", e);
                bound.fail(&e);
                return;
            }
        };
        let local = socket
            .local_addr()
            .map(Endpoint::from)
            .unwrap_or_else(|_| self.bind.clone());

        let (outbound, mut queue) = mpsc::unbounded_channel();
        self.link.lock().replace(Link {
            outbound,
            local: local.clone(),
        });
        info!(local = %local, "UDP node bound");
        bound.complete();

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.accept_datagram(&buf[..len], Endpoint::from(from)),
                    Err(e) => {
                        // ICMP errors from earlier sends surface here on some platforms
                        debug!(local = %local, "Receive failed: {}", e);
                        self.core.stats.record_recv_error();
                    }
                },
                Some(datagram) = queue.recv() => self.transmit(&socket, datagram).await,
            }
        }

        queue.close();
        while let Ok(datagram) = queue.try_recv() {
            datagram.done.fail(TransportError::Closed);
        }
        debug!(local = %local, "UDP node closed");
    }

    async fn bind_socket(&self) -> Result<UdpSocket, TransportError> {
        let fail = |source: io::Error| TransportError::Bind {
            endpoint: self.bind.clone(),
            source,
        };

        let addr: SocketAddr = lookup_host((self.bind.host(), self.bind.port()))
            .await
            .map_err(fail)?
            .next()
            .ok_or_else(|| {
                fail(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "endpoint did not resolve",
                ))
            })?;

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(fail)?;
        if let Some(reuse) = self.core.options.reuse_address() {
            socket.set_reuse_address(reuse).map_err(fail)?;
        }
        self.core
            .options
            .apply_common(&SockRef::from(&socket))
            .map_err(fail)?;
        socket.bind(&addr.into()).map_err(fail)?;
        socket.set_nonblocking(true).map_err(fail)?;

        UdpSocket::from_std(socket.into()).map_err(fail)
    }

    fn accept_datagram(&self, datagram: &[u8], peer: Endpoint) {
        trace!(peer = %peer, len = datagram.len(), "Datagram received");
        let payload = match &self.security {
            Some(layer) => match layer.open(&peer, datagram) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(peer = %peer, "Dropping datagram: {}", e);
                    self.core.stats.record_recv_error();
                    return;
                }
            },
            None => Bytes::copy_from_slice(datagram),
        };
        self.core.deliver(RawMessage::new(payload, peer));
    }

    async fn transmit(&self, socket: &UdpSocket, datagram: Datagram) {
        if datagram.done.is_cancelled() {
            return;
        }
        let Datagram { payload, peer, done } = datagram;
        match socket.send_to(&payload, (peer.host(), peer.port())).await {
            Ok(sent) => {
                trace!(peer = %peer, len = sent, "Datagram sent");
                self.core.stats.record_send(sent);
                done.complete();
            }
            Err(e) => {
                debug!(peer = %peer, "Send failed: {}", e);
                self.core.stats.record_send_error();
                done.fail(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutor;
    use crate::shared::testing::{Inbox, eventually};
    use conduit_core::HandleError;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);
    const MAGIC: u8 = 0xC0;

    /// Toy layer: prefixes a magic byte and flips every payload bit.
    struct Flip;

    impl DatagramSecurity for Flip {
        fn seal(&self, _peer: &Endpoint, payload: &[u8]) -> Result<Bytes, TransportError> {
            let mut sealed = vec![MAGIC];
            sealed.extend(payload.iter().map(|b| !b));
            Ok(Bytes::from(sealed))
        }

        fn open(&self, _peer: &Endpoint, datagram: &[u8]) -> Result<Bytes, TransportError> {
            match datagram.split_first() {
                Some((&MAGIC, rest)) => Ok(rest.iter().map(|b| !b).collect()),
                _ => Err(TransportError::configuration("not sealed")),
            }
        }
    }

    fn node(security: Security, inbox: &Inbox) -> UdpNodeConnector {
        let config = ConnectionConfig {
            transport: crate::config::TransportLayer::Udp,
            role: crate::config::Role::Node,
            endpoint: Endpoint::new("127.0.0.1", 0),
            security,
            callback_executor: Some(Arc::new(InlineExecutor)),
            worker_threads: 1,
            ..ConnectionConfig::default()
        };
        UdpNodeConnector::new(&config, Some(inbox.receiver())).unwrap()
    }

    #[test]
    fn test_nodes_exchange_datagrams() {
        let inbox_a = Inbox::default();
        let inbox_b = Inbox::default();
        let a = node(Security::None, &inbox_a);
        let b = node(Security::None, &inbox_b);
        a.start().unwrap().wait_timeout(WAIT).unwrap();
        b.start().unwrap().wait_timeout(WAIT).unwrap();
        assert!(a.is_bound());
        assert_ne!(b.local_address().port(), 0);

        a.send(RawMessage::new(&b"hello"[..], b.local_address()))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(eventually(|| inbox_b.len() == 1));
        let message = inbox_b.messages().remove(0);
        assert_eq!(&message.payload()[..], b"hello");
        assert_eq!(message.endpoint(), &a.local_address());

        b.send(RawMessage::new(&b"back"[..], message.endpoint().clone()))
            .unwrap();
        assert!(eventually(|| inbox_a.len() == 1));
        assert_eq!(a.stats().messages_sent, 1);
        assert_eq!(a.stats().messages_received, 1);

        assert_eq!(a.stop().wait_timeout(WAIT), Ok(()));
        assert!(!a.is_bound());
        b.destroy();
    }

    #[test]
    fn test_security_layer_seals_and_opens() {
        let inbox_a = Inbox::default();
        let inbox_b = Inbox::default();
        let plain = node(Security::None, &inbox_a);
        let secure = node(Security::Dtls(Arc::new(Flip)), &inbox_b);
        plain.start().unwrap().wait_timeout(WAIT).unwrap();
        secure.start().unwrap().wait_timeout(WAIT).unwrap();
        assert!(secure.is_secure());

        // Sealed on the wire
        secure
            .send(RawMessage::new(&b"\x00\x01"[..], plain.local_address()))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(eventually(|| inbox_a.len() == 1));
        assert_eq!(&inbox_a.messages()[0].payload()[..], &[MAGIC, 0xFF, 0xFE]);

        // Unsealed datagrams are dropped and counted
        plain
            .send(RawMessage::new(&b"raw"[..], secure.local_address()))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(eventually(|| secure.stats().recv_errors == 1));
        assert_eq!(inbox_b.len(), 0);

        // Sealed datagrams are opened before delivery
        plain
            .send(RawMessage::new(vec![MAGIC, 0x9E], secure.local_address()))
            .unwrap();
        assert!(eventually(|| inbox_b.len() == 1));
        assert_eq!(&inbox_b.messages()[0].payload()[..], &[0x61]);

        plain.destroy();
        secure.destroy();
    }

    #[test]
    fn test_send_checks() {
        let inbox = Inbox::default();
        let udp = node(Security::None, &inbox);
        let target = Endpoint::new("127.0.0.1", 9);

        assert!(matches!(
            udp.send(RawMessage::new(&b"x"[..], target.clone())),
            Err(TransportError::NotConnected)
        ));

        udp.start().unwrap().wait_timeout(WAIT).unwrap();
        let err = udp
            .send(RawMessage::new(vec![0u8; MAX_DATAGRAM_SIZE + 1], target))
            .err().unwrap();
        assert!(matches!(
            err,
            TransportError::Frame(FrameError::FrameTooLarge { .. })
        ));
        udp.destroy();
    }

    #[test]
    fn test_bind_conflict() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = ConnectionConfig {
            transport: crate::config::TransportLayer::Udp,
            role: crate::config::Role::Node,
            endpoint: Endpoint::from(taken.local_addr().unwrap()),
            callback_executor: Some(Arc::new(InlineExecutor)),
            worker_threads: 1,
            ..ConnectionConfig::default()
        };
        let udp = UdpNodeConnector::new(&config, None).unwrap();
        assert!(matches!(
            udp.start().unwrap().wait_timeout(WAIT),
            Err(HandleError::Failed(_))
        ));
        assert!(!udp.is_bound());
        udp.destroy();
    }

    #[test]
    fn test_tls_rejected() {
        let config = ConnectionConfig {
            transport: crate::config::TransportLayer::Udp,
            role: crate::config::Role::Node,
            security: Security::Tls(crate::tls::TlsMaterial::new()),
            ..ConnectionConfig::default()
        };
        assert!(UdpNodeConnector::new(&config, None).err().unwrap().is_configuration());
    }
}
