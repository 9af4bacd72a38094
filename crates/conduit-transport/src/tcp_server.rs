//! TCP server connector with optional TLS.
//!
//! A "boss" runtime runs the accept loop; accepted connections are driven
//! on a separate "workers" runtime. Every live remote has an entry in the
//! [`ConnectionRegistry`], added when it is accepted and removed when its
//! transport closes, so `send` can route by destination endpoint.
//!
//! The connector's own state tracks only the listening socket. Remotes are
//! reported as per-endpoint events:
//!
//! ```text
//! NewIncomingConnect [-> TlsHandshakeStarted -> ConnectedSecure | TlsHandshakeFailed]
//!                    -> NewIncomingDisconnect
//! ```

use crate::channel::{ConnectionHandle, reject_queued, run_channel, stopped};
use crate::config::{ConnectionConfig, Security};
use crate::connector::{Connector, MessageReceiver, StatefulConnector};
use crate::error::TransportError;
use crate::shared::{Callbacks, ConnectorCore, DRAIN_TIMEOUT, drain_runtime};
use crate::stats::TransportStats;
use crate::tls::ServerTls;
use conduit_core::{
    AsyncHandle, CompleteOnDrop, CompletionHandle, CompositeHandle, ConnectionRegistry,
    ConnectionState, ConnectionStateListener, Endpoint, RawMessage, SharedHandle,
};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone)]
enum ServerSecurity {
    Plain,
    Tls(ServerTls),
}

struct ServerInner {
    bind: Endpoint,
    security: ServerSecurity,
    core: ConnectorCore,
    registry: ConnectionRegistry<ConnectionHandle>,
    bound: Mutex<Option<Endpoint>>,
}

struct Session {
    boss: Runtime,
    workers: Runtime,
    shutdown: watch::Sender<bool>,
    listener_closed: Arc<CompletionHandle>,
}

#[derive(Default)]
struct Lifecycle {
    session: Option<Session>,
    draining: Option<SharedHandle>,
}

/// Plain TCP server serving many remotes.
pub struct TcpServerConnector {
    inner: Arc<ServerInner>,
    lifecycle: Mutex<Lifecycle>,
}

impl TcpServerConnector {
    pub(crate) fn new(
        config: &ConnectionConfig,
        callbacks: Callbacks,
    ) -> Result<Self, TransportError> {
        Self::with_security(config, callbacks, ServerSecurity::Plain)
    }

    fn with_security(
        config: &ConnectionConfig,
        callbacks: Callbacks,
        security: ServerSecurity,
    ) -> Result<Self, TransportError> {
        let core = ConnectorCore::new(config, callbacks.listener, callbacks.receiver)?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                bind: config.endpoint.clone(),
                security,
                core,
                registry: ConnectionRegistry::new(),
                bound: Mutex::new(None),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Endpoints of the currently connected remotes
    pub fn connected_remotes(&self) -> Vec<Endpoint> {
        self.inner.registry.endpoints()
    }

    /// Number of currently connected remotes
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether `remote` is currently connected
    pub fn is_connected(&self, remote: &Endpoint) -> bool {
        self.inner.registry.contains(remote)
    }

    /// Traffic counters across all remotes
    pub fn stats(&self) -> TransportStats {
        self.inner.core.stats.snapshot()
    }

    /// Whether connections are secured with TLS
    pub fn is_secure(&self) -> bool {
        matches!(self.inner.security, ServerSecurity::Tls(_))
    }
}

impl Connector for TcpServerConnector {
    /// Bind and start accepting.
    ///
    /// The handle completes once the listening socket is bound. With TLS the
    /// handshake is per remote and reported through the listener.
    fn start(&self) -> Result<SharedHandle, TransportError> {
        let inner = &self.inner;
        inner.core.ensure_live()?;

        let mut lifecycle = self.lifecycle.lock();
        if let Some(session) = &lifecycle.session {
            if !session.listener_closed.is_done() {
                return Err(TransportError::AlreadyStarted);
            }
        }
        if lifecycle.draining.as_ref().is_some_and(|d| !d.is_done()) {
            return Err(TransportError::AlreadyStarted);
        }
        // Previous bind failed; its runtimes have nothing left to run
        if let Some(stale) = lifecycle.session.take() {
            stale.boss.shutdown_background();
            stale.workers.shutdown_background();
        }

        let boss = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("conduit-boss")
            .enable_all()
            .build()?;
        let workers = inner.core.io_runtime("conduit-worker")?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let bound = CompletionHandle::pending();
        let listener_closed = CompletionHandle::pending();

        let notifier = &inner.core.notifier;
        if notifier.state() != ConnectionState::Disconnected {
            notifier.transition(ConnectionState::Disconnected, &inner.bind);
        }
        notifier.transition(ConnectionState::Connecting, &inner.bind);

        boss.spawn(Arc::clone(inner).accept_loop(
            Arc::clone(&bound),
            CompleteOnDrop::new(Arc::clone(&listener_closed)),
            shutdown_rx,
            workers.handle().clone(),
        ));

        lifecycle.session = Some(Session {
            boss,
            workers,
            shutdown,
            listener_closed,
        });
        lifecycle.draining = None;
        Ok(bound)
    }

    /// Close the listener and every connection.
    ///
    /// Returns `Composite[listener closed, workers drained, boss drained]`.
    fn stop(&self) -> SharedHandle {
        let inner = &self.inner;
        let workers_drained = CompletionHandle::pending();
        let boss_drained = CompletionHandle::pending();
        let handle: SharedHandle;
        let session = {
            let mut lifecycle = self.lifecycle.lock();
            let Some(session) = lifecycle.session.take() else {
                return CompletionHandle::completed();
            };
            handle = Arc::new(CompositeHandle::new(vec![
                Arc::clone(&session.listener_closed) as SharedHandle,
                Arc::clone(&workers_drained) as SharedHandle,
                Arc::clone(&boss_drained) as SharedHandle,
            ]));
            lifecycle.draining = Some(Arc::clone(&handle));
            session
        };

        let local = self.local_address();
        info!(local = %local, "Stopping server");
        let notifier = &inner.core.notifier;
        if notifier.state().can_transition_to(ConnectionState::Disconnecting) {
            notifier.transition(ConnectionState::Disconnecting, &local);
        }
        let _ = session.shutdown.send(true);

        // Boss first so nothing new lands on the workers, then the workers
        let after = Arc::clone(inner);
        let workers = session.workers;
        drain_runtime("conduit-server-drain", session.boss, boss_drained, move || {
            workers.shutdown_timeout(DRAIN_TIMEOUT);
            let leftover = after.registry.drain();
            if !leftover.is_empty() {
                debug!("Dropped {} connections still registered", leftover.len());
            }
            workers_drained.complete();

            after.bound.lock().take();
            let notifier = &after.core.notifier;
            if notifier.state() != ConnectionState::Disconnected {
                notifier.transition(ConnectionState::Disconnected, &local);
            }
            info!(local = %local, "Server stopped");
        });

        handle
    }

    fn destroy(&self) {
        self.stop();
        self.inner.core.destroy();
    }

    /// Frame `message` and queue it on the connection for its endpoint.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnknownConnection`] when no live connection is
    /// registered for the endpoint; nothing is written in that case.
    fn send(&self, message: RawMessage) -> Result<SharedHandle, TransportError> {
        let core = &self.inner.core;
        core.ensure_live()?;
        let handle = self.inner.registry.lookup(message.endpoint())?;
        let frame = core.codec.encode_to_bytes(message.payload())?;
        handle.send(frame).inspect_err(|_| core.stats.record_send_error())
    }

    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        self.inner.core.receiver.set(receiver);
    }

    fn local_address(&self) -> Endpoint {
        self.inner
            .bound
            .lock()
            .clone()
            .unwrap_or_else(|| self.inner.bind.clone())
    }
}

impl StatefulConnector for TcpServerConnector {
    /// State of the listening socket.
    fn connection_state(&self) -> ConnectionState {
        self.inner.core.notifier.state()
    }

    fn set_state_listener(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.inner.core.notifier.set_listener(listener);
    }
}

impl Drop for TcpServerConnector {
    fn drop(&mut self) {
        if let Some(session) = self.lifecycle.get_mut().session.take() {
            let _ = session.shutdown.send(true);
            session.boss.shutdown_background();
            session.workers.shutdown_background();
        }
    }
}

impl ServerInner {
    async fn accept_loop(
        self: Arc<Self>,
        bound: Arc<CompletionHandle>,
        _closed: CompleteOnDrop,
        mut shutdown: watch::Receiver<bool>,
        workers: Handle,
    ) {
        let listener = match self.listen().await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("{}", e);
                bound.fail(&e);
                self.core
                    .notifier
                    .transition(ConnectionState::Disconnected, &self.bind);
                return;
            }
        };

        let local = listener
            .local_addr()
            .map(Endpoint::from)
            .unwrap_or_else(|_| self.bind.clone());
        self.bound.lock().replace(local.clone());
        info!(local = %local, "Listening");
        self.core
            .notifier
            .transition(ConnectionState::Connected, &local);
        bound.complete();

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let peer = Endpoint::from(addr);
                        workers.spawn(Arc::clone(&self).serve(stream, peer, shutdown.clone()));
                    }
                    Err(e) => {
                        warn!(local = %local, "Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        debug!(local = %local, "Listener closed");
    }

    async fn listen(&self) -> Result<TcpListener, TransportError> {
        let fail = |source: io::Error| TransportError::Bind {
            endpoint: self.bind.clone(),
            source,
        };

        let addr = lookup_host((self.bind.host(), self.bind.port()))
            .await
            .map_err(fail)?
            .next()
            .ok_or_else(|| {
                fail(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "endpoint did not resolve",
                ))
            })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(fail)?;
        self.core.options.apply_to_listener(&socket).map_err(fail)?;
        socket.bind(&addr.into()).map_err(fail)?;
        let backlog = i32::try_from(self.core.options.backlog()).unwrap_or(i32::MAX);
        socket.listen(backlog).map_err(fail)?;
        socket.set_nonblocking(true).map_err(fail)?;

        TcpListener::from_std(socket.into()).map_err(fail)
    }

    async fn serve(
        self: Arc<Self>,
        stream: TcpStream,
        peer: Endpoint,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(e) = self.core.options.apply_to_stream(&stream) {
            debug!(peer = %peer, "Failed to apply socket options: {}", e);
        }
        let (handle, outbound) = ConnectionHandle::new(peer.clone());
        let id = handle.id();

        debug!(peer = %peer, "Accepted {}", id);
        if self.registry.register(peer.clone(), handle).is_some() {
            debug!(peer = %peer, "Replaced stale connection");
        }
        self.core
            .notifier
            .emit(ConnectionState::NewIncomingConnect, &peer);

        match &self.security {
            ServerSecurity::Plain => {
                let exit = run_channel(stream, &peer, &self.core, outbound, shutdown).await;
                debug!(peer = %peer, "{} closed: {}", id, exit);
            }
            ServerSecurity::Tls(tls) => {
                self.core
                    .notifier
                    .emit(ConnectionState::TlsHandshakeStarted, &peer);
                let accepted = tokio::select! {
                    _ = stopped(&mut shutdown) => None,
                    accepted = tls.acceptor().accept(stream) => Some(accepted),
                };
                match accepted {
                    Some(Ok(secure)) => {
                        debug!(peer = %peer, "TLS established");
                        self.core
                            .notifier
                            .emit(ConnectionState::ConnectedSecure, &peer);
                        let exit = run_channel(secure, &peer, &self.core, outbound, shutdown).await;
                        debug!(peer = %peer, "{} closed: {}", id, exit);
                    }
                    Some(Err(e)) => {
                        warn!(peer = %peer, "TLS handshake failed: {}", e);
                        self.core
                            .notifier
                            .emit(ConnectionState::TlsHandshakeFailed, &peer);
                        reject_queued(outbound);
                    }
                    None => reject_queued(outbound),
                }
            }
        }

        self.registry.unregister_if(&peer, |current| current.id() == id);
        self.core
            .notifier
            .emit(ConnectionState::NewIncomingDisconnect, &peer);
    }
}

/// TCP server that secures every accepted connection with TLS.
///
/// Messages are only read from and written to a remote once its handshake
/// has completed; sends queued before that are written afterwards, or fail
/// if the handshake does.
pub struct TlsServerConnector(TcpServerConnector);

impl TlsServerConnector {
    pub(crate) fn new(
        config: &ConnectionConfig,
        callbacks: Callbacks,
    ) -> Result<Self, TransportError> {
        let Security::Tls(material) = &config.security else {
            return Err(TransportError::configuration("TLS server requires TLS material"));
        };
        let tls = ServerTls::new(material)?;
        TcpServerConnector::with_security(config, callbacks, ServerSecurity::Tls(tls)).map(Self)
    }

    /// Underlying server, for wrapping in another decorator
    pub(crate) fn into_inner(self) -> TcpServerConnector {
        self.0
    }

    /// Endpoints of the currently connected remotes
    pub fn connected_remotes(&self) -> Vec<Endpoint> {
        self.0.connected_remotes()
    }

    /// Number of currently connected remotes
    pub fn connection_count(&self) -> usize {
        self.0.connection_count()
    }

    /// Whether `remote` is currently connected
    pub fn is_connected(&self, remote: &Endpoint) -> bool {
        self.0.is_connected(remote)
    }

    /// Traffic counters across all remotes
    pub fn stats(&self) -> TransportStats {
        self.0.stats()
    }
}

impl Connector for TlsServerConnector {
    fn start(&self) -> Result<SharedHandle, TransportError> {
        self.0.start()
    }

    fn stop(&self) -> SharedHandle {
        self.0.stop()
    }

    fn destroy(&self) {
        self.0.destroy()
    }

    fn send(&self, message: RawMessage) -> Result<SharedHandle, TransportError> {
        self.0.send(message)
    }

    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        self.0.set_receiver(receiver)
    }

    fn local_address(&self) -> Endpoint {
        self.0.local_address()
    }
}

impl StatefulConnector for TlsServerConnector {
    fn connection_state(&self) -> ConnectionState {
        self.0.connection_state()
    }

    fn set_state_listener(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.0.set_state_listener(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;
    use crate::executor::InlineExecutor;
    use crate::shared::testing::{Inbox, StateLog, eventually};
    use crate::tcp_client::{TcpClientConnector, TlsClientConnector};
    use crate::tls::TlsMaterial;
    use crate::tls::tests::self_signed;
    use conduit_core::{FrameCodec, HandleError};
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    const WAIT: Duration = Duration::from_secs(10);

    fn server_config() -> ConnectionConfig {
        ConnectionConfig {
            endpoint: Endpoint::new("127.0.0.1", 0),
            callback_executor: Some(Arc::new(InlineExecutor)),
            worker_threads: 2,
            ..ConnectionConfig::default()
        }
    }

    fn started_server(log: &StateLog, inbox: &Inbox) -> TcpServerConnector {
        let server = TcpServerConnector::new(
            &server_config(),
            Callbacks {
                listener: Some(log.listener()),
                receiver: Some(inbox.receiver()),
            },
        )
        .unwrap();
        server.start().unwrap().wait_timeout(WAIT).unwrap();
        server
    }

    fn connect_std(server: &TcpServerConnector) -> StdTcpStream {
        let addr = server.local_address().socket_addr().unwrap();
        let stream = StdTcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        stream
    }

    #[test]
    fn test_bind_reports_local_address() {
        let log = StateLog::default();
        let server = started_server(&log, &Inbox::default());
        assert_ne!(server.local_address().port(), 0);
        assert_eq!(server.connection_state(), ConnectionState::Connected);
        assert_eq!(
            log.states(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        server.stop().wait_timeout(WAIT).unwrap();
        assert!(eventually(|| server.connection_state() == ConnectionState::Disconnected));
    }

    #[test]
    fn test_receive_and_reply_by_endpoint() {
        let log = StateLog::default();
        let inbox = Inbox::default();
        let server = started_server(&log, &inbox);
        let mut remote = connect_std(&server);
        let remote_endpoint = Endpoint::from(remote.local_addr().unwrap());

        remote.write_all(b"\x05hello").unwrap();
        assert!(eventually(|| inbox.len() == 1));
        let message = inbox.messages().remove(0);
        assert_eq!(&message.payload()[..], b"hello");
        assert_eq!(message.endpoint(), &remote_endpoint);
        assert!(server.is_connected(&remote_endpoint));

        server
            .send(RawMessage::new(&b"world"[..], remote_endpoint.clone()))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        let mut reply = [0u8; 6];
        remote.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"\x05world");

        drop(remote);
        assert!(eventually(|| server.connection_count() == 0));
        assert!(eventually(|| log.contains(ConnectionState::NewIncomingDisconnect)));
        let remote_events: Vec<_> = log
            .events()
            .into_iter()
            .filter(|info| info.state().is_remote_event())
            .collect();
        assert_eq!(remote_events.len(), 2);
        assert!(remote_events.iter().all(|info| info.endpoint() == &remote_endpoint));
        // Remote events leave the listening socket state alone
        assert_eq!(server.connection_state(), ConnectionState::Connected);

        server.destroy();
    }

    #[test]
    fn test_send_to_unknown_endpoint() {
        let server = started_server(&StateLog::default(), &Inbox::default());
        let err = server
            .send(RawMessage::new(&b"x"[..], Endpoint::new("127.0.0.1", 9)))
            .err().unwrap();
        assert!(matches!(err, TransportError::UnknownConnection(_)));
        assert_eq!(server.stats().send_errors, 0);
        server.destroy();
    }

    #[test]
    fn test_corrupted_frame_closes_only_that_connection() {
        let inbox = Inbox::default();
        let server = started_server(&StateLog::default(), &inbox);
        let mut good = connect_std(&server);
        let mut bad = connect_std(&server);
        assert!(eventually(|| server.connection_count() == 2));

        bad.write_all(&[0xFF, 0x00]).unwrap();
        assert!(eventually(|| server.connection_count() == 1));
        let mut buf = [0u8; 1];
        assert_eq!(bad.read(&mut buf).unwrap_or(0), 0);

        good.write_all(b"\x02ok").unwrap();
        assert!(eventually(|| inbox.len() == 1));
        assert_eq!(server.stats().recv_errors, 1);
        server.destroy();
    }

    #[test]
    fn test_stop_closes_connections() {
        let log = StateLog::default();
        let server = started_server(&log, &Inbox::default());
        let mut remote = connect_std(&server);
        assert!(eventually(|| server.connection_count() == 1));

        let stopped = server.stop();
        assert_eq!(stopped.wait_timeout(WAIT), Ok(()));
        assert_eq!(server.connection_count(), 0);
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).unwrap_or(0), 0);

        let states: Vec<_> = log
            .states()
            .into_iter()
            .filter(|state| !state.is_remote_event())
            .collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected,
            ]
        );

        // Restartable after a full drain
        server.start().unwrap().wait_timeout(WAIT).unwrap();
        server.destroy();
    }

    #[test]
    fn test_bind_conflict_fails_start_handle() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = server_config();
        config.endpoint = Endpoint::from(taken.local_addr().unwrap());
        config.options = config.options.with(keys::REUSE_ADDRESS, false);

        let log = StateLog::default();
        let server = TcpServerConnector::new(
            &config,
            Callbacks {
                listener: Some(log.listener()),
                receiver: None,
            },
        )
        .unwrap();
        assert!(matches!(
            server.start().unwrap().wait_timeout(WAIT),
            Err(HandleError::Failed(_))
        ));
        assert!(eventually(|| log.contains(ConnectionState::Disconnected)));
        server.destroy();
    }

    #[test]
    fn test_client_and_server_exchange() {
        let server_inbox = Inbox::default();
        let server = started_server(&StateLog::default(), &server_inbox);

        let client_inbox = Inbox::default();
        let client = TcpClientConnector::new(
            &ConnectionConfig {
                endpoint: server.local_address(),
                ..server_config()
            },
            Callbacks {
                listener: None,
                receiver: Some(client_inbox.receiver()),
            },
        )
        .unwrap();
        client.start().unwrap().wait_timeout(WAIT).unwrap();

        let payload = vec![0xAB; 70_000];
        client
            .send(RawMessage::new(payload.clone(), server.local_address()))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(eventually(|| server_inbox.len() == 1));
        let received = server_inbox.messages().remove(0);
        assert_eq!(&received.payload()[..], &payload[..]);

        server
            .send(RawMessage::new(&b"ack"[..], received.endpoint().clone()))
            .unwrap();
        assert!(eventually(|| client_inbox.len() == 1));

        client.destroy();
        server.destroy();
    }

    #[test]
    fn test_tls_server_and_client() {
        let (identity, root) = self_signed();
        let server_log = StateLog::default();
        let server_inbox = Inbox::default();
        let server = TlsServerConnector::new(
            &ConnectionConfig {
                security: Security::Tls(TlsMaterial::new().with_identity(identity)),
                ..server_config()
            },
            Callbacks {
                listener: Some(server_log.listener()),
                receiver: Some(server_inbox.receiver()),
            },
        )
        .unwrap();
        server.start().unwrap().wait_timeout(WAIT).unwrap();
        let port = server.local_address().port();

        let client_log = StateLog::default();
        let client = TlsClientConnector::new(
            &ConnectionConfig {
                endpoint: Endpoint::new("localhost", port),
                security: Security::Tls(TlsMaterial::new().with_trust_roots([root])),
                ..server_config()
            },
            Callbacks {
                listener: Some(client_log.listener()),
                receiver: None,
            },
        )
        .unwrap();
        client.start().unwrap().wait_timeout(WAIT).unwrap();
        assert!(client.is_connected());
        assert_eq!(
            client_log.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::TlsHandshakeStarted,
                ConnectionState::ConnectedSecure,
            ]
        );

        client
            .send(RawMessage::new(&b"secret"[..], client.remote().clone()))
            .unwrap()
            .wait_timeout(WAIT)
            .unwrap();
        assert!(eventually(|| server_inbox.len() == 1));
        assert_eq!(&server_inbox.messages()[0].payload()[..], b"secret");
        assert!(eventually(|| server_log.contains(ConnectionState::ConnectedSecure)));
        assert_eq!(server.connection_count(), 1);

        client.destroy();
        server.destroy();
    }

    #[test]
    fn test_tls_handshake_failure_with_wrong_roots() {
        let (identity, _) = self_signed();
        let (_, unrelated_root) = self_signed();
        let server_log = StateLog::default();
        let server = TlsServerConnector::new(
            &ConnectionConfig {
                security: Security::Tls(TlsMaterial::new().with_identity(identity)),
                ..server_config()
            },
            Callbacks {
                listener: Some(server_log.listener()),
                receiver: None,
            },
        )
        .unwrap();
        server.start().unwrap().wait_timeout(WAIT).unwrap();

        let client_log = StateLog::default();
        let client = TlsClientConnector::new(
            &ConnectionConfig {
                endpoint: Endpoint::new("localhost", server.local_address().port()),
                security: Security::Tls(TlsMaterial::new().with_trust_roots([unrelated_root])),
                ..server_config()
            },
            Callbacks {
                listener: Some(client_log.listener()),
                receiver: None,
            },
        )
        .unwrap();

        assert!(matches!(
            client.start().unwrap().wait_timeout(WAIT),
            Err(HandleError::Failed(_))
        ));
        assert!(eventually(|| client_log.contains(ConnectionState::TlsHandshakeFailed)));
        assert_eq!(
            client_log.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::TlsHandshakeStarted,
                ConnectionState::TlsHandshakeFailed,
            ]
        );
        assert!(!client.is_connected());

        // The server drops the remote again
        assert!(eventually(|| server_log.contains(ConnectionState::NewIncomingDisconnect)));
        assert!(eventually(|| server.connection_count() == 0));

        client.destroy();
        server.destroy();
    }

    #[test]
    fn test_four_byte_framing() {
        let inbox = Inbox::default();
        let server = TcpServerConnector::new(
            &ConnectionConfig {
                framing: conduit_core::Framing::FourByte,
                ..server_config()
            },
            Callbacks {
                listener: None,
                receiver: Some(inbox.receiver()),
            },
        )
        .unwrap();
        server.start().unwrap().wait_timeout(WAIT).unwrap();

        let mut remote = connect_std(&server);
        let mut wire = bytes::BytesMut::new();
        FrameCodec::four_byte().encode(b"abc", &mut wire).unwrap();
        remote.write_all(&wire).unwrap();

        assert!(eventually(|| inbox.len() == 1));
        assert_eq!(&inbox.messages()[0].payload()[..], b"abc");
        server.destroy();
    }
}
