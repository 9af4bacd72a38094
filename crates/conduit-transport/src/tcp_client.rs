//! TCP client connector with optional TLS.
//!
//! The client owns one outbound connection and the runtime that drives it.
//! `start()` returns immediately; the connect (and handshake) run on the
//! runtime and report through the returned handle and the state listener.
//!
//! ```text
//! start():   Connecting -> Connected [-> TlsHandshakeStarted -> ConnectedSecure]
//!                       \-> Disconnected (connect failed)   \-> TlsHandshakeFailed
//! stop():    Disconnecting -> Disconnected
//! ```

use crate::channel::{ChannelExit, ConnectionHandle, Outbound, run_channel, stopped};
use crate::config::{ConnectionConfig, Security};
use crate::connector::{Connector, MessageReceiver, StatefulConnector};
use crate::error::TransportError;
use crate::shared::{Callbacks, ConnectorCore, drain_runtime};
use crate::stats::TransportStats;
use crate::tls::ClientTls;
use conduit_core::{
    AsyncHandle, CompleteOnDrop, CompletionHandle, CompositeHandle, ConnectionState,
    ConnectionStateListener, DeferredHandle, Endpoint, RawMessage, SharedHandle,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Clone)]
enum ClientSecurity {
    Plain,
    Tls(ClientTls),
}

/// Live connection of the current session
struct Link {
    handle: ConnectionHandle,
    local: Endpoint,
}

/// State shared with the connection task
struct ClientInner {
    remote: Endpoint,
    security: ClientSecurity,
    core: ConnectorCore,
    link: Mutex<Option<Link>>,
}

/// One `start()`..`stop()` session
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

/// Plain TCP client.
pub struct TcpClientConnector {
    inner: Arc<ClientInner>,
    lifecycle: Mutex<Lifecycle>,
}

impl TcpClientConnector {
    pub(crate) fn new(
        config: &ConnectionConfig,
        callbacks: Callbacks,
    ) -> Result<Self, TransportError> {
        Self::with_security(config, callbacks, ClientSecurity::Plain)
    }

    fn with_security(
        config: &ConnectionConfig,
        callbacks: Callbacks,
        security: ClientSecurity,
    ) -> Result<Self, TransportError> {
        let core = ConnectorCore::new(config, callbacks.listener, callbacks.receiver)?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                remote: config.endpoint.clone(),
                security,
                core,
                link: Mutex::new(None),
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// Remote endpoint this client connects to
    pub fn remote(&self) -> &Endpoint {
        &self.inner.remote
    }

    /// Whether a connection is currently established (and secured, with TLS)
    pub fn is_connected(&self) -> bool {
        self.inner
            .link
            .lock()
            .as_ref()
            .is_some_and(|link| !link.handle.is_closed())
    }

    /// Traffic counters
    pub fn stats(&self) -> TransportStats {
        self.inner.core.stats.snapshot()
    }
}

impl Connector for TcpClientConnector {
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
        // Previous session ended on its own (peer close, failed handshake)
        if let Some(stale) = lifecycle.session.take() {
            stale.runtime.shutdown_background();
        }

        let runtime = inner.core.io_runtime("conduit-client-io")?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connected = CompletionHandle::pending();
        let closed = CompletionHandle::pending();
        let handshake = match inner.security {
            ClientSecurity::Plain => None,
            ClientSecurity::Tls(_) => Some(Arc::new(DeferredHandle::new())),
        };

        let notifier = &inner.core.notifier;
        if notifier.state() != ConnectionState::Disconnected {
            notifier.transition(ConnectionState::Disconnected, &inner.remote);
        }
        info!(remote = %inner.remote, "Connecting");
        notifier.transition(ConnectionState::Connecting, &inner.remote);

        let task = runtime.spawn(Arc::clone(inner).run(
            Arc::clone(&connected),
            handshake.clone(),
            CompleteOnDrop::new(Arc::clone(&closed)),
            shutdown_rx,
        ));

        // Cancelling the connect abandons the attempt
        let abort = task.abort_handle();
        let cancelled = Arc::clone(inner);
        let pending_handshake = handshake.clone();
        connected.on_cancel(move || {
            abort.abort();
            if let Some(handshake) = pending_handshake {
                handshake.cancel();
            }
            debug!(remote = %cancelled.remote, "Connect cancelled");
            cancelled
                .core
                .notifier
                .transition(ConnectionState::Disconnected, &cancelled.remote);
        });

        lifecycle.session = Some(Session {
            runtime,
            shutdown,
            closed,
        });
        lifecycle.draining = None;

        Ok(match handshake {
            None => connected as SharedHandle,
            Some(handshake) => Arc::new(CompositeHandle::new(vec![
                connected as SharedHandle,
                handshake as SharedHandle,
            ])),
        })
    }

    fn stop(&self) -> SharedHandle {
        let inner = &self.inner;
        let drained = CompletionHandle::pending();
        let session = {
            let mut lifecycle = self.lifecycle.lock();
            let Some(session) = lifecycle.session.take() else {
                return CompletionHandle::completed();
            };
            lifecycle.draining = Some(Arc::clone(&drained));
            session
        };

        info!(remote = %inner.remote, "Stopping");
        let notifier = &inner.core.notifier;
        if notifier.state().can_transition_to(ConnectionState::Disconnecting) {
            notifier.transition(ConnectionState::Disconnecting, &inner.remote);
        }
        let _ = session.shutdown.send(true);

        let after = Arc::clone(inner);
        drain_runtime("conduit-client-drain", session.runtime, Arc::clone(&drained), move || {
            after.link.lock().take();
            let notifier = &after.core.notifier;
            if notifier.state() != ConnectionState::Disconnected {
                notifier.transition(ConnectionState::Disconnected, &after.remote);
            }
            debug!(remote = %after.remote, "Client drained");
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

    /// Frame and write `message` on the current connection.
    ///
    /// The client has a single peer, so the message endpoint is not consulted.
    fn send(&self, message: RawMessage) -> Result<SharedHandle, TransportError> {
        let core = &self.inner.core;
        core.ensure_live()?;
        let handle = self
            .inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.handle.clone())
            .ok_or(TransportError::NotConnected)?;
        let frame = core.codec.encode_to_bytes(message.payload())?;
        handle.send(frame).inspect_err(|_| core.stats.record_send_error())
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
            .unwrap_or_else(|| Endpoint::new("0.0.0.0", 0))
    }
}

impl StatefulConnector for TcpClientConnector {
    fn connection_state(&self) -> ConnectionState {
        self.inner.core.notifier.state()
    }

    fn set_state_listener(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.inner.core.notifier.set_listener(listener);
    }
}

impl Drop for TcpClientConnector {
    fn drop(&mut self) {
        if let Some(session) = self.lifecycle.get_mut().session.take() {
            let _ = session.shutdown.send(true);
            session.runtime.shutdown_background();
        }
    }
}

impl ClientInner {
    async fn run(
        self: Arc<Self>,
        connected: Arc<CompletionHandle>,
        handshake: Option<Arc<DeferredHandle>>,
        _closed: CompleteOnDrop,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let attempt = tokio::select! {
            _ = stopped(&mut shutdown) => Err(TransportError::Closed),
            attempt = self.connect() => attempt,
        };
        let stream = match attempt {
            Ok(stream) => stream,
            Err(e) => {
                connected.fail(&e);
                if let Some(handshake) = &handshake {
                    handshake.bind(CompletionHandle::failed(&e));
                }
                if !matches!(e, TransportError::Closed) {
                    warn!(remote = %self.remote, "{}", e);
                    self.core
                        .notifier
                        .transition(ConnectionState::Disconnected, &self.remote);
                }
                return;
            }
        };

        let local = stream
            .local_addr()
            .map(Endpoint::from)
            .unwrap_or_else(|_| Endpoint::new("0.0.0.0", 0));
        let (handle, outbound) = ConnectionHandle::new(self.remote.clone());

        match &self.security {
            ClientSecurity::Plain => {
                info!(remote = %self.remote, local = %local, "Connected");
                // Usable before anyone hears about it.
                self.link.lock().replace(Link { handle, local });
                self.core
                    .notifier
                    .transition(ConnectionState::Connected, &self.remote);
                connected.complete();
                self.drive(stream, outbound, shutdown).await;
            }
            ClientSecurity::Tls(tls) => {
                self.core
                    .notifier
                    .transition(ConnectionState::Connected, &self.remote);
                connected.complete();
                let done = CompletionHandle::pending();
                if let Some(handshake) = &handshake {
                    handshake.bind(Arc::clone(&done) as SharedHandle);
                }
                let abandon = Arc::new(Notify::new());
                let wake = Arc::clone(&abandon);
                done.on_cancel(move || wake.notify_one());

                self.core
                    .notifier
                    .transition(ConnectionState::TlsHandshakeStarted, &self.remote);
                let result = tokio::select! {
                    _ = stopped(&mut shutdown) => {
                        done.fail(TransportError::Closed);
                        return;
                    }
                    _ = abandon.notified() => {
                        Err(TransportError::TlsHandshake("handshake cancelled".to_string()))
                    }
                    result = tls.connector().connect(tls.server_name(), stream) => {
                        result.map_err(|e| TransportError::TlsHandshake(e.to_string()))
                    }
                };

                match result {
                    Ok(secure) => {
                        info!(remote = %self.remote, local = %local, "Connected (TLS)");
                        self.link.lock().replace(Link { handle, local });
                        self.core
                            .notifier
                            .transition(ConnectionState::ConnectedSecure, &self.remote);
                        done.complete();
                        self.drive(secure, outbound, shutdown).await;
                    }
                    Err(e) => {
                        warn!(remote = %self.remote, "{}", e);
                        done.fail(&e);
                        self.core
                            .notifier
                            .transition(ConnectionState::TlsHandshakeFailed, &self.remote);
                    }
                }
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let stream = TcpStream::connect((self.remote.host(), self.remote.port()))
            .await
            .map_err(|source| TransportError::Connect {
                endpoint: self.remote.clone(),
                source,
            })?;
        self.core.options.apply_to_stream(&stream)?;
        Ok(stream)
    }

    async fn drive<S>(
        &self,
        stream: S,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        shutdown: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exit = run_channel(stream, &self.remote, &self.core, outbound, shutdown).await;
        self.link.lock().take();
        match exit {
            ChannelExit::Shutdown => {
                debug!(remote = %self.remote, "Connection closed for shutdown")
            }
            exit => {
                info!(remote = %self.remote, "Disconnected: {}", exit);
                self.core
                    .notifier
                    .transition(ConnectionState::Disconnected, &self.remote);
            }
        }
    }
}

/// TCP client that secures its connection with TLS before reporting it
/// usable.
///
/// `start()` returns `Composite[tcp connected, handshake]`; the handshake
/// part is a [`DeferredHandle`] bound once the TCP connection exists.
pub struct TlsClientConnector(TcpClientConnector);

impl TlsClientConnector {
    pub(crate) fn new(
        config: &ConnectionConfig,
        callbacks: Callbacks,
    ) -> Result<Self, TransportError> {
        let Security::Tls(material) = &config.security else {
            return Err(TransportError::configuration("TLS client requires TLS material"));
        };
        let tls = ClientTls::new(material, &config.endpoint)?;
        TcpClientConnector::with_security(config, callbacks, ClientSecurity::Tls(tls)).map(Self)
    }

    /// Remote endpoint this client connects to
    pub fn remote(&self) -> &Endpoint {
        self.0.remote()
    }

    /// Whether the secured connection is established
    pub fn is_connected(&self) -> bool {
        self.0.is_connected()
    }

    /// Traffic counters
    pub fn stats(&self) -> TransportStats {
        self.0.stats()
    }
}

impl Connector for TlsClientConnector {
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

impl StatefulConnector for TlsClientConnector {
    fn connection_state(&self) -> ConnectionState {
        self.0.connection_state()
    }

    fn set_state_listener(&self, listener: Arc<dyn ConnectionStateListener>) {
        self.0.set_state_listener(listener)
    }
}
