//! Connector contracts.
//!
//! Every connector is driven through [`Connector`]; those with a connection
//! lifecycle (everything TCP) also implement [`StatefulConnector`]. The
//! builder hands back the closed enums [`AnyConnector`] and
//! [`AnyStatefulConnector`], so which variants exist is known at compile
//! time and every dispatch is an exhaustive `match`.
//!
//! All operations return immediately. Outcomes arrive through the returned
//! handles, the state listener, and the message receiver.

use crate::error::TransportError;
use crate::tcp_client::{TcpClientConnector, TlsClientConnector};
use crate::tcp_server::{TcpServerConnector, TlsServerConnector};
use crate::thread_safe::ThreadSafeConnector;
use crate::udp::UdpNodeConnector;
use conduit_core::{ConnectionState, ConnectionStateListener, Endpoint, RawMessage, SharedHandle};
use std::sync::Arc;

/// Receives decoded inbound messages.
pub trait MessageReceiver: Send + Sync {
    /// Called once per message, in arrival order for a given connection.
    fn receive(&self, message: RawMessage);
}

impl<F> MessageReceiver for F
where
    F: Fn(RawMessage) + Send + Sync,
{
    fn receive(&self, message: RawMessage) {
        self(message)
    }
}

/// Transport endpoint abstraction.
pub trait Connector: Send + Sync {
    /// Begin establishing the transport (and TLS when configured).
    ///
    /// The handle completes once the transport is fully usable.
    ///
    /// # Errors
    ///
    /// Fails synchronously when already started, destroyed, or when the
    /// I/O runtime cannot be created.
    fn start(&self) -> Result<SharedHandle, TransportError>;

    /// Begin graceful shutdown.
    ///
    /// The handle completes when every sub-resource has been released.
    /// Stopping a connector that is not running returns a completed handle.
    fn stop(&self) -> SharedHandle;

    /// Stop and release everything; the connector is unusable afterwards.
    fn destroy(&self);

    /// Frame and write `message`.
    ///
    /// # Errors
    ///
    /// Local failures (no connection for the destination, payload too
    /// large, not started) are returned here and never attempted as I/O.
    fn send(&self, message: RawMessage) -> Result<SharedHandle, TransportError>;

    /// Register the inbound message receiver, replacing any previous one.
    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>);

    /// Local endpoint. Servers and nodes report the bound address once
    /// started, otherwise the configured one. Clients report the local side
    /// of the live connection, or the unspecified address without one.
    fn local_address(&self) -> Endpoint;
}

/// Connector with a connection lifecycle.
pub trait StatefulConnector: Connector {
    /// Last recorded state.
    ///
    /// Advisory only: it may be stale by the time it is read. Use the
    /// listener to observe transitions.
    fn connection_state(&self) -> ConnectionState;

    /// Register the state listener, replacing any previous one. There is no
    /// replay of earlier transitions.
    fn set_state_listener(&self, listener: Arc<dyn ConnectionStateListener>);
}

/// Any connector the builder can produce.
pub enum AnyConnector {
    /// Plain TCP client
    TcpClient(TcpClientConnector),
    /// TLS client
    TlsClient(TlsClientConnector),
    /// Plain TCP server
    TcpServer(TcpServerConnector),
    /// TLS server
    TlsServer(TlsServerConnector),
    /// Server (plain or TLS) behind the thread-safe decorator
    SharedServer(ThreadSafeConnector<TcpServerConnector>),
    /// Connectionless UDP node
    UdpNode(UdpNodeConnector),
}

/// Any connector with a connection lifecycle.
pub enum AnyStatefulConnector {
    /// Plain TCP client
    TcpClient(TcpClientConnector),
    /// TLS client
    TlsClient(TlsClientConnector),
    /// Plain TCP server
    TcpServer(TcpServerConnector),
    /// TLS server
    TlsServer(TlsServerConnector),
    /// Server (plain or TLS) behind the thread-safe decorator
    SharedServer(ThreadSafeConnector<TcpServerConnector>),
}

macro_rules! dispatch_any {
    ($self:ident, $c:ident => $body:expr) => {
        match $self {
            AnyConnector::TcpClient($c) => $body,
            AnyConnector::TlsClient($c) => $body,
            AnyConnector::TcpServer($c) => $body,
            AnyConnector::TlsServer($c) => $body,
            AnyConnector::SharedServer($c) => $body,
            AnyConnector::UdpNode($c) => $body,
        }
    };
}

macro_rules! dispatch_stateful {
    ($self:ident, $c:ident => $body:expr) => {
        match $self {
            AnyStatefulConnector::TcpClient($c) => $body,
            AnyStatefulConnector::TlsClient($c) => $body,
            AnyStatefulConnector::TcpServer($c) => $body,
            AnyStatefulConnector::TlsServer($c) => $body,
            AnyStatefulConnector::SharedServer($c) => $body,
        }
    };
}

impl AnyConnector {
    /// Variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TcpClient(_) => "tcp-client",
            Self::TlsClient(_) => "tls-client",
            Self::TcpServer(_) => "tcp-server",
            Self::TlsServer(_) => "tls-server",
            Self::SharedServer(_) => "shared-server",
            Self::UdpNode(_) => "udp-node",
        }
    }

    /// Stateful view, if this connector has a connection lifecycle.
    pub fn as_stateful(&self) -> Option<&dyn StatefulConnector> {
        match self {
            Self::TcpClient(c) => Some(c),
            Self::TlsClient(c) => Some(c),
            Self::TcpServer(c) => Some(c),
            Self::TlsServer(c) => Some(c),
            Self::SharedServer(c) => Some(c),
            Self::UdpNode(_) => None,
        }
    }
}

impl Connector for AnyConnector {
    fn start(&self) -> Result<SharedHandle, TransportError> {
        dispatch_any!(self, c => c.start())
    }

    fn stop(&self) -> SharedHandle {
        dispatch_any!(self, c => c.stop())
    }

    fn destroy(&self) {
        dispatch_any!(self, c => c.destroy())
    }

    fn send(&self, message: RawMessage) -> Result<SharedHandle, TransportError> {
        dispatch_any!(self, c => c.send(message))
    }

    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        dispatch_any!(self, c => c.set_receiver(receiver))
    }

    fn local_address(&self) -> Endpoint {
        dispatch_any!(self, c => c.local_address())
    }
}

impl AnyStatefulConnector {
    /// Variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TcpClient(_) => "tcp-client",
            Self::TlsClient(_) => "tls-client",
            Self::TcpServer(_) => "tcp-server",
            Self::TlsServer(_) => "tls-server",
            Self::SharedServer(_) => "shared-server",
        }
    }
}

impl Connector for AnyStatefulConnector {
    fn start(&self) -> Result<SharedHandle, TransportError> {
        dispatch_stateful!(self, c => c.start())
    }

    fn stop(&self) -> SharedHandle {
        dispatch_stateful!(self, c => c.stop())
    }

    fn destroy(&self) {
        dispatch_stateful!(self, c => c.destroy())
    }

    fn send(&self, message: RawMessage) -> Result<SharedHandle, TransportError> {
        dispatch_stateful!(self, c => c.send(message))
    }

    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        dispatch_stateful!(self, c => c.set_receiver(receiver))
    }

    fn local_address(&self) -> Endpoint {
        dispatch_stateful!(self, c => c.local_address())
    }
}

impl StatefulConnector for AnyStatefulConnector {
    fn connection_state(&self) -> ConnectionState {
        dispatch_stateful!(self, c => c.connection_state())
    }

    fn set_state_listener(&self, listener: Arc<dyn ConnectionStateListener>) {
        dispatch_stateful!(self, c => c.set_state_listener(listener))
    }
}

impl From<AnyStatefulConnector> for AnyConnector {
    fn from(connector: AnyStatefulConnector) -> Self {
        match connector {
            AnyStatefulConnector::TcpClient(c) => Self::TcpClient(c),
            AnyStatefulConnector::TlsClient(c) => Self::TlsClient(c),
            AnyStatefulConnector::TcpServer(c) => Self::TcpServer(c),
            AnyStatefulConnector::TlsServer(c) => Self::TlsServer(c),
            AnyStatefulConnector::SharedServer(c) => Self::SharedServer(c),
        }
    }
}
