//! # Conduit Transport
//!
//! Connectors that move framed messages over TCP, TLS and UDP.
//!
//! This crate provides:
//! - TCP client and server connectors, with optional TLS
//! - A connectionless UDP node with optional datagram security
//! - A thread-safe start/stop decorator for shared servers
//! - A builder that validates configuration and picks the connector
//! - A callback pool that keeps per-remote notifications ordered
//!
//! ## Example
//!
//! ```no_run
//! use conduit_core::Endpoint;
//! use conduit_transport::{Connector, ConnectorBuilder, Role};
//!
//! let server = ConnectorBuilder::tcp()
//!     .role(Role::Server)
//!     .endpoint(Endpoint::new("127.0.0.1", 9000))
//!     .build()?;
//! let _bound = server.start()?;
//! # Ok::<(), conduit_transport::TransportError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod config;
pub mod connector;
pub mod error;
pub mod executor;
pub mod stats;
pub mod tcp_client;
pub mod tcp_server;
pub mod thread_safe;
pub mod tls;
pub mod udp;

mod channel;
mod shared;

pub use builder::ConnectorBuilder;
pub use channel::ConnectionId;
pub use config::{
    ConnectionConfig, DEFAULT_BACKLOG, OptionValue, Role, Security, TransportLayer,
    TransportOptions, keys,
};
pub use connector::{
    AnyConnector, AnyStatefulConnector, Connector, MessageReceiver, StatefulConnector,
};
pub use error::{TransportError, TransportResult};
pub use executor::{
    CallbackExecutor, CallbackPool, CallbackPoolConfig, ExecutorError, InlineExecutor, PoolStats,
};
pub use stats::TransportStats;
pub use tcp_client::{TcpClientConnector, TlsClientConnector};
pub use tcp_server::{TcpServerConnector, TlsServerConnector};
pub use thread_safe::ThreadSafeConnector;
pub use tls::{ClientCertRequirement, TlsIdentity, TlsMaterial, TlsVersion};
pub use udp::{DatagramSecurity, MAX_DATAGRAM_SIZE, UdpNodeConnector};
