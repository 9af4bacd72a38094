//! Connector builder and compatibility matrix.
//!
//! | Transport | Security   | Roles          | Notes                                   |
//! |-----------|------------|----------------|-----------------------------------------|
//! | TCP       | none, TLS  | client, server | servers may be `shareable`              |
//! | UDP       | none, DTLS | node           | no lifecycle: `build_stateful` rejects  |
//!
//! Validation runs to completion before anything is allocated: a build
//! either returns a fully configured connector or a configuration error,
//! never a half-built one.

use crate::config::{
    ConnectionConfig, OptionValue, Role, Security, TransportLayer, TransportOptions,
};
use crate::connector::{AnyConnector, AnyStatefulConnector, MessageReceiver};
use crate::error::TransportError;
use crate::executor::CallbackExecutor;
use crate::shared::Callbacks;
use crate::tcp_client::{TcpClientConnector, TlsClientConnector};
use crate::tcp_server::{TcpServerConnector, TlsServerConnector};
use crate::thread_safe::ThreadSafeConnector;
use crate::tls::{ClientCertRequirement, TlsMaterial};
use crate::udp::{DatagramSecurity, UdpNodeConnector};
use conduit_core::{ConnectionStateListener, Endpoint, Framing, MAX_FRAME_LENGTH};
use std::sync::Arc;
use tracing::info;

/// Builds connectors from a validated [`ConnectionConfig`].
///
/// # Examples
///
/// ```no_run
/// use conduit_transport::{Connector, ConnectorBuilder, Role};
/// use conduit_core::AsyncHandle;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = ConnectorBuilder::tcp()
///     .role(Role::Server)
///     .endpoint("127.0.0.1:9000".parse::<conduit_core::Endpoint>()?)
///     .option("no_delay", true)
///     .build()?;
/// server.start()?.wait()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct ConnectorBuilder {
    config: ConnectionConfig,
    callbacks: Callbacks,
}

impl ConnectorBuilder {
    /// Builder with the default configuration (TCP client)
    pub fn new() -> Self {
        Self::default()
    }

    /// TCP builder (client role until changed)
    pub fn tcp() -> Self {
        Self::for_transport(TransportLayer::Tcp)
    }

    /// UDP builder (node role)
    pub fn udp() -> Self {
        Self::for_transport(TransportLayer::Udp).role(Role::Node)
    }

    /// Builder for `transport`
    pub fn for_transport(transport: TransportLayer) -> Self {
        Self::from_config(ConnectionConfig {
            transport,
            ..ConnectionConfig::default()
        })
    }

    /// Builder starting from an existing configuration
    pub fn from_config(config: ConnectionConfig) -> Self {
        Self {
            config,
            callbacks: Callbacks::default(),
        }
    }

    /// Configuration as assembled so far
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Local role.
    #[must_use]
    pub fn role(mut self, role: Role) -> Self {
        self.config.role = role;
        self
    }

    /// Remote endpoint (clients) or bind endpoint (servers, nodes).
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<Endpoint>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// Security layer.
    #[must_use]
    pub fn security(mut self, security: Security) -> Self {
        self.config.security = security;
        self
    }

    /// TLS over TCP.
    #[must_use]
    pub fn tls(self, material: TlsMaterial) -> Self {
        self.security(Security::Tls(material))
    }

    /// Datagram security over UDP.
    #[must_use]
    pub fn dtls(self, layer: Arc<dyn DatagramSecurity>) -> Self {
        self.security(Security::Dtls(layer))
    }

    /// Wrap a server in [`ThreadSafeConnector`].
    #[must_use]
    pub fn shareable(mut self, shareable: bool) -> Self {
        self.config.shareable = shareable;
        self
    }

    /// Executor for receiver and listener callbacks.
    #[must_use]
    pub fn callback_executor(mut self, executor: Arc<dyn CallbackExecutor>) -> Self {
        self.config.callback_executor = Some(executor);
        self
    }

    /// Set one transport option.
    #[must_use]
    pub fn option(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.config.options.set(key, value);
        self
    }

    /// Replace all transport options.
    #[must_use]
    pub fn options(mut self, options: TransportOptions) -> Self {
        self.config.options = options;
        self
    }

    /// Stream framing variant.
    #[must_use]
    pub fn framing(mut self, framing: Framing) -> Self {
        self.config.framing = framing;
        self
    }

    /// Largest accepted frame payload.
    #[must_use]
    pub fn max_frame_size(mut self, max: usize) -> Self {
        self.config.max_frame_size = max;
        self
    }

    /// I/O worker threads (0 = one per CPU).
    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    /// Initial connection state listener (TCP only).
    #[must_use]
    pub fn state_listener(mut self, listener: Arc<dyn ConnectionStateListener>) -> Self {
        self.callbacks.listener = Some(listener);
        self
    }

    /// Initial inbound message receiver.
    #[must_use]
    pub fn receiver(mut self, receiver: Arc<dyn MessageReceiver>) -> Self {
        self.callbacks.receiver = Some(receiver);
        self
    }

    /// Check the configuration against the compatibility matrix.
    ///
    /// # Errors
    ///
    /// [`TransportError::Configuration`] describing the first violation.
    pub fn validate(&self) -> Result<(), TransportError> {
        let config = &self.config;
        match config.transport {
            TransportLayer::Tcp => {
                if matches!(config.security, Security::Dtls(_)) {
                    return Err(TransportError::configuration("DTLS is not supported over TCP"));
                }
                match config.role {
                    Role::Node => {
                        return Err(TransportError::configuration(
                            "TCP does not support the node role",
                        ));
                    }
                    Role::Client if config.shareable => {
                        return Err(TransportError::configuration(
                            "only servers can be shareable",
                        ));
                    }
                    Role::Client | Role::Server => {}
                }
            }
            TransportLayer::Udp => {
                if matches!(config.security, Security::Tls(_)) {
                    return Err(TransportError::configuration(
                        "TLS is not supported over UDP, use DTLS",
                    ));
                }
                if config.role != Role::Node {
                    return Err(TransportError::configuration(format!(
                        "UDP supports only the node role, not {}",
                        config.role
                    )));
                }
                if config.shareable {
                    return Err(TransportError::configuration("UDP nodes cannot be shareable"));
                }
                if self.callbacks.listener.is_some() {
                    return Err(TransportError::configuration(
                        "UDP has no connection state to listen to",
                    ));
                }
            }
        }

        if let Security::Tls(material) = &config.security {
            validate_tls(material, config.role)?;
        }

        if config.max_frame_size == 0 || config.max_frame_size > MAX_FRAME_LENGTH {
            return Err(TransportError::configuration(format!(
                "max_frame_size must be between 1 and {}",
                MAX_FRAME_LENGTH
            )));
        }
        if config.role == Role::Client && config.endpoint.port() == 0 {
            return Err(TransportError::configuration(format!(
                "client endpoint {} has no port",
                config.endpoint
            )));
        }
        config.options.validate()
    }

    /// Validate and build any connector.
    ///
    /// # Errors
    ///
    /// Configuration errors from [`validate`](Self::validate), TLS material
    /// rustls rejects, or failure to create the callback pool.
    pub fn build(self) -> Result<AnyConnector, TransportError> {
        self.validate()?;
        let Self { config, callbacks } = self;
        log_build(&config);
        match config.transport {
            TransportLayer::Udp => {
                UdpNodeConnector::new(&config, callbacks.receiver).map(AnyConnector::UdpNode)
            }
            TransportLayer::Tcp => build_tcp(&config, callbacks).map(AnyConnector::from),
        }
    }

    /// Validate and build a connector with a connection lifecycle.
    ///
    /// # Errors
    ///
    /// [`TransportError::UnsupportedConfiguration`] for UDP, otherwise as
    /// [`build`](Self::build).
    pub fn build_stateful(self) -> Result<AnyStatefulConnector, TransportError> {
        if self.config.transport == TransportLayer::Udp {
            return Err(TransportError::UnsupportedConfiguration(
                "UDP is connectionless and has no stateful connector".to_string(),
            ));
        }
        self.validate()?;
        let Self { config, callbacks } = self;
        log_build(&config);
        build_tcp(&config, callbacks)
    }
}

fn validate_tls(material: &TlsMaterial, role: Role) -> Result<(), TransportError> {
    match role {
        Role::Client => {
            if material.client_cert != ClientCertRequirement::None {
                return Err(TransportError::configuration(
                    "client certificate policy applies to servers only",
                ));
            }
            if material.trust_roots.is_empty() {
                return Err(TransportError::configuration(
                    "TLS client requires at least one trust root",
                ));
            }
        }
        Role::Server => {
            if material.identity.is_none() {
                return Err(TransportError::configuration("TLS server requires an identity"));
            }
            if material.client_cert != ClientCertRequirement::None
                && material.trust_roots.is_empty()
            {
                return Err(TransportError::configuration(
                    "client certificate verification requires trust roots",
                ));
            }
        }
        Role::Node => {
            return Err(TransportError::configuration("TLS requires a client or server role"));
        }
    }
    Ok(())
}

fn build_tcp(
    config: &ConnectionConfig,
    callbacks: Callbacks,
) -> Result<AnyStatefulConnector, TransportError> {
    let tls = matches!(config.security, Security::Tls(_));
    Ok(match (config.role, tls, config.shareable) {
        (Role::Client, false, _) => {
            AnyStatefulConnector::TcpClient(TcpClientConnector::new(config, callbacks)?)
        }
        (Role::Client, true, _) => {
            AnyStatefulConnector::TlsClient(TlsClientConnector::new(config, callbacks)?)
        }
        (Role::Server, false, false) => {
            AnyStatefulConnector::TcpServer(TcpServerConnector::new(config, callbacks)?)
        }
        (Role::Server, true, false) => {
            AnyStatefulConnector::TlsServer(TlsServerConnector::new(config, callbacks)?)
        }
        (Role::Server, false, true) => AnyStatefulConnector::SharedServer(ThreadSafeConnector::new(
            TcpServerConnector::new(config, callbacks)?,
        )),
        (Role::Server, true, true) => AnyStatefulConnector::SharedServer(ThreadSafeConnector::new(
            TlsServerConnector::new(config, callbacks)?.into_inner(),
        )),
        (Role::Node, ..) => {
            return Err(TransportError::configuration("TCP does not support the node role"));
        }
    })
}

fn log_build(config: &ConnectionConfig) {
    info!(
        transport = %config.transport,
        role = %config.role,
        security = config.security.name(),
        endpoint = %config.endpoint,
        "Building connector"
    );
}
