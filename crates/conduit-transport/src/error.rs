//! Transport layer errors.

use crate::executor::ExecutorError;
use conduit_core::{Endpoint, FrameError, RegistryError};
use std::io;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Invalid transport/role/security combination or option value
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Operation not available for this transport (e.g. a stateful UDP connector)
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Address binding failed
    #[error("Failed to bind to {endpoint}: {source}")]
    Bind {
        /// Requested local endpoint
        endpoint: Endpoint,
        /// Underlying error
        source: io::Error,
    },

    /// Outbound connection failed
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        /// Remote endpoint
        endpoint: Endpoint,
        /// Underlying error
        source: io::Error,
    },

    /// TLS material or configuration rejected
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// TLS handshake with a peer failed
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Wire framing violation
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// No live connection for the destination endpoint
    #[error(transparent)]
    UnknownConnection(#[from] RegistryError),

    /// Connector has no live transport to send on
    #[error("Connector is not connected")]
    NotConnected,

    /// `start()` called on a running connector, or before the previous
    /// `stop()` finished draining
    #[error("Connector is already started or still stopping")]
    AlreadyStarted,

    /// Connector used after `destroy()`
    #[error("Connector has been destroyed")]
    Destroyed,

    /// Connection closed before the operation completed
    #[error("Connection is closed")]
    Closed,

    /// Callback executor rejected a task
    #[error("Callback executor error: {0}")]
    Executor(#[from] ExecutorError),
}

impl TransportError {
    /// Configuration error from a message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether this error is raised by configuration validation
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::UnsupportedConfiguration(_)
        )
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Connection is closed");

        let err = TransportError::configuration("UDP does not support TLS");
        assert!(err.to_string().contains("Invalid configuration"));
        assert!(err.is_configuration());

        let err = TransportError::Connect {
            endpoint: Endpoint::new("127.0.0.1", 9),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("127.0.0.1:9"));
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_transport_error_from_core() {
        let err = TransportError::from(FrameError::CorruptedFrame(0xFF));
        assert!(matches!(err, TransportError::Frame(_)));
        assert!(err.to_string().contains("0xFF"));

        let endpoint = Endpoint::new("10.0.0.2", 5684);
        let err = TransportError::from(RegistryError::UnknownConnection(endpoint));
        assert!(matches!(err, TransportError::UnknownConnection(_)));
        assert!(err.to_string().contains("10.0.0.2:5684"));
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = io::Error::other("test");
        let transport_err = TransportError::from(io_err);

        assert!(matches!(transport_err, TransportError::Io(_)));
    }
}
