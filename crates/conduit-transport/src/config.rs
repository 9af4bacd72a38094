//! Connection configuration.
//!
//! A [`ConnectionConfig`] is assembled once (normally through
//! [`ConnectorBuilder`](crate::builder::ConnectorBuilder)), validated, and
//! then only read by the connector built from it.

use crate::error::TransportError;
use crate::executor::CallbackExecutor;
use crate::tls::TlsMaterial;
use crate::udp::DatagramSecurity;
use conduit_core::{DEFAULT_MAX_FRAME_SIZE, Endpoint, Framing};
use serde::Deserialize;
use socket2::{SockRef, Socket};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Transport layer selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportLayer {
    /// Stream transport with length-prefix framing
    #[default]
    Tcp,
    /// Connectionless datagrams
    Udp,
}

impl fmt::Display for TransportLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

/// Role of the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Connectionless peer with no client/server asymmetry (UDP)
    Node,
    /// Initiates a single outbound connection
    #[default]
    Client,
    /// Listens and serves many remotes
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => f.write_str("node"),
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// Security layered over the transport
#[derive(Clone, Default)]
pub enum Security {
    /// Plain transport
    #[default]
    None,
    /// TLS over TCP
    Tls(TlsMaterial),
    /// Datagram security over UDP, supplied by the caller
    Dtls(Arc<dyn DatagramSecurity>),
}

impl Security {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tls(_) => "TLS",
            Self::Dtls(_) => "DTLS",
        }
    }
}

impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Tls(material) => f.debug_tuple("Tls").field(material).finish(),
            Self::Dtls(_) => f.write_str("Dtls(..)"),
        }
    }
}

/// Requested transport, role, and security.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Transport layer
    pub transport: TransportLayer,
    /// Local role
    pub role: Role,
    /// Remote endpoint for clients, bind endpoint for servers and nodes
    pub endpoint: Endpoint,
    /// Security layer
    pub security: Security,
    /// Wrap a server in the thread-safe start/stop decorator
    pub shareable: bool,
    /// Executor for receiver and listener callbacks (a private
    /// [`CallbackPool`](crate::executor::CallbackPool) when unset)
    pub callback_executor: Option<Arc<dyn CallbackExecutor>>,
    /// Socket tuning
    pub options: TransportOptions,
    /// Stream framing variant
    pub framing: Framing,
    /// Largest accepted frame payload
    pub max_frame_size: usize,
    /// I/O worker threads (0 = auto-detect from CPU count)
    pub worker_threads: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportLayer::Tcp,
            role: Role::Client,
            endpoint: Endpoint::new("127.0.0.1", 0),
            security: Security::None,
            shareable: false,
            callback_executor: None,
            options: TransportOptions::default(),
            framing: Framing::VariableLength,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            worker_threads: 0,
        }
    }
}

impl ConnectionConfig {
    /// Resolved I/O worker thread count
    pub fn io_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("transport", &self.transport)
            .field("role", &self.role)
            .field("endpoint", &self.endpoint)
            .field("security", &self.security)
            .field("shareable", &self.shareable)
            .field("callback_executor", &self.callback_executor.is_some())
            .field("options", &self.options)
            .field("framing", &self.framing)
            .field("max_frame_size", &self.max_frame_size)
            .field("worker_threads", &self.worker_threads)
            .finish()
    }
}

/// Recognized transport option keys
pub mod keys {
    /// `SO_KEEPALIVE` (bool)
    pub const KEEP_ALIVE: &str = "keep_alive";
    /// `TCP_NODELAY` (bool)
    pub const NO_DELAY: &str = "no_delay";
    /// Listen backlog (int)
    pub const BACKLOG: &str = "backlog";
    /// `SO_REUSEADDR` (bool)
    pub const REUSE_ADDRESS: &str = "reuse_address";
    /// `SO_RCVBUF` in bytes (int)
    pub const RECV_BUFFER_SIZE: &str = "recv_buffer_size";
    /// `SO_SNDBUF` in bytes (int)
    pub const SEND_BUFFER_SIZE: &str = "send_buffer_size";
    /// `SO_LINGER` in seconds (int)
    pub const LINGER_SECS: &str = "linger_secs";

    pub(crate) const BOOL_KEYS: [&str; 3] = [KEEP_ALIVE, NO_DELAY, REUSE_ADDRESS];
    pub(crate) const INT_KEYS: [&str; 4] =
        [BACKLOG, RECV_BUFFER_SIZE, SEND_BUFFER_SIZE, LINGER_SECS];
}

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Transport option value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Flag
    Bool(bool),
    /// Integer
    Int(i64),
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

/// Key/value socket tuning applied when sockets are created.
///
/// Unknown keys are kept but ignored (with a warning) so configurations can
/// carry options meant for other transports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct TransportOptions(BTreeMap<String, OptionValue>);

impl TransportOptions {
    /// Empty option set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, returning the previous value.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<OptionValue>,
    ) -> Option<OptionValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Raw value for `key`
    pub fn get(&self, key: &str) -> Option<OptionValue> {
        self.0.get(key).copied()
    }

    /// Whether no option is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over all options in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, OptionValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    fn flag(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            OptionValue::Bool(b) => Some(b),
            OptionValue::Int(_) => None,
        }
    }

    fn int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            OptionValue::Int(i) => Some(i),
            OptionValue::Bool(_) => None,
        }
    }

    /// `keep_alive`
    pub fn keep_alive(&self) -> Option<bool> {
        self.flag(keys::KEEP_ALIVE)
    }

    /// `no_delay`
    pub fn no_delay(&self) -> Option<bool> {
        self.flag(keys::NO_DELAY)
    }

    /// `reuse_address`
    pub fn reuse_address(&self) -> Option<bool> {
        self.flag(keys::REUSE_ADDRESS)
    }

    /// `backlog`, or [`DEFAULT_BACKLOG`]
    pub fn backlog(&self) -> u32 {
        self.int(keys::BACKLOG)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(DEFAULT_BACKLOG)
    }

    /// `recv_buffer_size`
    pub fn recv_buffer_size(&self) -> Option<usize> {
        self.int(keys::RECV_BUFFER_SIZE)
            .and_then(|v| usize::try_from(v).ok())
    }

    /// `send_buffer_size`
    pub fn send_buffer_size(&self) -> Option<usize> {
        self.int(keys::SEND_BUFFER_SIZE)
            .and_then(|v| usize::try_from(v).ok())
    }

    /// `linger_secs`
    pub fn linger(&self) -> Option<Duration> {
        self.int(keys::LINGER_SECS)
            .and_then(|v| u64::try_from(v).ok())
            .map(Duration::from_secs)
    }

    /// Check value types and ranges of recognized keys.
    ///
    /// # Errors
    ///
    /// [`TransportError::Configuration`] for a recognized key with the wrong
    /// type or a negative size.
    pub fn validate(&self) -> Result<(), TransportError> {
        for (key, value) in self.iter() {
            if keys::BOOL_KEYS.contains(&key) {
                if !matches!(value, OptionValue::Bool(_)) {
                    return Err(TransportError::configuration(format!(
                        "transport option '{}' expects a boolean",
                        key
                    )));
                }
            } else if keys::INT_KEYS.contains(&key) {
                match value {
                    OptionValue::Int(v) if v >= 0 && v <= i64::from(i32::MAX) => {}
                    _ => {
                        return Err(TransportError::configuration(format!(
                            "transport option '{}' expects a non-negative integer",
                            key
                        )));
                    }
                }
            } else {
                warn!("Ignoring unknown transport option '{}'", key);
            }
        }
        Ok(())
    }

    /// Apply socket-level options shared by every socket kind.
    pub(crate) fn apply_common(&self, socket: &SockRef<'_>) -> std::io::Result<()> {
        if let Some(size) = self.recv_buffer_size() {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size() {
            socket.set_send_buffer_size(size)?;
        }
        Ok(())
    }

    /// Apply options to a listening socket before `bind`.
    pub(crate) fn apply_to_listener(&self, socket: &Socket) -> std::io::Result<()> {
        socket.set_reuse_address(self.reuse_address().unwrap_or(true))?;
        self.apply_common(&SockRef::from(socket))
    }

    /// Apply options to a connected stream.
    pub(crate) fn apply_to_stream(&self, stream: &tokio::net::TcpStream) -> std::io::Result<()> {
        if let Some(no_delay) = self.no_delay() {
            stream.set_nodelay(no_delay)?;
        }
        let socket = SockRef::from(stream);
        if let Some(keep_alive) = self.keep_alive() {
            socket.set_keepalive(keep_alive)?;
        }
        if let Some(linger) = self.linger() {
            socket.set_linger(Some(linger))?;
        }
        self.apply_common(&socket)
    }
}

impl<K: Into<String>, V: Into<OptionValue>> FromIterator<(K, V)> for TransportOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.transport, TransportLayer::Tcp);
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.framing, Framing::VariableLength);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(!config.shareable);
        assert!(config.io_threads() >= 1);
    }

    #[test]
    fn test_options_typed_accessors() {
        let options = TransportOptions::new()
            .with(keys::KEEP_ALIVE, true)
            .with(keys::NO_DELAY, false)
            .with(keys::BACKLOG, 128i64)
            .with(keys::LINGER_SECS, 5i64);

        assert_eq!(options.keep_alive(), Some(true));
        assert_eq!(options.no_delay(), Some(false));
        assert_eq!(options.backlog(), 128);
        assert_eq!(options.linger(), Some(Duration::from_secs(5)));
        assert_eq!(options.recv_buffer_size(), None);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_options_default_backlog() {
        assert_eq!(TransportOptions::new().backlog(), DEFAULT_BACKLOG);
    }

    #[test]
    fn test_options_validate_rejects_wrong_type() {
        let options = TransportOptions::new().with(keys::NO_DELAY, 1i64);
        assert!(matches!(
            options.validate(),
            Err(TransportError::Configuration(_))
        ));

        let options = TransportOptions::new().with(keys::RECV_BUFFER_SIZE, -1i64);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_options_unknown_key_is_ignored() {
        let options = TransportOptions::new().with("so_priority", 6i64);
        assert!(options.validate().is_ok());
        assert_eq!(options.get("so_priority"), Some(OptionValue::Int(6)));
    }

    #[test]
    fn test_options_deserialize() {
        let options: TransportOptions =
            toml::from_str("keep_alive = true\nbacklog = 64\n").unwrap();
        assert_eq!(options.keep_alive(), Some(true));
        assert_eq!(options.backlog(), 64);
    }

    #[test]
    fn test_options_from_iter() {
        let options: TransportOptions = [(keys::REUSE_ADDRESS, false)].into_iter().collect();
        assert_eq!(options.reuse_address(), Some(false));
    }
}
