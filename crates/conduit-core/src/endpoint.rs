//! Endpoint addressing and raw message values.

use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// A `(host, port)` pair identifying one side of a connection.
///
/// The host is kept as text so that names (used for TLS server-name
/// indication) survive until resolution. Endpoints built from a socket
/// address always carry the canonical textual form of the IP, so two
/// endpoints for the same peer compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint from a host name or IP literal and a port.
    ///
    /// IP literals are canonicalized (`"::0001"` becomes `"::1"`).
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = match host.parse::<IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => host,
        };
        Self { host, port }
    }

    /// Host name or IP literal
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The socket address, if the host is an IP literal.
    ///
    /// Names are not resolved here; resolution belongs to the transport.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error returned when parsing an endpoint from text fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint '{0}': expected host:port")]
pub struct ParseEndpointError(String);

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseEndpointError(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ParseEndpointError(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ParseEndpointError(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

/// Application payload plus the remote endpoint it came from or goes to.
///
/// Inbound messages carry the source endpoint, outbound messages the
/// destination endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    payload: Bytes,
    endpoint: Endpoint,
}

impl RawMessage {
    /// Create a message for `endpoint`.
    pub fn new(payload: impl Into<Bytes>, endpoint: Endpoint) -> Self {
        Self {
            payload: payload.into(),
            endpoint,
        }
    }

    /// Message bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Source (inbound) or destination (outbound) endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Split into payload and endpoint.
    pub fn into_parts(self) -> (Bytes, Endpoint) {
        (self.payload, self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("127.0.0.1", 5684).to_string(), "127.0.0.1:5684");
        assert_eq!(Endpoint::new("::1", 5684).to_string(), "[::1]:5684");
        assert_eq!(Endpoint::new("localhost", 80).to_string(), "localhost:80");
    }

    #[test]
    fn test_endpoint_from_socket_addr_matches_new() {
        let addr: SocketAddr = "[::0001]:9000".parse().unwrap();
        assert_eq!(Endpoint::from(addr), Endpoint::new("::1", 9000));
        assert_eq!(Endpoint::new("0:0:0:0:0:0:0:1", 9000), Endpoint::new("::1", 9000));
    }

    #[test]
    fn test_endpoint_parse() {
        let ep: Endpoint = "127.0.0.1:40000".parse().unwrap();
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.port(), 40000);

        let ep: Endpoint = "[::1]:443".parse().unwrap();
        assert_eq!(ep.host(), "::1");

        let ep: Endpoint = "example.com:5684".parse().unwrap();
        assert_eq!(ep.host(), "example.com");
        assert!(ep.socket_addr().is_none());

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_raw_message_parts() {
        let ep = Endpoint::new("10.1.2.3", 1);
        let msg = RawMessage::new(&b"hello"[..], ep.clone());
        assert_eq!(msg.len(), 5);
        assert!(!msg.is_empty());
        assert_eq!(msg.endpoint(), &ep);

        let (payload, endpoint) = msg.into_parts();
        assert_eq!(&payload[..], b"hello");
        assert_eq!(endpoint, ep);
    }
}
