//! TLS material and rustls configuration.
//!
//! The handshake itself is performed by `tokio-rustls`; this module only
//! turns caller-supplied certificates, keys and policy into rustls client
//! and server configurations, using the `ring` provider.

use crate::error::TransportError;
use conduit_core::Endpoint;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use serde::Deserialize;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Client certificate policy of a TLS server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientCertRequirement {
    /// Do not request a client certificate
    #[default]
    None,
    /// Request one, accept clients without
    Want,
    /// Require one
    Need,
}

/// Enabled TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.2
    #[serde(rename = "TLSv1.2")]
    Tls12,
    /// TLS 1.3
    #[serde(rename = "TLSv1.3")]
    Tls13,
}

impl TlsVersion {
    fn supported(self) -> &'static SupportedProtocolVersion {
        match self {
            Self::Tls12 => &rustls::version::TLS12,
            Self::Tls13 => &rustls::version::TLS13,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls12 => f.write_str("TLSv1.2"),
            Self::Tls13 => f.write_str("TLSv1.3"),
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TLSv1.2" | "1.2" => Ok(Self::Tls12),
            "TLSv1.3" | "1.3" => Ok(Self::Tls13),
            other => Err(TransportError::configuration(format!(
                "unsupported TLS protocol version '{}'",
                other
            ))),
        }
    }
}

/// Certificate chain and private key presented to the peer.
pub struct TlsIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Identity from DER material.
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }

    /// Identity from PEM-encoded certificate chain and private key.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if either input holds no usable item.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TransportError> {
        let cert_chain = parse_certificates(cert_pem)?;
        let private_key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| {
                TransportError::configuration(format!("failed to parse private key: {}", e))
            })?
            .ok_or_else(|| TransportError::configuration("no private key found in PEM input"))?;
        Ok(Self::new(cert_chain, private_key))
    }

    /// Identity from PEM files.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a file cannot be read or parsed.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TransportError> {
        let cert_chain = load_certificates(cert_path)?;

        let key_path = key_path.as_ref();
        let mut reader = open_pem(key_path)?;
        let private_key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| {
                TransportError::configuration(format!(
                    "failed to parse private key {}: {}",
                    key_path.display(),
                    e
                ))
            })?
            .ok_or_else(|| {
                TransportError::configuration(format!(
                    "no private key found in {}",
                    key_path.display()
                ))
            })?;

        Ok(Self::new(cert_chain, private_key))
    }

    /// Certificate chain, leaf first
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("certificates", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>, TransportError> {
    let file = File::open(path).map_err(|e| {
        TransportError::configuration(format!("failed to open {}: {}", path.display(), e))
    })?;
    Ok(BufReader::new(file))
}

/// Parse every certificate in a PEM buffer.
///
/// # Errors
///
/// Returns a configuration error on malformed PEM or when no certificate
/// is present.
pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            TransportError::configuration(format!("failed to parse certificates: {}", e))
        })?;
    if certs.is_empty() {
        return Err(TransportError::configuration("no certificate found in PEM input"));
    }
    Ok(certs)
}

/// Load every certificate from a PEM file.
///
/// # Errors
///
/// Returns a configuration error if the file cannot be read, is malformed,
/// or holds no certificate.
pub fn load_certificates(
    path: impl AsRef<Path>,
) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let path = path.as_ref();
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            TransportError::configuration(format!(
                "failed to parse certificates {}: {}",
                path.display(),
                e
            ))
        })?;
    if certs.is_empty() {
        return Err(TransportError::configuration(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Security context for a TLS connector.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    /// Local certificate and key (required for servers)
    pub identity: Option<TlsIdentity>,
    /// Trust anchors: server roots for clients, client roots for servers
    pub trust_roots: Vec<CertificateDer<'static>>,
    /// Client certificate policy (servers only)
    pub client_cert: ClientCertRequirement,
    /// Enabled protocol versions (empty = rustls defaults)
    pub protocol_versions: Vec<TlsVersion>,
    /// SNI / verification name override (clients only; defaults to the remote host)
    pub server_name: Option<String>,
}

impl TlsMaterial {
    /// Empty material
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local identity.
    #[must_use]
    pub fn with_identity(mut self, identity: TlsIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Add trust anchors.
    #[must_use]
    pub fn with_trust_roots(
        mut self,
        roots: impl IntoIterator<Item = CertificateDer<'static>>,
    ) -> Self {
        self.trust_roots.extend(roots);
        self
    }

    /// Set the client certificate policy.
    #[must_use]
    pub fn with_client_cert(mut self, requirement: ClientCertRequirement) -> Self {
        self.client_cert = requirement;
        self
    }

    /// Restrict protocol versions.
    #[must_use]
    pub fn with_protocol_versions(
        mut self,
        versions: impl IntoIterator<Item = TlsVersion>,
    ) -> Self {
        self.protocol_versions = versions.into_iter().collect();
        self
    }

    /// Override the name used for SNI and certificate verification.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    fn versions(&self) -> Vec<&'static SupportedProtocolVersion> {
        if self.protocol_versions.is_empty() {
            rustls::DEFAULT_VERSIONS.to_vec()
        } else {
            self.protocol_versions.iter().map(|v| v.supported()).collect()
        }
    }

    fn root_store(&self) -> Result<RootCertStore, TransportError> {
        let mut roots = RootCertStore::empty();
        for cert in &self.trust_roots {
            roots.add(cert.clone())?;
        }
        Ok(roots)
    }

    /// Build a rustls client configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for missing trust roots or material rustls rejects.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TransportError> {
        if self.trust_roots.is_empty() {
            return Err(TransportError::configuration(
                "TLS client requires at least one trust root",
            ));
        }

        let builder = ClientConfig::builder_with_provider(Self::provider())
            .with_protocol_versions(&self.versions())?
            .with_root_certificates(self.root_store()?);

        let config = match &self.identity {
            Some(identity) => builder.with_client_auth_cert(
                identity.cert_chain.clone(),
                identity.private_key.clone_key(),
            )?,
            None => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }

    /// Build a rustls server configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for a missing identity, a client certificate policy
    /// without trust roots, or material rustls rejects.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TransportError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| TransportError::configuration("TLS server requires an identity"))?;

        let provider = Self::provider();
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&self.versions())?;

        let builder = match self.client_cert {
            ClientCertRequirement::None => builder.with_no_client_auth(),
            requirement => {
                if self.trust_roots.is_empty() {
                    return Err(TransportError::configuration(
                        "client certificate verification requires trust roots",
                    ));
                }
                let mut verifier =
                    WebPkiClientVerifier::builder_with_provider(
                        Arc::new(self.root_store()?),
                        provider,
                    );
                if requirement == ClientCertRequirement::Want {
                    verifier = verifier.allow_unauthenticated();
                }
                let verifier = verifier.build().map_err(|e| {
                    TransportError::configuration(format!("client certificate verifier: {}", e))
                })?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let config = builder.with_single_cert(
            identity.cert_chain.clone(),
            identity.private_key.clone_key(),
        )?;
        Ok(Arc::new(config))
    }
}

/// Client-side handshake context
#[derive(Clone)]
pub(crate) struct ClientTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl ClientTls {
    pub(crate) fn new(material: &TlsMaterial, remote: &Endpoint) -> Result<Self, TransportError> {
        let name = material
            .server_name
            .clone()
            .unwrap_or_else(|| remote.host().to_string());
        let server_name = ServerName::try_from(name.clone()).map_err(|_| {
            TransportError::configuration(format!("invalid TLS server name '{}'", name))
        })?;

        Ok(Self {
            connector: TlsConnector::from(material.client_config()?),
            server_name,
        })
    }

    pub(crate) fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub(crate) fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

/// Server-side handshake context
#[derive(Clone)]
pub(crate) struct ServerTls {
    acceptor: TlsAcceptor,
}

impl ServerTls {
    pub(crate) fn new(material: &TlsMaterial) -> Result<Self, TransportError> {
        Ok(Self {
            acceptor: TlsAcceptor::from(material.server_config()?),
        })
    }

    pub(crate) fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}
