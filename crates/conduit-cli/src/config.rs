//! Configuration file for the Conduit CLI.

use conduit_core::{Endpoint, Framing, MAX_FRAME_LENGTH};
use conduit_transport::{
    ClientCertRequirement, ConnectorBuilder, Role, TlsIdentity, TlsMaterial, TlsVersion,
    TransportLayer, TransportOptions, tls::load_certificates,
};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Conduit configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Transport configuration
    pub transport: TransportConfig,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport layer (`tcp` or `udp`)
    pub layer: TransportLayer,
    /// Remote endpoint for clients, bind endpoint for servers and nodes
    pub endpoint: String,
    /// Stream framing (`variable` or `four-byte`)
    pub framing: String,
    /// Largest accepted frame payload in bytes
    pub max_frame_size: usize,
    /// I/O worker threads (0 = one per CPU)
    pub worker_threads: usize,
    /// Allow concurrent start/stop of a server
    pub shareable: bool,
    /// Socket options (`no_delay`, `keep_alive`, `backlog`, ...)
    pub options: TransportOptions,
}

/// TLS configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable TLS (TCP only)
    pub enabled: bool,
    /// PEM certificate chain presented to the peer
    pub cert: Option<PathBuf>,
    /// PEM private key matching `cert`
    pub key: Option<PathBuf>,
    /// PEM files holding trust anchors
    pub trust_roots: Vec<PathBuf>,
    /// Client certificate policy for servers (`none`, `want`, `need`)
    pub client_cert: ClientCertRequirement,
    /// Enabled protocol versions (`TLSv1.2`, `TLSv1.3`)
    pub protocol_versions: Vec<TlsVersion>,
    /// Name used for SNI and verification (defaults to the remote host)
    pub server_name: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `tracing` filter directive
    pub level: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            layer: TransportLayer::Tcp,
            endpoint: "127.0.0.1:7400".to_string(),
            framing: "variable".to_string(),
            max_frame_size: conduit_core::DEFAULT_MAX_FRAME_SIZE,
            worker_threads: 0,
            shareable: false,
            options: TransportOptions::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Load `path` when given, defaults otherwise
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Parse the configured endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not `host:port`.
    pub fn parse_endpoint(&self) -> anyhow::Result<Endpoint> {
        parse_endpoint(&self.transport.endpoint)
    }

    /// Parse the configured framing variant
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown variant name.
    pub fn parse_framing(&self) -> anyhow::Result<Framing> {
        match self.transport.framing.to_lowercase().as_str() {
            "variable" | "variable-length" => Ok(Framing::VariableLength),
            "four-byte" | "fixed" => Ok(Framing::FourByte),
            other => anyhow::bail!(
                "Invalid framing: {}. Must be one of: variable, four-byte",
                other
            ),
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_endpoint()?;
        self.parse_framing()?;

        if self.transport.max_frame_size == 0 || self.transport.max_frame_size > MAX_FRAME_LENGTH {
            anyhow::bail!("max_frame_size must be between 1 and {}", MAX_FRAME_LENGTH);
        }

        if self.transport.worker_threads > 1024 {
            anyhow::bail!("worker_threads must be at most 1024");
        }

        if self.tls.enabled {
            if self.transport.layer == TransportLayer::Udp {
                anyhow::bail!("TLS is only available over TCP");
            }
            if self.tls.cert.is_some() != self.tls.key.is_some() {
                anyhow::bail!("TLS cert and key must be configured together");
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Load the TLS material named by the `[tls]` section
    ///
    /// # Errors
    ///
    /// Returns an error if a PEM file cannot be read or parsed.
    pub fn tls_material(&self) -> anyhow::Result<TlsMaterial> {
        let tls = &self.tls;
        let mut material = TlsMaterial::new()
            .with_client_cert(tls.client_cert)
            .with_protocol_versions(tls.protocol_versions.iter().copied());

        if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
            material = material.with_identity(TlsIdentity::from_pem_files(cert, key)?);
        }
        for path in &tls.trust_roots {
            material = material.with_trust_roots(load_certificates(path)?);
        }
        if let Some(name) = &tls.server_name {
            material = material.with_server_name(name.clone());
        }
        Ok(material)
    }

    /// Map this configuration onto a connector builder for `role`.
    ///
    /// `endpoint` overrides the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint, framing, or TLS material is invalid.
    pub fn builder(&self, role: Role, endpoint: Option<&str>) -> anyhow::Result<ConnectorBuilder> {
        let endpoint = match endpoint {
            Some(text) => parse_endpoint(text)?,
            None => self.parse_endpoint()?,
        };

        let mut builder = ConnectorBuilder::for_transport(self.transport.layer)
            .role(role)
            .endpoint(endpoint)
            .framing(self.parse_framing()?)
            .max_frame_size(self.transport.max_frame_size)
            .worker_threads(self.transport.worker_threads)
            .options(self.transport.options.clone())
            .shareable(self.transport.shareable && role == Role::Server);

        if self.tls.enabled {
            builder = builder.tls(self.tls_material()?);
        }
        Ok(builder)
    }
}

/// Parse `host:port`
///
/// # Errors
///
/// Returns an error if the text is not a valid endpoint.
pub fn parse_endpoint(text: &str) -> anyhow::Result<Endpoint> {
    Ok(text.parse::<Endpoint>()?)
}
