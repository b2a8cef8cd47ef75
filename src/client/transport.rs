//! TLS transport to the management server.
//!
//! Every connection attempt reloads the [`TrustStore`] so a refreshed
//! revocation list takes effect without a restart.

use crate::config::ManagementConfig;
use crate::crypto::trust::TrustStore;
use crate::crypto::verifier::ManagementCertVerifier;
use crate::GatesyncError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rustls::crypto::ring::cipher_suite;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Byte stream carrying the management protocol.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed stream handed from a [`Connector`] to the session.
pub type BoxedStream = Box<dyn AsyncStream>;

/// ring provider restricted to AES-GCM suites, AES-256 preferred.
static MANAGEMENT_PROVIDER: Lazy<Arc<CryptoProvider>> = Lazy::new(|| {
    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites = vec![
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ];
    Arc::new(provider)
});

/// Crypto provider used for the management connection.
pub fn management_provider() -> Arc<CryptoProvider> {
    MANAGEMENT_PROVIDER.clone()
}

/// Build the rustls client configuration for one attempt.
pub fn client_config(
    config: &ManagementConfig,
    trust: TrustStore,
) -> Result<ClientConfig, GatesyncError> {
    let provider = management_provider();
    let verifier = ManagementCertVerifier::new(trust, config.authenticated, provider.clone());

    let tls = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| GatesyncError::Tls(format!("Failed to build TLS config: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(tls)
}

fn map_handshake_error(err: std::io::Error) -> GatesyncError {
    let inner = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match inner {
        Some(rustls::Error::InvalidCertificate(cert_err)) => {
            GatesyncError::CertificateRejected(format!("{:?}", cert_err))
        }
        _ => GatesyncError::Tls(format!("TLS handshake failed: {}", err)),
    }
}

/// Open a TLS connection to the management server.
///
/// TCP connect and the TLS handshake are each bounded by
/// `connect_timeout`.
pub async fn connect_tls(
    config: &ManagementConfig,
    trust: TrustStore,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, GatesyncError> {
    let host = config.server_address.as_str();
    let port = config.server_port;

    // 1. Server name for SNI
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| GatesyncError::ConfigError(format!("Invalid server name {}: {}", host, e)))?;

    // 2. TCP
    debug!(host, port, "connecting to management server");
    let tcp = timeout(config.connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| GatesyncError::Timeout(format!("TCP connect to {}:{}", host, port)))?
        .map_err(|e| GatesyncError::Transport(format!("Connect to {}:{} failed: {}", host, port, e)))?;
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }

    // 3. TLS
    let connector = TlsConnector::from(Arc::new(client_config(config, trust)?));
    let tls = timeout(config.connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| GatesyncError::Timeout(format!("TLS handshake with {}", host)))?
        .map_err(map_handshake_error)?;

    info!(host, port, "management transport established");
    Ok(tls)
}

/// Source of management transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new transport.
    async fn connect(&self) -> Result<BoxedStream, GatesyncError>;
}

/// Connects over TLS using the management configuration.
#[derive(Debug, Clone)]
pub struct TlsManagementConnector {
    config: ManagementConfig,
}

impl TlsManagementConnector {
    /// Create a connector.
    pub fn new(config: ManagementConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TlsManagementConnector {
    async fn connect(&self) -> Result<BoxedStream, GatesyncError> {
        let trust = TrustStore::load(
            &self.config.trusted_digests,
            self.config.revoked_digests_file.as_deref(),
        )
        .await?;
        let stream = connect_tls(&self.config, trust).await?;
        Ok(Box::new(stream))
    }
}
