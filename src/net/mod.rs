//! Network plumbing
//!
//! Unifies plain TCP and TLS broker connections behind one stream type and
//! defines the seam to the underlying network interface (WiFi driver on
//! embedded targets, always-up loopback on hosts).

use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig as RustlsConfig, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::config::TlsParams;

/// Error type for TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io(std::io::Error),
    /// Certificate parsing error
    CertificateError(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

/// Certificate verifier that accepts anything; `insecure = true` only
#[derive(Debug)]
struct InsecureVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Load CA certificates from a PEM file into a root store
fn load_ca_certs(path: &str) -> Result<RootCertStore, TlsError> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "No certificates found in {}",
            path
        )));
    }

    let mut root_store = RootCertStore::empty();
    for cert in certs {
        root_store.add(cert).map_err(|e| {
            TlsError::CertificateError(format!("Failed to add CA certificate: {}", e))
        })?;
    }
    Ok(root_store)
}

/// Build a TLS connector from the handshake options
pub fn build_connector(params: &TlsParams) -> Result<TlsConnector, TlsError> {
    let config = if params.insecure {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        RustlsConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier(provider)))
            .with_no_client_auth()
    } else {
        let ca_path = params.ca_file.as_ref().ok_or_else(|| {
            TlsError::ConfigError("ssl_params.ca_file is required unless insecure is set".into())
        })?;
        let root_store = load_ca_certs(ca_path)?;
        RustlsConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// One broker connection, plain or TLS
pub enum NetStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl NetStream {
    /// Open a TCP connection and, when a connector is supplied, run the TLS
    /// handshake with `server_name` for SNI and certificate matching.
    pub async fn open(
        host: &str,
        port: u16,
        tls: Option<(&TlsConnector, &str)>,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        match tls {
            None => Ok(NetStream::Tcp(stream)),
            Some((connector, server_name)) => {
                let name = ServerName::try_from(server_name.to_string())
                    .map_err(|_| std::io::Error::other("invalid TLS server name"))?;
                let tls_stream = connector.connect(name, stream).await?;
                Ok(NetStream::Tls(Box::new(tls_stream)))
            }
        }
    }
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            NetStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            NetStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            NetStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            NetStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// The underlying network interface (WiFi on embedded targets).
///
/// The reconnection supervisor drives this: it refuses to redo CONNECT until
/// the interface reports up again.
#[async_trait]
pub trait NetInterface: Send + Sync {
    /// Current link state
    fn is_up(&self) -> bool;

    /// Bring the interface up for the first time; false on failure
    async fn connect(&self) -> bool;

    /// Re-establish the link after an outage; false to signal "retry later"
    async fn reconnect(&self) -> bool;
}

/// Interface for hosts whose network is managed externally; always up
#[derive(Debug, Default)]
pub struct HostInterface;

#[async_trait]
impl NetInterface for HostInterface {
    fn is_up(&self) -> bool {
        true
    }

    async fn connect(&self) -> bool {
        true
    }

    async fn reconnect(&self) -> bool {
        true
    }
}
