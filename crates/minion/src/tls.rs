//! TLS contexts for accepting and dialing sessions
//!
//! Server mode needs a certificate chain and private key. Client mode
//! verifies the server against a CA bundle when one is configured and
//! accepts any certificate otherwise. `plaintext` skips TLS altogether and
//! is meant for loopback use.

use crate::config::MinionSettings;
use crate::{MinionError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

/// Byte stream a session runs over, TLS or not
pub trait SessionIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionIo for T {}

/// Boxed session stream
pub type SessionStream = Box<dyn SessionIo>;

/// How sessions are secured
#[derive(Clone)]
pub enum SecurityContext {
    /// No TLS
    Plaintext,
    /// Accept TLS sessions with our certificate
    Server(TlsAcceptor),
    /// Dial TLS sessions to `server_name`
    Client {
        /// Connector carrying the trust policy
        connector: TlsConnector,
        /// Name presented for SNI and verification
        server_name: ServerName<'static>,
    },
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plaintext => f.write_str("Plaintext"),
            Self::Server(_) => f.write_str("Server"),
            Self::Client { server_name, .. } => {
                f.debug_struct("Client").field("server_name", server_name).finish()
            }
        }
    }
}

impl SecurityContext {
    /// Build the context the settings call for
    pub fn from_settings(settings: &MinionSettings) -> Result<Self> {
        if settings.plaintext {
            warn!("TLS disabled, sessions run in plaintext");
            return Ok(Self::Plaintext);
        }

        if settings.server {
            match (&settings.ssl_cert, &settings.ssl_key) {
                (Some(cert), Some(key)) => Self::server(cert, key),
                _ => Err(MinionError::Config(
                    "server mode requires both ssl_cert and ssl_key".to_string(),
                )),
            }
        } else {
            Self::client(settings.ssl_cert.as_deref(), &settings.host)
        }
    }

    /// Server context from PEM files
    pub fn server(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Self::Server(TlsAcceptor::from(Arc::new(config))))
    }

    /// Client context; without a CA bundle the server is not verified
    pub fn client(ca_bundle: Option<&Path>, host: &str) -> Result<Self> {
        let provider = provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let config = match ca_bundle {
            Some(path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(path)? {
                    roots.add(cert)?;
                }
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            None => {
                warn!("No CA bundle configured, server certificates are not verified");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
                    .with_no_client_auth()
            }
        };

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| MinionError::Config(format!("invalid server name `{}`: {}", host, e)))?;

        Ok(Self::Client {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Secure an accepted socket
    pub async fn accept(&self, tcp: TcpStream) -> Result<SessionStream> {
        match self {
            Self::Plaintext => Ok(Box::new(tcp)),
            Self::Server(acceptor) => {
                let stream = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| MinionError::Tls(e.to_string()))?;
                Ok(Box::new(stream))
            }
            Self::Client { .. } => Err(MinionError::Config(
                "client security context cannot accept sessions".to_string(),
            )),
        }
    }

    /// Secure a dialed socket
    pub async fn connect(&self, tcp: TcpStream) -> Result<SessionStream> {
        match self {
            Self::Plaintext => Ok(Box::new(tcp)),
            Self::Client {
                connector,
                server_name,
            } => {
                let stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| MinionError::Tls(e.to_string()))?;
                Ok(Box::new(stream))
            }
            Self::Server(_) => Err(MinionError::Config(
                "server security context cannot dial sessions".to_string(),
            )),
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(MinionError::Config(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| MinionError::Config(format!("no private key in {}", path.display())))
}

/// Verifier for clients configured without a CA bundle
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
